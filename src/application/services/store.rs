//! Versioned, validating store for projects, nodes, mappings and formulas.
//!
//! The store is the single source of truth. It is partitioned by project;
//! each partition serializes writes (single writer) while readers receive
//! immutable snapshots, so a long traversal never observes a torn write.
//! Every mutation validates the affected invariants on a private copy of
//! the state and swaps it in only on success — a rejected write leaves the
//! prior state untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::error::ApplicationResult;
use crate::application::services::formula_engine;
use crate::config::Settings;
use crate::domain::entities::{
    MappingAttrs, MappingId, Node, NodeAttrs, NodeId, NodePatch, Project, ProjectId, SourceCoords,
    SourceMapping, MAX_LEVELS,
};
use crate::domain::error::DomainError;
use crate::domain::formula::{FormulaExpr, FormulaGroup, FormulaRule, FormulaTerm, RawExpr, RawTerm};
use crate::infrastructure::traits::ChangeSink;

/// Immutable snapshot of one project's complete state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: Project,
    pub nodes: BTreeMap<NodeId, Node>,
    pub mappings: BTreeMap<MappingId, SourceMapping>,
    pub formula_groups: BTreeMap<String, FormulaGroup>,
    /// Increments on every successful write.
    pub version: u64,
    pub modified_at: DateTime<Utc>,
}

impl ProjectState {
    fn new(project: Project) -> Self {
        Self {
            project,
            nodes: BTreeMap::new(),
            mappings: BTreeMap::new(),
            formula_groups: BTreeMap::new(),
            version: 0,
            modified_at: Utc::now(),
        }
    }

    /// Children of `id`, ordered by (sort_order, id).
    pub fn children_of(&self, id: &NodeId) -> Vec<&Node> {
        let mut children: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.parent_id.as_ref() == Some(id))
            .collect();
        children.sort_by_key(|n| (n.sort_order, n.id.clone()));
        children
    }

    pub fn has_children(&self, id: &NodeId) -> bool {
        self.nodes.values().any(|n| n.parent_id.as_ref() == Some(id))
    }

    /// Mappings directly on `id`, ordered by (mapping_index, precedence_group).
    pub fn mappings_of(&self, id: &NodeId) -> Vec<&SourceMapping> {
        let mut mappings: Vec<&SourceMapping> = self
            .mappings
            .values()
            .filter(|m| &m.node_id == id)
            .collect();
        mappings.sort_by(|a, b| {
            (a.mapping_index, &a.precedence_group).cmp(&(b.mapping_index, &b.precedence_group))
        });
        mappings
    }

    /// Nodes whose display name equals `name`.
    pub fn nodes_named(&self, name: &str) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.name == name).collect()
    }

    /// All formula rules across all groups, with their group name.
    pub fn all_rules(&self) -> impl Iterator<Item = (&str, &FormulaRule)> {
        self.formula_groups
            .values()
            .flat_map(|g| g.rules.iter().map(move |r| (g.name.as_str(), r)))
    }

    /// Walk from `start` toward the root; reaching `target` means the edge
    /// `target.parent = start` would close a cycle.
    fn reaches(&self, start: &NodeId, target: &NodeId) -> Result<bool, DomainError> {
        let mut visited = HashSet::new();
        let mut current = Some(start.clone());
        while let Some(id) = current {
            if &id == target {
                return Ok(true);
            }
            if !visited.insert(id.clone()) {
                // Existing state already contains a cycle; surface it.
                return Err(DomainError::CycleDetected(id));
            }
            current = self
                .nodes
                .get(&id)
                .and_then(|n| n.parent_id.clone());
        }
        Ok(false)
    }
}

/// Change notification published to registered sinks after a successful
/// write. A remote-sync collaborator mirrors state from these; external
/// updates re-enter through the ordinary store operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChangeEvent {
    ProjectCreated { project: ProjectId },
    ProjectDeleted { project: ProjectId },
    NodeCreated { project: ProjectId, node: NodeId },
    NodeUpdated { project: ProjectId, node: NodeId },
    NodeDeleted { project: ProjectId, node: NodeId },
    MappingAdded {
        project: ProjectId,
        node: NodeId,
        mapping: MappingId,
    },
    MappingRemoved { project: ProjectId, mapping: MappingId },
    FormulaGroupCreated { project: ProjectId, group: String },
    FormulaRuleAdded {
        project: ProjectId,
        group: String,
        target: NodeId,
    },
    BatchCommitted {
        project: ProjectId,
        nodes: usize,
        mappings: usize,
    },
}

type Shard = Arc<RwLock<Arc<ProjectState>>>;

/// One store instance per knowledge base, physically partitioned by project.
pub struct Store {
    shards: RwLock<HashMap<ProjectId, Shard>>,
    sinks: RwLock<Vec<Arc<dyn ChangeSink>>>,
    default_precedence_group: String,
    max_formula_tier: u8,
}

impl Store {
    pub fn new(settings: &Settings) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
            default_precedence_group: settings.default_precedence_group.clone(),
            max_formula_tier: settings.max_formula_tier,
        }
    }

    /// Store with compiled-default settings; mainly for tests and embedding.
    pub fn with_defaults() -> Self {
        Self::new(&Settings::default())
    }

    /// Register a sink receiving change events after each successful write.
    pub fn register_sink(&self, sink: Arc<dyn ChangeSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
        for event in &events {
            for sink in sinks.iter() {
                sink.publish(event);
            }
        }
    }

    fn shard(&self, project: &ProjectId) -> ApplicationResult<Shard> {
        self.shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .cloned()
            .ok_or_else(|| DomainError::UnknownProject(project.clone()).into())
    }

    /// Run a mutation against a private copy of the project state and swap
    /// it in on success. The shard write lock makes this single-writer per
    /// project; readers keep whatever snapshot they already hold.
    fn write<F>(&self, project: &ProjectId, mutate: F) -> ApplicationResult<()>
    where
        F: FnOnce(&mut ProjectState) -> Result<Vec<ChangeEvent>, DomainError>,
    {
        let shard = self.shard(project)?;
        let events = {
            let mut guard = shard.write().unwrap_or_else(|e| e.into_inner());
            let mut next = (**guard).clone();
            let events = mutate(&mut next)?;
            next.version += 1;
            next.modified_at = Utc::now();
            *guard = Arc::new(next);
            events
        };
        self.publish(events);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn create_project(
        &self,
        name: impl Into<String>,
        defaults: SourceCoords,
    ) -> ApplicationResult<ProjectId> {
        let project = Project {
            id: ProjectId::generate(),
            name: name.into(),
            defaults,
        };
        let id = project.id.clone();
        debug!("create_project: {} ({})", project.name, id);

        let state = Arc::new(ProjectState::new(project));
        self.shards
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::new(RwLock::new(state)));
        self.publish(vec![ChangeEvent::ProjectCreated {
            project: id.clone(),
        }]);
        Ok(id)
    }

    /// Delete a project; cascades to all owned entities.
    pub fn delete_project(&self, project: &ProjectId) -> ApplicationResult<()> {
        let removed = self
            .shards
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project);
        if removed.is_none() {
            return Err(DomainError::UnknownProject(project.clone()).into());
        }
        self.publish(vec![ChangeEvent::ProjectDeleted {
            project: project.clone(),
        }]);
        Ok(())
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        let mut projects: Vec<Project> = shards
            .values()
            .map(|s| {
                s.read()
                    .unwrap_or_else(|e| e.into_inner())
                    .project
                    .clone()
            })
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// Immutable snapshot of a project taken at call time.
    pub fn snapshot(&self, project: &ProjectId) -> ApplicationResult<Arc<ProjectState>> {
        let shard = self.shard(project)?;
        let guard = shard.read().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(&guard))
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub fn create_node(
        &self,
        project: &ProjectId,
        id: NodeId,
        parent: Option<NodeId>,
        attrs: NodeAttrs,
    ) -> ApplicationResult<()> {
        let project_id = project.clone();
        self.write(project, move |state| {
            if state.nodes.contains_key(&id) {
                return Err(DomainError::IdAlreadyExists(id.clone()));
            }
            let node = Node {
                id: id.clone(),
                name: attrs.name,
                parent_id: parent,
                description: attrs.description,
                levels: attrs.levels,
                flags: attrs.flags,
                formula_group: attrs.formula_group,
                sort_order: attrs.sort_order,
            };
            validate_node(state, &node)?;
            state.nodes.insert(id.clone(), node);
            Ok(vec![ChangeEvent::NodeCreated {
                project: project_id,
                node: id,
            }])
        })
    }

    pub fn update_node(
        &self,
        project: &ProjectId,
        id: &NodeId,
        patch: NodePatch,
    ) -> ApplicationResult<()> {
        let project_id = project.clone();
        let id = id.clone();
        self.write(project, move |state| {
            let mut node = state
                .nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| DomainError::UnknownNode(id.clone()))?;

            if let Some(name) = patch.name {
                node.name = name;
            }
            if let Some(parent_id) = patch.parent_id {
                node.parent_id = parent_id;
            }
            if let Some(description) = patch.description {
                node.description = description;
            }
            if let Some(levels) = patch.levels {
                node.levels = levels;
            }
            if let Some(flags) = patch.flags {
                node.flags = flags;
            }
            if let Some(formula_group) = patch.formula_group {
                node.formula_group = formula_group;
            }
            if let Some(sort_order) = patch.sort_order {
                node.sort_order = sort_order;
            }

            validate_node(state, &node)?;
            state.nodes.insert(id.clone(), node);
            Ok(vec![ChangeEvent::NodeUpdated {
                project: project_id,
                node: id,
            }])
        })
    }

    /// Delete a node. With children the call is rejected unless
    /// `cascade` is set, in which case the whole subtree (and its
    /// mappings) goes. Rejected if any surviving formula rule still
    /// involves a removed node.
    pub fn delete_node(
        &self,
        project: &ProjectId,
        id: &NodeId,
        cascade: bool,
    ) -> ApplicationResult<()> {
        let project_id = project.clone();
        let id = id.clone();
        self.write(project, move |state| {
            if !state.nodes.contains_key(&id) {
                return Err(DomainError::UnknownNode(id.clone()));
            }
            if !cascade && state.has_children(&id) {
                return Err(DomainError::HasChildren(id.clone()));
            }

            // Collect the subtree iteratively.
            let mut removed: HashSet<NodeId> = HashSet::new();
            let mut stack = vec![id.clone()];
            while let Some(current) = stack.pop() {
                if !removed.insert(current.clone()) {
                    continue;
                }
                for child in state.children_of(&current) {
                    stack.push(child.id.clone());
                }
            }

            // Formula rules must stay resolvable.
            for (_, rule) in state.all_rules() {
                for reference in rule
                    .expr
                    .referenced_nodes()
                    .chain(std::iter::once(&rule.target))
                {
                    if removed.contains(reference) {
                        return Err(DomainError::UnresolvedFormulaReference {
                            rule: rule.target.clone(),
                            reference: reference.clone(),
                        });
                    }
                }
            }

            state.nodes.retain(|node_id, _| !removed.contains(node_id));
            state.mappings.retain(|_, m| !removed.contains(&m.node_id));

            let events = removed
                .into_iter()
                .map(|node| ChangeEvent::NodeDeleted {
                    project: project_id.clone(),
                    node,
                })
                .collect();
            Ok(events)
        })
    }

    // ------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------

    pub fn add_mapping(
        &self,
        project: &ProjectId,
        node_id: &NodeId,
        attrs: MappingAttrs,
    ) -> ApplicationResult<MappingId> {
        let mapping_id = MappingId::generate();
        let result_id = mapping_id.clone();
        let project_id = project.clone();
        let node_id = node_id.clone();
        let default_group = self.default_precedence_group.clone();

        self.write(project, move |state| {
            if !state.nodes.contains_key(&node_id) {
                return Err(DomainError::UnknownNode(node_id.clone()));
            }
            if default_group.is_empty() {
                return Err(DomainError::NullConfig {
                    field: "default_precedence_group".to_string(),
                });
            }
            let precedence_group = match attrs.precedence_group {
                Some(g) if !g.trim().is_empty() => g,
                _ => default_group,
            };
            let mapping = SourceMapping {
                id: mapping_id.clone(),
                node_id: node_id.clone(),
                mapping_index: attrs.mapping_index,
                precedence_group,
                coords: attrs.coords.backfilled_from(&state.project.defaults),
                source_uid: attrs.source_uid,
                flags: attrs.flags,
            };
            state.mappings.insert(mapping_id.clone(), mapping);
            Ok(vec![ChangeEvent::MappingAdded {
                project: project_id,
                node: node_id,
                mapping: mapping_id,
            }])
        })?;
        Ok(result_id)
    }

    pub fn remove_mapping(
        &self,
        project: &ProjectId,
        mapping: &MappingId,
    ) -> ApplicationResult<()> {
        let project_id = project.clone();
        let mapping = mapping.clone();
        self.write(project, move |state| {
            if state.mappings.remove(&mapping).is_none() {
                return Err(DomainError::UnknownMapping(mapping.clone()));
            }
            Ok(vec![ChangeEvent::MappingRemoved {
                project: project_id,
                mapping,
            }])
        })
    }

    // ------------------------------------------------------------------
    // Formula groups
    // ------------------------------------------------------------------

    pub fn create_formula_group(
        &self,
        project: &ProjectId,
        name: impl Into<String>,
    ) -> ApplicationResult<()> {
        let name = name.into();
        let project_id = project.clone();
        self.write(project, move |state| {
            if state.formula_groups.contains_key(&name) {
                return Err(DomainError::DuplicateFormulaGroup(name));
            }
            state
                .formula_groups
                .insert(name.clone(), FormulaGroup::new(name.clone()));
            Ok(vec![ChangeEvent::FormulaGroupCreated {
                project: project_id,
                group: name,
            }])
        })
    }

    /// Add a rule to a formula group. The expression text is parsed,
    /// terms are tagged against the referenced nodes' calculation flags,
    /// and the whole rule set is re-validated (resolution, tier ordering,
    /// cycles) before anything is stored.
    pub fn add_formula_rule(
        &self,
        project: &ProjectId,
        group: &str,
        target: &NodeId,
        tier: u8,
        expr_text: &str,
    ) -> ApplicationResult<()> {
        let project_id = project.clone();
        let group = group.to_string();
        let target = target.clone();
        let expr_text = expr_text.to_string();
        let max_tier = self.max_formula_tier;

        self.write(project, move |state| {
            if tier == 0 || tier > max_tier {
                return Err(DomainError::TierOutOfRange {
                    tier,
                    max: max_tier,
                });
            }
            if !state.nodes.contains_key(&target) {
                return Err(DomainError::UnknownNode(target.clone()));
            }
            if !state.formula_groups.contains_key(&group) {
                return Err(DomainError::UnknownFormulaGroup(group.clone()));
            }

            let raw = RawExpr::parse(&expr_text)?;
            let expr = tag_expression(state, &target, raw)?;
            let rule = FormulaRule {
                target: target.clone(),
                tier,
                expr,
            };

            // Validate against the full rule set including the new rule.
            let group_state = state
                .formula_groups
                .get_mut(&group)
                .ok_or_else(|| DomainError::UnknownFormulaGroup(group.clone()))?;
            group_state.rules.push(rule);
            formula_engine::validate_definitions(state, max_tier)?;

            Ok(vec![ChangeEvent::FormulaRuleAdded {
                project: project_id,
                group,
                target,
            }])
        })
    }

    // ------------------------------------------------------------------
    // Batch commit (import transaction)
    // ------------------------------------------------------------------

    /// Commit a validated import batch in one transaction. Nodes must be
    /// ordered parent-before-child; the whole batch is re-validated and
    /// either fully applied or fully rejected.
    pub fn commit_batch(
        &self,
        project: &ProjectId,
        nodes: Vec<Node>,
        mappings: Vec<SourceMapping>,
    ) -> ApplicationResult<()> {
        let project_id = project.clone();
        let node_count = nodes.len();
        let mapping_count = mappings.len();
        debug!(
            "commit_batch: {} nodes, {} mappings into {}",
            node_count, mapping_count, project_id
        );

        self.write(project, move |state| {
            for node in nodes {
                if state.nodes.contains_key(&node.id) {
                    return Err(DomainError::IdAlreadyExists(node.id));
                }
                validate_node(state, &node)?;
                state.nodes.insert(node.id.clone(), node);
            }
            for mapping in mappings {
                if !state.nodes.contains_key(&mapping.node_id) {
                    return Err(DomainError::UnknownNode(mapping.node_id.clone()));
                }
                state.mappings.insert(mapping.id.clone(), mapping);
            }
            Ok(vec![ChangeEvent::BatchCommitted {
                project: project_id,
                nodes: node_count,
                mappings: mapping_count,
            }])
        })
    }

    /// Restore a complete project state (JSON import). Version and
    /// timestamp are re-stamped; the state is validated wholesale. A
    /// project id already present in the store is rejected; delete it
    /// first to replace it.
    pub fn restore_project(&self, mut state: ProjectState) -> ApplicationResult<ProjectId> {
        let id = state.project.id.clone();
        if self
            .shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
        {
            return Err(DomainError::ProjectAlreadyExists(id).into());
        }

        // Validate against the full state so parent ordering does not
        // matter for the check.
        let full = state.clone();
        for node in full.nodes.values() {
            validate_node(&full, node)?;
        }
        for mapping in full.mappings.values() {
            if !full.nodes.contains_key(&mapping.node_id) {
                return Err(DomainError::UnknownNode(mapping.node_id.clone()).into());
            }
            if mapping.precedence_group.trim().is_empty() {
                return Err(DomainError::MalformedInput(format!(
                    "mapping {} has an empty precedence group",
                    mapping.id
                ))
                .into());
            }
        }
        formula_engine::validate_definitions(&full, self.max_formula_tier)?;

        state.version = 0;
        state.modified_at = Utc::now();
        self.shards
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::new(RwLock::new(Arc::new(state))));
        self.publish(vec![ChangeEvent::ProjectCreated {
            project: id.clone(),
        }]);
        Ok(id)
    }
}

/// Validate a node against the (partially updated) project state:
/// parent existence, acyclicity, sort/level bounds, flag combinations.
fn validate_node(state: &ProjectState, node: &Node) -> Result<(), DomainError> {
    if node.sort_order < 0 {
        return Err(DomainError::NegativeSort {
            field: "sort_order".to_string(),
            value: node.sort_order,
        });
    }
    if node.levels.len() > MAX_LEVELS {
        return Err(DomainError::LevelOverflow {
            count: node.levels.len(),
            max: MAX_LEVELS,
        });
    }
    for (i, level) in node.levels.iter().enumerate() {
        if level.sort < 0 {
            return Err(DomainError::NegativeSort {
                field: format!("level_{}_sort", i + 1),
                value: level.sort,
            });
        }
    }

    if let Some(parent_id) = &node.parent_id {
        let parent = state
            .nodes
            .get(parent_id)
            .ok_or_else(|| DomainError::OrphanParent {
                node: node.id.clone(),
                parent: parent_id.clone(),
            })?;
        if parent.flags.is_leaf {
            return Err(DomainError::InvalidFlagCombination {
                id: parent_id.clone(),
                reason: "is_leaf node cannot take children".to_string(),
            });
        }
        if state.reaches(parent_id, &node.id)? {
            return Err(DomainError::CycleDetected(node.id.clone()));
        }
    }

    if node.flags.is_leaf && state.has_children(&node.id) {
        return Err(DomainError::InvalidFlagCombination {
            id: node.id.clone(),
            reason: "is_leaf set on a node with children".to_string(),
        });
    }
    if node.flags.include && node.flags.exclude {
        return Err(DomainError::InvalidFlagCombination {
            id: node.id.clone(),
            reason: "include and exclude are mutually exclusive".to_string(),
        });
    }

    Ok(())
}

/// Tag a parsed expression: identifiers must name existing nodes and
/// become aggregates (raw-mapped) or references (calculated) based on the
/// referenced node's calculation flag.
fn tag_expression(
    state: &ProjectState,
    target: &NodeId,
    raw: RawExpr,
) -> Result<FormulaExpr, DomainError> {
    let tag = |term: RawTerm| -> Result<FormulaTerm, DomainError> {
        match term {
            RawTerm::Constant(value) => Ok(FormulaTerm::Constant(value)),
            RawTerm::Identifier(ident) => {
                let id = NodeId::new(ident);
                let node = state.nodes.get(&id).ok_or_else(|| {
                    DomainError::UnresolvedFormulaReference {
                        rule: target.clone(),
                        reference: id.clone(),
                    }
                })?;
                if node.flags.calculation {
                    Ok(FormulaTerm::Reference(id))
                } else {
                    Ok(FormulaTerm::Aggregate(id))
                }
            }
        }
    };

    let first = tag(raw.first)?;
    let rest = raw
        .rest
        .into_iter()
        .map(|(op, term)| Ok((op, tag(term)?)))
        .collect::<Result<Vec<_>, DomainError>>()?;
    Ok(FormulaExpr { first, rest })
}
