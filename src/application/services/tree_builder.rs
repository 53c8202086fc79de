//! Tabular import pipeline: received → format-detected → normalized →
//! validated → committed.
//!
//! Every stage runs to completion on the whole batch; a failure anywhere
//! rejects the import with the stage name and a structured list of
//! (row, reason) errors, and the project state stays untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info};

use crate::application::error::{
    ApplicationError, ApplicationResult, ImportStage, RowError,
};
use crate::application::services::format::{self, HeaderMap};
use crate::application::services::store::{ProjectState, Store};
use crate::config::Settings;
use crate::domain::entities::{
    slug_id, MappingFlags, MappingId, Node, NodeFlags, NodeId, NodeLevel, ProjectId, SourceCoords,
    SourceMapping, MAX_LEVELS,
};
use crate::domain::error::DomainError;
use crate::domain::tabular::{parse_flag, CanonicalColumn, Dialect, TabularInput, Tier};

/// Summary of a committed import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub tier: Tier,
    pub dialect: Dialect,
    pub confidence: f64,
    pub nodes: usize,
    pub mappings: usize,
}

/// A node assembled from one input row, before batch validation.
#[derive(Debug, Clone)]
struct CandidateNode {
    row: usize,
    node: Node,
}

/// A mapping assembled from one input row, keyed by its target node id.
#[derive(Debug, Clone)]
struct CandidateMapping {
    row: usize,
    node_id: NodeId,
    mapping_index: u32,
    coords: SourceCoords,
    source_uid: Option<String>,
    precedence_group: Option<String>,
    flags: MappingFlags,
}

/// Builds hierarchies from tabular input and commits them through the
/// store as one transaction per file.
pub struct TreeBuilder {
    store: Arc<Store>,
    settings: Arc<Settings>,
}

impl TreeBuilder {
    pub fn new(store: Arc<Store>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Import a hierarchy file into a project.
    ///
    /// `dialect` overrides automatic dialect preference; the tier is
    /// always detected from the column count. All-or-nothing: on any
    /// error the project keeps its prior state and the report lists
    /// every offending row.
    pub fn import_hierarchy(
        &self,
        project: &ProjectId,
        input: &TabularInput,
        dialect: Option<Dialect>,
    ) -> ApplicationResult<ImportReport> {
        let snapshot = self.store.snapshot(project)?;

        // Stage: received.
        if input.headers.is_empty() {
            return Err(reject(
                ImportStage::Received,
                vec![batch_error(DomainError::MalformedInput(
                    "input has no header row".to_string(),
                ))],
            ));
        }

        // Stage: format-detected.
        let preferred = dialect.unwrap_or(self.settings.default_dialect);
        let map = format::classify_hierarchy(
            &input.headers,
            self.settings.min_header_confidence,
            preferred,
        )
        .map_err(|e| reject(ImportStage::FormatDetected, vec![batch_error(e)]))?;
        info!(
            "import_hierarchy: project={} tier={:?} dialect={:?} confidence={:.2} rows={}",
            project,
            map.tier,
            map.dialect,
            map.confidence,
            input.rows.len()
        );

        // Stage: normalized.
        let (nodes, mappings) = self
            .normalize(&snapshot, &map, input)
            .map_err(|errors| reject(ImportStage::Normalized, errors))?;

        // Stage: validated.
        let errors = validate_batch(&snapshot, &nodes);
        if !errors.is_empty() {
            return Err(reject(ImportStage::Validated, errors));
        }

        // Stage: committed. Nodes go in parent-before-child order.
        let ordered = order_for_commit(nodes);
        let built_mappings = self.build_mappings(&snapshot, mappings);
        let node_count = ordered.len();
        let mapping_count = built_mappings.len();
        self.store
            .commit_batch(project, ordered, built_mappings)
            .map_err(|e| match e {
                ApplicationError::Domain(d) => {
                    reject(ImportStage::Committed, vec![batch_error(d)])
                }
                other => other,
            })?;

        Ok(ImportReport {
            tier: map.tier,
            dialect: map.dialect,
            confidence: map.confidence,
            nodes: node_count,
            mappings: mapping_count,
        })
    }

    /// Import a mapping file, attaching mappings to existing nodes by id.
    ///
    /// The mapping surface carries no sort columns; a node's ordering can
    /// only ever change through a hierarchy import or an explicit update.
    pub fn import_mappings(
        &self,
        project: &ProjectId,
        input: &TabularInput,
    ) -> ApplicationResult<ImportReport> {
        let snapshot = self.store.snapshot(project)?;

        if input.headers.is_empty() {
            return Err(reject(
                ImportStage::Received,
                vec![batch_error(DomainError::MalformedInput(
                    "input has no header row".to_string(),
                ))],
            ));
        }

        let map = format::classify_mappings(&input.headers, self.settings.min_header_confidence)
            .map_err(|e| reject(ImportStage::FormatDetected, vec![batch_error(e)]))?;

        let mut candidates: Vec<CandidateMapping> = Vec::new();
        let mut errors: Vec<RowError> = Vec::new();
        for (row, cells) in input.rows.iter().enumerate() {
            match self.mapping_from_row(&map, row, cells) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => errors.push(RowError {
                    row: Some(row),
                    error: e,
                }),
            }
        }
        if !errors.is_empty() {
            return Err(reject(ImportStage::Normalized, errors));
        }

        for candidate in &candidates {
            if !snapshot.nodes.contains_key(&candidate.node_id) {
                errors.push(RowError {
                    row: Some(candidate.row),
                    error: DomainError::UnknownNode(candidate.node_id.clone()),
                });
            }
        }
        if !errors.is_empty() {
            return Err(reject(ImportStage::Validated, errors));
        }

        let built = self.build_mappings(&snapshot, candidates);
        let mapping_count = built.len();
        self.store
            .commit_batch(project, Vec::new(), built)
            .map_err(|e| match e {
                ApplicationError::Domain(d) => {
                    reject(ImportStage::Committed, vec![batch_error(d)])
                }
                other => other,
            })?;

        Ok(ImportReport {
            tier: map.tier,
            dialect: map.dialect,
            confidence: map.confidence,
            nodes: 0,
            mappings: mapping_count,
        })
    }

    // ------------------------------------------------------------------
    // Normalization per tier
    // ------------------------------------------------------------------

    fn normalize(
        &self,
        snapshot: &ProjectState,
        map: &HeaderMap,
        input: &TabularInput,
    ) -> Result<(Vec<CandidateNode>, Vec<CandidateMapping>), Vec<RowError>> {
        match map.tier {
            Tier::Tier1 => self.normalize_tier1(map, input),
            Tier::Tier2 => self.normalize_tier2(snapshot, map, input),
            Tier::Tier3 | Tier::Tier4 => self.normalize_explicit(map, input),
        }
    }

    /// Tier 1: each distinct group name becomes a root; each row becomes
    /// a leaf under its group with a mapping selecting the raw value.
    fn normalize_tier1(
        &self,
        map: &HeaderMap,
        input: &TabularInput,
    ) -> Result<(Vec<CandidateNode>, Vec<CandidateMapping>), Vec<RowError>> {
        let mut nodes: Vec<CandidateNode> = Vec::new();
        let mut mappings: Vec<CandidateMapping> = Vec::new();
        let mut errors: Vec<RowError> = Vec::new();
        let mut roots: HashMap<NodeId, usize> = HashMap::new();

        for (row, cells) in input.rows.iter().enumerate() {
            let value = required_cell(map, cells, CanonicalColumn::SourceValue, row);
            let group = required_cell(map, cells, CanonicalColumn::GroupName, row);
            let (value, group) = match (value, group) {
                (Ok(v), Ok(g)) => (v, g),
                (value, group) => {
                    errors.extend(value.err());
                    errors.extend(group.err());
                    continue;
                }
            };

            let root_id = match slug_for(group, row) {
                Ok(id) => id,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if !roots.contains_key(&root_id) {
                roots.insert(root_id.clone(), row);
                nodes.push(CandidateNode {
                    row,
                    node: Node {
                        id: root_id.clone(),
                        name: group.to_string(),
                        parent_id: None,
                        description: String::new(),
                        levels: Vec::new(),
                        flags: NodeFlags::default(),
                        formula_group: None,
                        sort_order: nodes.len() as i64,
                    },
                });
            }

            let sort_order = map
                .cell(cells, CanonicalColumn::SortOrder)
                .and_then(|c| c.parse::<i64>().ok())
                .unwrap_or(row as i64);
            let leaf_id = match slug_for(&format!("{group} {value}"), row) {
                Ok(id) => id,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            nodes.push(CandidateNode {
                row,
                node: Node {
                    id: leaf_id.clone(),
                    name: value.to_string(),
                    parent_id: Some(root_id),
                    description: String::new(),
                    levels: Vec::new(),
                    flags: NodeFlags {
                        is_leaf: true,
                        ..NodeFlags::default()
                    },
                    formula_group: None,
                    sort_order,
                },
            });
            mappings.push(CandidateMapping {
                row,
                node_id: leaf_id,
                mapping_index: row as u32,
                coords: SourceCoords::default(),
                source_uid: Some(value.to_string()),
                precedence_group: None,
                flags: MappingFlags::default(),
            });
        }

        if errors.is_empty() {
            Ok((nodes, mappings))
        } else {
            Err(errors)
        }
    }

    /// Tier 2: rows are named, parents are resolved by display name,
    /// first against the batch itself and then against committed nodes.
    fn normalize_tier2(
        &self,
        snapshot: &ProjectState,
        map: &HeaderMap,
        input: &TabularInput,
    ) -> Result<(Vec<CandidateNode>, Vec<CandidateMapping>), Vec<RowError>> {
        let mut errors: Vec<RowError> = Vec::new();

        // Names introduced by this batch, for parent resolution.
        let batch_names: HashSet<String> = input
            .rows
            .iter()
            .filter_map(|cells| map.cell(cells, CanonicalColumn::HierarchyName))
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();

        let mut nodes: Vec<CandidateNode> = Vec::new();
        let mut mappings: Vec<CandidateMapping> = Vec::new();
        for (row, cells) in input.rows.iter().enumerate() {
            let name = match required_cell(map, cells, CanonicalColumn::HierarchyName, row) {
                Ok(name) => name,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let id = match slug_for(name, row) {
                Ok(id) => id,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            let parent_name = map
                .cell(cells, CanonicalColumn::ParentName)
                .filter(|p| !p.is_empty());
            let parent_id = match parent_name {
                None => None,
                Some(parent) if batch_names.contains(parent) => Some(slug_id(parent)),
                Some(parent) => match snapshot.nodes_named(parent).as_slice() {
                    [] => Some(slug_id(parent)), // surfaces as orphan in validation
                    [only] => Some(only.id.clone()),
                    many => {
                        errors.push(RowError {
                            row: Some(row),
                            error: DomainError::AmbiguousParent {
                                name: parent.to_string(),
                                candidates: many.iter().map(|n| n.id.clone()).collect(),
                            },
                        });
                        continue;
                    }
                },
            };

            let sort_order = map
                .cell(cells, CanonicalColumn::SortOrder)
                .and_then(|c| c.parse::<i64>().ok())
                .unwrap_or(row as i64);
            let flags = NodeFlags {
                include: flag_cell(map, cells, CanonicalColumn::IncludeFlag, true),
                active: flag_cell(map, cells, CanonicalColumn::ActiveFlag, true),
                ..NodeFlags::default()
            };
            nodes.push(CandidateNode {
                row,
                node: Node {
                    id: id.clone(),
                    name: name.to_string(),
                    parent_id,
                    description: map
                        .cell(cells, CanonicalColumn::Description)
                        .unwrap_or_default()
                        .to_string(),
                    levels: Vec::new(),
                    flags,
                    formula_group: None,
                    sort_order,
                },
            });

            if let Some(uid) = map
                .cell(cells, CanonicalColumn::SourceUid)
                .filter(|u| !u.is_empty())
            {
                mappings.push(CandidateMapping {
                    row,
                    node_id: id,
                    mapping_index: row as u32,
                    coords: SourceCoords::default(),
                    source_uid: Some(uid.to_string()),
                    precedence_group: None,
                    flags: MappingFlags::default(),
                });
            }
        }

        if errors.is_empty() {
            Ok((nodes, mappings))
        } else {
            Err(errors)
        }
    }

    /// Tiers 3 and 4: explicit ids, parent ids, flags; tier 4 adds the
    /// per-level label/sort pairs.
    fn normalize_explicit(
        &self,
        map: &HeaderMap,
        input: &TabularInput,
    ) -> Result<(Vec<CandidateNode>, Vec<CandidateMapping>), Vec<RowError>> {
        let mut errors: Vec<RowError> = Vec::new();
        let mut nodes: Vec<CandidateNode> = Vec::new();

        for (row, cells) in input.rows.iter().enumerate() {
            let id = match required_cell(map, cells, CanonicalColumn::HierarchyId, row) {
                Ok(id) => NodeId::new(id),
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let name = map
                .cell(cells, CanonicalColumn::HierarchyName)
                .filter(|n| !n.is_empty())
                .unwrap_or(id.as_str())
                .to_string();
            let parent_id = map
                .cell(cells, CanonicalColumn::ParentId)
                .filter(|p| !p.is_empty())
                .map(NodeId::new);

            let mut levels: Vec<NodeLevel> = Vec::new();
            if map.tier == Tier::Tier4 {
                for n in 1..=MAX_LEVELS as u8 {
                    let label = map
                        .cell(cells, CanonicalColumn::Level(n))
                        .filter(|l| !l.is_empty());
                    let Some(label) = label else { continue };
                    let sort = map
                        .cell(cells, CanonicalColumn::LevelSort(n))
                        .and_then(|c| c.parse::<i64>().ok())
                        .unwrap_or(0);
                    levels.push(NodeLevel {
                        label: label.to_string(),
                        sort,
                    });
                }
            }

            let flags = NodeFlags {
                include: flag_cell(map, cells, CanonicalColumn::IncludeFlag, true),
                exclude: flag_cell(map, cells, CanonicalColumn::ExcludeFlag, false),
                transform: flag_cell(map, cells, CanonicalColumn::TransformFlag, false),
                calculation: flag_cell(map, cells, CanonicalColumn::CalculationFlag, false),
                active: flag_cell(map, cells, CanonicalColumn::ActiveFlag, true),
                is_leaf: flag_cell(map, cells, CanonicalColumn::IsLeafNode, false),
            };
            let sort_order = map
                .cell(cells, CanonicalColumn::SortOrder)
                .and_then(|c| c.parse::<i64>().ok())
                .unwrap_or(row as i64);

            nodes.push(CandidateNode {
                row,
                node: Node {
                    id,
                    name,
                    parent_id,
                    description: map
                        .cell(cells, CanonicalColumn::Description)
                        .unwrap_or_default()
                        .to_string(),
                    levels,
                    flags,
                    formula_group: map
                        .cell(cells, CanonicalColumn::FormulaGroup)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string),
                    sort_order,
                },
            });
        }

        if errors.is_empty() {
            Ok((nodes, Vec::new()))
        } else {
            Err(errors)
        }
    }

    fn mapping_from_row(
        &self,
        map: &HeaderMap,
        row: usize,
        cells: &[String],
    ) -> Result<CandidateMapping, DomainError> {
        let node_id = map
            .cell(cells, CanonicalColumn::HierarchyId)
            .filter(|c| !c.is_empty())
            .map(NodeId::new)
            .ok_or_else(|| {
                DomainError::MalformedInput(format!("row {row}: empty hierarchy id"))
            })?;
        let mapping_index = map
            .cell(cells, CanonicalColumn::MappingIndex)
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(row as u32);

        let cell_opt = |col: CanonicalColumn| {
            map.cell(cells, col)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
        };
        Ok(CandidateMapping {
            row,
            node_id,
            mapping_index,
            coords: SourceCoords {
                database: cell_opt(CanonicalColumn::SourceDatabase),
                schema: cell_opt(CanonicalColumn::SourceSchema),
                table: cell_opt(CanonicalColumn::SourceTable),
                column: cell_opt(CanonicalColumn::SourceColumn),
            },
            source_uid: cell_opt(CanonicalColumn::SourceUid),
            precedence_group: cell_opt(CanonicalColumn::PrecedenceGroup),
            flags: MappingFlags {
                include: flag_cell(map, cells, CanonicalColumn::IncludeFlag, true),
                exclude: flag_cell(map, cells, CanonicalColumn::ExcludeFlag, false),
                transform: flag_cell(map, cells, CanonicalColumn::TransformFlag, false),
                active: flag_cell(map, cells, CanonicalColumn::ActiveFlag, true),
            },
        })
    }

    /// Materialize candidate mappings: fresh ids, project-default coords
    /// backfill, settings-default precedence group.
    fn build_mappings(
        &self,
        snapshot: &ProjectState,
        candidates: Vec<CandidateMapping>,
    ) -> Vec<SourceMapping> {
        candidates
            .into_iter()
            .map(|c| SourceMapping {
                id: MappingId::generate(),
                node_id: c.node_id,
                mapping_index: c.mapping_index,
                precedence_group: c
                    .precedence_group
                    .unwrap_or_else(|| self.settings.default_precedence_group.clone()),
                coords: c.coords.backfilled_from(&snapshot.project.defaults),
                source_uid: c.source_uid,
                flags: c.flags,
            })
            .collect()
    }
}

fn reject(stage: ImportStage, errors: Vec<RowError>) -> ApplicationError {
    ApplicationError::ImportRejected { stage, errors }
}

/// Slug a display name into a node id, rejecting names with no
/// alphanumeric content (which would all collapse onto the empty id).
fn slug_for(name: &str, row: usize) -> Result<NodeId, RowError> {
    let id = slug_id(name);
    if id.as_str().is_empty() {
        return Err(RowError {
            row: Some(row),
            error: DomainError::MalformedInput(format!("name '{name}' yields an empty node id")),
        });
    }
    Ok(id)
}

fn batch_error(error: DomainError) -> RowError {
    RowError { row: None, error }
}

fn required_cell<'a>(
    map: &HeaderMap,
    cells: &'a [String],
    column: CanonicalColumn,
    row: usize,
) -> Result<&'a str, RowError> {
    map.cell(cells, column)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| RowError {
            row: Some(row),
            error: DomainError::MalformedInput(format!(
                "empty required cell {}",
                column.header(crate::domain::tabular::Dialect::Current)
            )),
        })
}

fn flag_cell(map: &HeaderMap, cells: &[String], column: CanonicalColumn, default: bool) -> bool {
    map.cell(cells, column)
        .map(|c| parse_flag(c, default))
        .unwrap_or(default)
}

/// Batch validation: duplicate ids within the file, collisions with
/// committed nodes, orphan parents against batch-plus-store, cycles over
/// the combined parent graph, leaf nodes used as parents, sort bounds.
/// Collects every violation instead of stopping at the first.
fn validate_batch(snapshot: &ProjectState, nodes: &[CandidateNode]) -> Vec<RowError> {
    let mut errors: Vec<RowError> = Vec::new();

    let mut first_row: HashMap<&NodeId, usize> = HashMap::new();
    for candidate in nodes {
        if let Some(&first) = first_row.get(&candidate.node.id) {
            errors.push(RowError {
                row: Some(candidate.row),
                error: DomainError::DuplicateId {
                    id: candidate.node.id.clone(),
                    first_row: first,
                    second_row: candidate.row,
                },
            });
        } else {
            first_row.insert(&candidate.node.id, candidate.row);
        }
    }

    // Combined parent lookup over batch and committed state.
    let batch_parents: HashMap<&NodeId, Option<&NodeId>> = nodes
        .iter()
        .map(|c| (&c.node.id, c.node.parent_id.as_ref()))
        .collect();
    let parent_of = |id: &NodeId| -> Option<Option<NodeId>> {
        if let Some(parent) = batch_parents.get(id) {
            return Some((*parent).cloned());
        }
        snapshot.nodes.get(id).map(|n| n.parent_id.clone())
    };
    let is_leaf = |id: &NodeId| -> bool {
        nodes
            .iter()
            .find(|c| &c.node.id == id)
            .map(|c| c.node.flags.is_leaf)
            .or_else(|| snapshot.nodes.get(id).map(|n| n.flags.is_leaf))
            .unwrap_or(false)
    };

    for candidate in nodes {
        let node = &candidate.node;
        let row = Some(candidate.row);

        if snapshot.nodes.contains_key(&node.id) {
            errors.push(RowError {
                row,
                error: DomainError::IdAlreadyExists(node.id.clone()),
            });
        }
        if node.sort_order < 0 {
            errors.push(RowError {
                row,
                error: DomainError::NegativeSort {
                    field: "sort_order".to_string(),
                    value: node.sort_order,
                },
            });
        }
        for (i, level) in node.levels.iter().enumerate() {
            if level.sort < 0 {
                errors.push(RowError {
                    row,
                    error: DomainError::NegativeSort {
                        field: format!("level_{}_sort", i + 1),
                        value: level.sort,
                    },
                });
            }
        }
        if node.flags.include && node.flags.exclude {
            errors.push(RowError {
                row,
                error: DomainError::InvalidFlagCombination {
                    id: node.id.clone(),
                    reason: "include and exclude are mutually exclusive".to_string(),
                },
            });
        }

        let Some(parent_id) = &node.parent_id else {
            continue;
        };
        if parent_of(parent_id).is_none() {
            errors.push(RowError {
                row,
                error: DomainError::OrphanParent {
                    node: node.id.clone(),
                    parent: parent_id.clone(),
                },
            });
            continue;
        }
        if is_leaf(parent_id) {
            errors.push(RowError {
                row,
                error: DomainError::InvalidFlagCombination {
                    id: parent_id.clone(),
                    reason: "is_leaf node cannot take children".to_string(),
                },
            });
        }

        // Walk the combined parent chain; revisiting this node is a cycle.
        let mut visited: HashSet<NodeId> = HashSet::new();
        visited.insert(node.id.clone());
        let mut current = Some(parent_id.clone());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                errors.push(RowError {
                    row,
                    error: DomainError::CycleDetected(node.id.clone()),
                });
                break;
            }
            current = parent_of(&id).flatten();
        }
    }

    errors
}

/// Order candidates parent-before-child for the commit: by depth within
/// the batch, then sort_order, then original row.
fn order_for_commit(nodes: Vec<CandidateNode>) -> Vec<Node> {
    let parent_of: HashMap<NodeId, Option<NodeId>> = nodes
        .iter()
        .map(|c| (c.node.id.clone(), c.node.parent_id.clone()))
        .collect();
    let depth_of = |id: &NodeId| -> usize {
        let mut depth = 0;
        let mut visited: HashSet<&NodeId> = HashSet::new();
        let mut current = parent_of.get(id).and_then(|p| p.as_ref());
        while let Some(parent) = current {
            if !visited.insert(parent) {
                break;
            }
            depth += 1;
            current = parent_of.get(parent).and_then(|p| p.as_ref());
        }
        depth
    };

    debug!("ordering {} candidate node(s) for commit", nodes.len());
    nodes
        .into_iter()
        .map(|c| (depth_of(&c.node.id), c.node.sort_order, c.row, c.node))
        .sorted_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)))
        .map(|(_, _, _, node)| node)
        .collect()
}
