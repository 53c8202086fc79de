//! Export of project snapshots to tabular and JSON surfaces.
//!
//! The full export is lossless modulo version/timestamp metadata:
//! re-importing its JSON yields an equivalent project. Simplified exports
//! deliberately drop detail to match the lower-tier input schemas.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::application::error::{ApplicationError, ApplicationResult};
use crate::application::services::store::{ProjectState, Store};
use crate::domain::arena::NodeArena;
use crate::domain::entities::{Node, ProjectId, MAX_LEVELS};
use crate::domain::tabular::{render_flag, CanonicalColumn, Dialect, TabularInput, Tier};

/// Full export of one project: hierarchy plus mapping file.
#[derive(Debug, Clone, Serialize)]
pub struct FullExport {
    pub hierarchy: TabularInput,
    pub mappings: TabularInput,
}

/// Renders snapshots into the tabular dialects and JSON.
pub struct Exporter;

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter {
    pub fn new() -> Self {
        Self
    }

    /// Export the complete project on the full-schema surface.
    ///
    /// Rows come out in forest pre-order (parents before children,
    /// siblings by sort order), so the file re-imports without reordering.
    pub fn export_full(
        &self,
        state: &ProjectState,
        dialect: Dialect,
    ) -> ApplicationResult<FullExport> {
        let arena = NodeArena::from_nodes(&state.nodes)?;

        let max_levels_used = state
            .nodes
            .values()
            .map(|n| n.levels.len())
            .max()
            .unwrap_or(0);
        let level_count = max_levels_used.max(10).min(MAX_LEVELS);

        let mut columns = vec![
            CanonicalColumn::HierarchyId,
            CanonicalColumn::HierarchyName,
            CanonicalColumn::ParentId,
            CanonicalColumn::Description,
        ];
        for n in 1..=level_count as u8 {
            columns.push(CanonicalColumn::Level(n));
            columns.push(CanonicalColumn::LevelSort(n));
        }
        columns.extend([
            CanonicalColumn::IncludeFlag,
            CanonicalColumn::ExcludeFlag,
            CanonicalColumn::TransformFlag,
            CanonicalColumn::CalculationFlag,
            CanonicalColumn::ActiveFlag,
            CanonicalColumn::IsLeafNode,
            CanonicalColumn::FormulaGroup,
            CanonicalColumn::SortOrder,
        ]);

        let headers: Vec<String> = columns.iter().map(|c| c.header(dialect)).collect();
        let rows: Vec<Vec<String>> = arena
            .iter()
            .map(|(_, slot)| full_row(&slot.node, level_count))
            .collect();
        debug!(
            "export_full: project={} nodes={} levels={}",
            state.project.id,
            rows.len(),
            level_count
        );

        Ok(FullExport {
            hierarchy: TabularInput::new(headers, rows),
            mappings: self.export_mappings(state, &arena, dialect),
        })
    }

    /// Export on a lower-tier surface, dropping whatever that tier cannot
    /// carry.
    pub fn export_simplified(
        &self,
        state: &ProjectState,
        tier: Tier,
        dialect: Dialect,
    ) -> ApplicationResult<TabularInput> {
        let arena = NodeArena::from_nodes(&state.nodes)?;
        match tier {
            Tier::Tier1 => Ok(self.export_tier1(state, &arena, dialect)),
            Tier::Tier2 => Ok(self.export_tier2(state, &arena, dialect)),
            Tier::Tier3 => Ok(self.export_tier3(&arena, dialect)),
            Tier::Tier4 => Ok(self.export_full(state, dialect)?.hierarchy),
        }
    }

    /// Serialize the full snapshot as pretty-printed JSON.
    pub fn export_json(&self, state: &ProjectState) -> ApplicationResult<String> {
        serde_json::to_string_pretty(state).map_err(|e| ApplicationError::OperationFailed {
            context: format!("serializing project {}", state.project.id),
            source: Box::new(e),
        })
    }

    /// Restore a project from its JSON export. Version and modification
    /// timestamp are re-stamped by the store on restore.
    pub fn import_json(&self, store: &Arc<Store>, json: &str) -> ApplicationResult<ProjectId> {
        let state: ProjectState =
            serde_json::from_str(json).map_err(|e| ApplicationError::OperationFailed {
                context: "parsing project JSON".to_string(),
                source: Box::new(e),
            })?;
        store.restore_project(state)
    }

    fn export_mappings(
        &self,
        state: &ProjectState,
        arena: &NodeArena,
        dialect: Dialect,
    ) -> TabularInput {
        use CanonicalColumn::*;
        let columns = [
            HierarchyId,
            MappingIndex,
            SourceDatabase,
            SourceSchema,
            SourceTable,
            SourceColumn,
            SourceUid,
            PrecedenceGroup,
            IncludeFlag,
            ExcludeFlag,
            TransformFlag,
            ActiveFlag,
        ];
        let headers: Vec<String> = columns.iter().map(|c| c.header(dialect)).collect();

        let mut rows: Vec<Vec<String>> = Vec::new();
        for (_, slot) in arena.iter() {
            for mapping in state.mappings_of(&slot.node.id) {
                rows.push(vec![
                    mapping.node_id.to_string(),
                    mapping.mapping_index.to_string(),
                    mapping.coords.database.clone().unwrap_or_default(),
                    mapping.coords.schema.clone().unwrap_or_default(),
                    mapping.coords.table.clone().unwrap_or_default(),
                    mapping.coords.column.clone().unwrap_or_default(),
                    mapping.source_uid.clone().unwrap_or_default(),
                    mapping.precedence_group.clone(),
                    render_flag(mapping.flags.include).to_string(),
                    render_flag(mapping.flags.exclude).to_string(),
                    render_flag(mapping.flags.transform).to_string(),
                    render_flag(mapping.flags.active).to_string(),
                ]);
            }
        }
        TabularInput::new(headers, rows)
    }

    /// Tier 1: only mapped leaves, as (value, group, sort) triples. The
    /// group is the leaf's root ancestor.
    fn export_tier1(
        &self,
        state: &ProjectState,
        arena: &NodeArena,
        dialect: Dialect,
    ) -> TabularInput {
        use CanonicalColumn::*;
        let headers: Vec<String> = [SourceValue, GroupName, SortOrder]
            .iter()
            .map(|c| c.header(dialect))
            .collect();

        let mut rows: Vec<Vec<String>> = Vec::new();
        for &root_idx in arena.roots() {
            let root_name = arena[root_idx].node.name.clone();
            for (idx, slot) in arena.subtree(root_idx) {
                if idx == root_idx {
                    continue;
                }
                for mapping in state.mappings_of(&slot.node.id) {
                    let value = mapping
                        .source_uid
                        .clone()
                        .unwrap_or_else(|| slot.node.name.clone());
                    rows.push(vec![
                        value,
                        root_name.clone(),
                        slot.node.sort_order.to_string(),
                    ]);
                }
            }
        }
        TabularInput::new(headers, rows)
    }

    /// Tier 2: name-linked rows with the first mapping's selector.
    fn export_tier2(
        &self,
        state: &ProjectState,
        arena: &NodeArena,
        dialect: Dialect,
    ) -> TabularInput {
        use CanonicalColumn::*;
        let headers: Vec<String> = [HierarchyName, ParentName, Description, SortOrder, SourceUid]
            .iter()
            .map(|c| c.header(dialect))
            .collect();

        let rows: Vec<Vec<String>> = arena
            .iter()
            .map(|(_, slot)| {
                let parent_name = slot
                    .parent
                    .map(|p| arena[p].node.name.clone())
                    .unwrap_or_default();
                let source_uid = state
                    .mappings_of(&slot.node.id)
                    .first()
                    .and_then(|m| m.source_uid.clone())
                    .unwrap_or_default();
                vec![
                    slot.node.name.clone(),
                    parent_name,
                    slot.node.description.clone(),
                    slot.node.sort_order.to_string(),
                    source_uid,
                ]
            })
            .collect();
        TabularInput::new(headers, rows)
    }

    /// Tier 3: explicit ids and the core flag set, no level columns.
    fn export_tier3(&self, arena: &NodeArena, dialect: Dialect) -> TabularInput {
        use CanonicalColumn::*;
        let columns = [
            HierarchyId,
            HierarchyName,
            ParentId,
            Description,
            IncludeFlag,
            ExcludeFlag,
            TransformFlag,
            CalculationFlag,
            ActiveFlag,
            IsLeafNode,
            FormulaGroup,
            SortOrder,
        ];
        let headers: Vec<String> = columns.iter().map(|c| c.header(dialect)).collect();

        let rows: Vec<Vec<String>> = arena
            .iter()
            .map(|(_, slot)| {
                let node = &slot.node;
                vec![
                    node.id.to_string(),
                    node.name.clone(),
                    node.parent_id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    node.description.clone(),
                    render_flag(node.flags.include).to_string(),
                    render_flag(node.flags.exclude).to_string(),
                    render_flag(node.flags.transform).to_string(),
                    render_flag(node.flags.calculation).to_string(),
                    render_flag(node.flags.active).to_string(),
                    render_flag(node.flags.is_leaf).to_string(),
                    node.formula_group.clone().unwrap_or_default(),
                    node.sort_order.to_string(),
                ]
            })
            .collect();
        TabularInput::new(headers, rows)
    }
}

fn full_row(node: &Node, level_count: usize) -> Vec<String> {
    let mut row = vec![
        node.id.to_string(),
        node.name.clone(),
        node.parent_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        node.description.clone(),
    ];
    for n in 0..level_count {
        match node.levels.get(n) {
            Some(level) => {
                row.push(level.label.clone());
                row.push(level.sort.to_string());
            }
            None => {
                row.push(String::new());
                row.push(String::new());
            }
        }
    }
    row.extend([
        render_flag(node.flags.include).to_string(),
        render_flag(node.flags.exclude).to_string(),
        render_flag(node.flags.transform).to_string(),
        render_flag(node.flags.calculation).to_string(),
        render_flag(node.flags.active).to_string(),
        render_flag(node.flags.is_leaf).to_string(),
        node.formula_group.clone().unwrap_or_default(),
        node.sort_order.to_string(),
    ]);
    row
}
