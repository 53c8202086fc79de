//! Domain-level errors (no external dependencies)

use thiserror::Error;

use crate::domain::entities::{MappingId, NodeId, ProjectId};

/// Domain errors represent business rule violations.
/// These are independent of infrastructure concerns.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),

    #[error("project id already exists: {0}")]
    ProjectAlreadyExists(ProjectId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown mapping: {0}")]
    UnknownMapping(MappingId),

    #[error("duplicate node id {id} (rows {first_row} and {second_row})")]
    DuplicateId {
        id: NodeId,
        first_row: usize,
        second_row: usize,
    },

    #[error("node id already exists in project: {0}")]
    IdAlreadyExists(NodeId),

    #[error("orphan parent: node {node} references missing parent {parent}")]
    OrphanParent { node: NodeId, parent: NodeId },

    #[error("cycle detected in hierarchy at node {0}")]
    CycleDetected(NodeId),

    #[error("parent name '{name}' matches multiple nodes: {candidates:?}")]
    AmbiguousParent {
        name: String,
        candidates: Vec<NodeId>,
    },

    #[error("node {0} has children; delete with cascade or reparent them first")]
    HasChildren(NodeId),

    #[error("format ambiguous: header confidence {confidence:.2} below threshold {threshold:.2}, unmatched columns: {unmatched:?}")]
    FormatAmbiguous {
        confidence: f64,
        threshold: f64,
        unmatched: Vec<String>,
    },

    #[error("invalid flag combination on node {id}: {reason}")]
    InvalidFlagCombination { id: NodeId, reason: String },

    #[error("negative sort value {value} in field {field}")]
    NegativeSort { field: String, value: i64 },

    #[error("node carries {count} levels, maximum is {max}")]
    LevelOverflow { count: usize, max: usize },

    #[error("formula rule for {rule} references unknown node {reference}")]
    UnresolvedFormulaReference { rule: NodeId, reference: NodeId },

    #[error("node {target} already has a formula rule")]
    DuplicateRuleTarget { target: NodeId },

    #[error("cycle in formula references: {members:?}")]
    FormulaCycle { members: Vec<NodeId> },

    #[error("formula rule for {rule} (tier {tier}) references {reference} defined in higher tier {reference_tier}")]
    TierViolation {
        rule: NodeId,
        tier: u8,
        reference: NodeId,
        reference_tier: u8,
    },

    #[error("formula tier {tier} outside allowed range 1..={max}")]
    TierOutOfRange { tier: u8, max: u8 },

    #[error("invalid formula expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("formula group already exists: {0}")]
    DuplicateFormulaGroup(String),

    #[error("unknown formula group: {0}")]
    UnknownFormulaGroup(String),

    #[error("required configuration field absent with no default: {field}")]
    NullConfig { field: String },

    #[error("malformed tabular input: {0}")]
    MalformedInput(String),
}
