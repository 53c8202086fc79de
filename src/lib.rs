//! hierbase: an embeddable engine for hierarchical knowledge bases.
//!
//! Projects hold forests of nodes; leaves map to raw data source
//! selectors, inner nodes aggregate them, and formula rules compute
//! derived nodes in precedence tiers. Tabular files in four schema tiers
//! import atomically through a scored format classifier, and every
//! project exports losslessly to the full tabular surface or JSON.
//!
//! Layering follows domain / application / infrastructure: the domain is
//! pure data and invariants, application services carry the operations,
//! and infrastructure holds the I/O boundary traits plus the DI
//! container.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod util;

pub use application::error::{ApplicationError, ApplicationResult, ImportStage, RowError};
pub use application::services::{
    CellValue, ChangeEvent, EvaluationResult, Exporter, FormulaEngine, FullExport, ImportReport,
    MappingResolver, ProjectState, Store, TreeBuilder,
};
pub use config::Settings;
pub use domain::entities::{
    MappingAttrs, MappingId, Node, NodeAttrs, NodeId, NodePatch, Project, ProjectId, SourceCoords,
    SourceMapping,
};
pub use domain::error::DomainError;
pub use domain::tabular::{Dialect, TabularInput, Tier};
pub use infrastructure::di::ServiceContainer;
