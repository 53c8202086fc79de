//! Application services: the engine's operation surface.

pub mod exporter;
pub mod format;
pub mod formula_engine;
pub mod resolver;
pub mod store;
pub mod tree_builder;

pub use exporter::{Exporter, FullExport};
pub use format::{classify_hierarchy, classify_mappings, HeaderMap};
pub use formula_engine::{CellValue, EvaluationResult, FormulaEngine};
pub use resolver::{InheritedMappingView, MappingResolver, MappingSummary, OwnMappings};
pub use store::{ChangeEvent, ProjectState, Store};
pub use tree_builder::{ImportReport, TreeBuilder};
