//! Domain layer: entities and business logic
//!
//! This layer is independent of external concerns (no I/O, no config loading).

pub mod arena;
pub mod entities;
pub mod error;
pub mod formula;
pub mod tabular;

pub use arena::{ForestIterator, NodeArena, TreeSlot};
pub use entities::*;
pub use error::DomainError;
pub use formula::{
    FormulaExpr, FormulaGroup, FormulaOp, FormulaRule, FormulaTerm, RawExpr, RawTerm,
};
pub use tabular::{
    mapping_columns, parse_flag, render_flag, CanonicalColumn, Dialect, TabularInput, Tier,
};
