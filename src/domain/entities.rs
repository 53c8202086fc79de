//! Domain entities: core data structures

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of ordered level labels a node may carry.
pub const MAX_LEVELS: usize = 15;

/// Precedence group assigned to mappings that do not declare one.
pub const DEFAULT_PRECEDENCE_GROUP: &str = "1";

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(ProjectId, "Identifier of a project (uuid-backed).");
string_id!(NodeId, "Identifier of a hierarchy node, unique within a project.");
string_id!(MappingId, "Identifier of a source mapping (uuid-backed).");

impl ProjectId {
    /// Generate a fresh random project id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MappingId {
    /// Generate a fresh random mapping id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Coordinates of a raw data source (database/schema/table/column).
///
/// On a mapping any field may be omitted; omitted fields are backfilled
/// from the owning project's defaults at the store boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceCoords {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
}

impl SourceCoords {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            database: Some(database.into()),
            schema: Some(schema.into()),
            table: Some(table.into()),
            column: Some(column.into()),
        }
    }

    /// Fill omitted fields from `defaults`, keeping present fields as-is.
    pub fn backfilled_from(&self, defaults: &SourceCoords) -> Self {
        Self {
            database: self.database.clone().or_else(|| defaults.database.clone()),
            schema: self.schema.clone().or_else(|| defaults.schema.clone()),
            table: self.table.clone().or_else(|| defaults.table.clone()),
            column: self.column.clone().or_else(|| defaults.column.clone()),
        }
    }
}

/// A project owning a set of nodes and formula groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Default source coordinates used to backfill omitted mapping fields.
    pub defaults: SourceCoords,
}

/// Fixed set of boolean flags on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFlags {
    pub include: bool,
    pub exclude: bool,
    pub transform: bool,
    pub calculation: bool,
    pub active: bool,
    pub is_leaf: bool,
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self {
            include: true,
            exclude: false,
            transform: false,
            calculation: false,
            active: true,
            is_leaf: false,
        }
    }
}

/// One level label with its independent sort value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLevel {
    pub label: String,
    pub sort: i64,
}

/// One entry in a reporting hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// None means root of a tree within the project forest.
    pub parent_id: Option<NodeId>,
    pub description: String,
    /// Up to [`MAX_LEVELS`] ordered level labels with per-level sort values.
    pub levels: Vec<NodeLevel>,
    pub flags: NodeFlags,
    pub formula_group: Option<String>,
    pub sort_order: i64,
}

/// Attributes for creating a node.
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    pub name: String,
    pub description: String,
    pub levels: Vec<NodeLevel>,
    pub flags: NodeFlags,
    pub formula_group: Option<String>,
    pub sort_order: i64,
}

/// Partial update of a node. `None` leaves the field untouched;
/// double-option fields use `Some(None)` to clear.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub name: Option<String>,
    pub parent_id: Option<Option<NodeId>>,
    pub description: Option<String>,
    pub levels: Option<Vec<NodeLevel>>,
    pub flags: Option<NodeFlags>,
    pub formula_group: Option<Option<String>>,
    pub sort_order: Option<i64>,
}

/// Fixed set of boolean flags on a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingFlags {
    pub include: bool,
    pub exclude: bool,
    pub transform: bool,
    pub active: bool,
}

impl Default for MappingFlags {
    fn default() -> Self {
        Self {
            include: true,
            exclude: false,
            transform: false,
            active: true,
        }
    }
}

/// A link from a node to a raw data source selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapping {
    pub id: MappingId,
    pub node_id: NodeId,
    /// Ordering within the node.
    pub mapping_index: u32,
    /// Named bucket segregating mappings for different contexts.
    pub precedence_group: String,
    pub coords: SourceCoords,
    /// Filter expression / value pattern (LIKE-style selector).
    pub source_uid: Option<String>,
    pub flags: MappingFlags,
}

/// Attributes for attaching a mapping to a node.
#[derive(Debug, Clone, Default)]
pub struct MappingAttrs {
    pub mapping_index: u32,
    /// Defaults to [`DEFAULT_PRECEDENCE_GROUP`] when absent.
    pub precedence_group: Option<String>,
    pub coords: SourceCoords,
    pub source_uid: Option<String>,
    pub flags: MappingFlags,
}

/// Derive a synthetic node id from a display name.
///
/// Used by low-tier imports where the file carries no explicit ids.
/// Uppercases and collapses every non-alphanumeric run to one underscore,
/// so "Product Revenue" and "product-revenue" map to the same id.
pub fn slug_id(name: &str) -> NodeId {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    NodeId(out)
}
