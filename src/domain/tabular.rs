//! Tabular input/output surface: canonical columns, tiers, dialects.
//!
//! The engine never opens files; collaborators hand it a [`TabularInput`]
//! (header row plus data rows). Four column schemas ("tiers") are
//! supported, from a minimal value/group pair up to the full enterprise
//! schema, each in two header dialects (legacy and current naming).

use serde::{Deserialize, Serialize};

use crate::domain::entities::MAX_LEVELS;
use crate::domain::error::DomainError;

/// Header naming dialect of a tabular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// Abbreviated historical names (HIER_ID, PRNT_ID, ...).
    Legacy,
    /// Spelled-out names (HIERARCHY_ID, PARENT_ID, ...).
    Current,
}

/// One of the four supported input column schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// 2-3 columns: source value + group name.
    Tier1,
    /// 5-7 columns: named parent/child rows.
    Tier2,
    /// 10-12 columns: explicit ids and core flags.
    Tier3,
    /// 28+ columns: full enterprise schema with per-level sort columns.
    Tier4,
}

impl Tier {
    /// Inclusive column-count range for this tier (upper bound open for Tier 4).
    pub fn column_range(&self) -> (usize, Option<usize>) {
        match self {
            Tier::Tier1 => (2, Some(3)),
            Tier::Tier2 => (5, Some(7)),
            Tier::Tier3 => (10, Some(12)),
            Tier::Tier4 => (28, None),
        }
    }

    /// Whether `count` columns are plausible for this tier.
    pub fn admits_column_count(&self, count: usize) -> bool {
        let (lo, hi) = self.column_range();
        count >= lo && hi.map_or(true, |h| count <= h)
    }

    /// Candidate canonical columns a file of this tier may carry.
    pub fn candidate_columns(&self) -> Vec<CanonicalColumn> {
        use CanonicalColumn::*;
        match self {
            Tier::Tier1 => vec![SourceValue, GroupName, SortOrder],
            Tier::Tier2 => vec![
                HierarchyName,
                ParentName,
                Description,
                SortOrder,
                SourceUid,
                IncludeFlag,
                ActiveFlag,
            ],
            Tier::Tier3 => vec![
                HierarchyId,
                HierarchyName,
                ParentId,
                Description,
                SortOrder,
                IncludeFlag,
                ExcludeFlag,
                TransformFlag,
                CalculationFlag,
                ActiveFlag,
                FormulaGroup,
                IsLeafNode,
            ],
            Tier::Tier4 => {
                let mut cols = vec![HierarchyId, HierarchyName, ParentId, Description];
                for n in 1..=MAX_LEVELS as u8 {
                    cols.push(Level(n));
                    cols.push(LevelSort(n));
                }
                cols.extend([
                    IncludeFlag,
                    ExcludeFlag,
                    TransformFlag,
                    CalculationFlag,
                    ActiveFlag,
                    IsLeafNode,
                    FormulaGroup,
                    SortOrder,
                ]);
                cols
            }
        }
    }
}

/// Canonical column of the hierarchy or mapping file surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalColumn {
    HierarchyId,
    HierarchyName,
    ParentId,
    ParentName,
    Description,
    Level(u8),
    LevelSort(u8),
    IncludeFlag,
    ExcludeFlag,
    TransformFlag,
    CalculationFlag,
    ActiveFlag,
    IsLeafNode,
    FormulaGroup,
    SortOrder,
    // Tier 1 surface
    SourceValue,
    GroupName,
    // Mapping file surface
    MappingIndex,
    SourceDatabase,
    SourceSchema,
    SourceTable,
    SourceColumn,
    SourceUid,
    PrecedenceGroup,
}

impl CanonicalColumn {
    /// Header text for this column in the given dialect.
    pub fn header(&self, dialect: Dialect) -> String {
        use CanonicalColumn::*;
        match dialect {
            Dialect::Current => match self {
                HierarchyId => "HIERARCHY_ID".to_string(),
                HierarchyName => "HIERARCHY_NAME".to_string(),
                ParentId => "PARENT_ID".to_string(),
                ParentName => "PARENT_NAME".to_string(),
                Description => "DESCRIPTION".to_string(),
                Level(n) => format!("LEVEL_{n}"),
                LevelSort(n) => format!("LEVEL_{n}_SORT"),
                IncludeFlag => "INCLUDE_FLAG".to_string(),
                ExcludeFlag => "EXCLUDE_FLAG".to_string(),
                TransformFlag => "TRANSFORM_FLAG".to_string(),
                CalculationFlag => "CALCULATION_FLAG".to_string(),
                ActiveFlag => "ACTIVE_FLAG".to_string(),
                IsLeafNode => "IS_LEAF_NODE".to_string(),
                FormulaGroup => "FORMULA_GROUP".to_string(),
                SortOrder => "SORT_ORDER".to_string(),
                SourceValue => "SOURCE_VALUE".to_string(),
                GroupName => "GROUP_NAME".to_string(),
                MappingIndex => "MAPPING_INDEX".to_string(),
                SourceDatabase => "SOURCE_DATABASE".to_string(),
                SourceSchema => "SOURCE_SCHEMA".to_string(),
                SourceTable => "SOURCE_TABLE".to_string(),
                SourceColumn => "SOURCE_COLUMN".to_string(),
                SourceUid => "SOURCE_UID".to_string(),
                PrecedenceGroup => "PRECEDENCE_GROUP".to_string(),
            },
            Dialect::Legacy => match self {
                HierarchyId => "HIER_ID".to_string(),
                HierarchyName => "HIER_NAME".to_string(),
                ParentId => "PRNT_ID".to_string(),
                ParentName => "PRNT_NAME".to_string(),
                Description => "DESC_TXT".to_string(),
                Level(n) => format!("LVL_{n}"),
                LevelSort(n) => format!("LVL_{n}_SORT"),
                IncludeFlag => "INCL_FLG".to_string(),
                ExcludeFlag => "EXCL_FLG".to_string(),
                TransformFlag => "XFRM_FLG".to_string(),
                CalculationFlag => "CALC_FLG".to_string(),
                ActiveFlag => "ACTV_FLG".to_string(),
                IsLeafNode => "LEAF_FLG".to_string(),
                FormulaGroup => "FORMULA_GRP".to_string(),
                SortOrder => "SORT_ORDR".to_string(),
                SourceValue => "SRC_VAL".to_string(),
                GroupName => "GRP_NAME".to_string(),
                MappingIndex => "MAP_IDX".to_string(),
                SourceDatabase => "SRC_DB".to_string(),
                SourceSchema => "SRC_SCHEMA".to_string(),
                SourceTable => "SRC_TBL".to_string(),
                SourceColumn => "SRC_COL".to_string(),
                SourceUid => "SRC_UID".to_string(),
                PrecedenceGroup => "PREC_GRP".to_string(),
            },
        }
    }

    /// True for the per-level sort columns, which only the hierarchy file
    /// may supply. The mapping importer refuses to read them.
    pub fn is_sort_column(&self) -> bool {
        matches!(self, CanonicalColumn::LevelSort(_) | CanonicalColumn::SortOrder)
    }
}

/// Columns of the mapping file surface. Never carries sort values.
pub fn mapping_columns() -> Vec<CanonicalColumn> {
    use CanonicalColumn::*;
    vec![
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
    ]
}

/// Raw tabular data: one header row plus data rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularInput {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TabularInput {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Parse delimiter-separated text (first line is the header row).
    ///
    /// Every data row must have exactly as many cells as the header;
    /// a ragged row is a [`DomainError::MalformedInput`].
    pub fn from_delimited(text: &str, delimiter: char) -> Result<Self, DomainError> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header_line = lines
            .next()
            .ok_or_else(|| DomainError::MalformedInput("input has no header row".to_string()))?;
        let headers: Vec<String> = header_line
            .split(delimiter)
            .map(|c| c.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (idx, line) in lines.enumerate() {
            let cells: Vec<String> = line.split(delimiter).map(|c| c.trim().to_string()).collect();
            if cells.len() != headers.len() {
                return Err(DomainError::MalformedInput(format!(
                    "row {} has {} cells, header has {}",
                    idx + 1,
                    cells.len(),
                    headers.len()
                )));
            }
            rows.push(cells);
        }

        Ok(Self { headers, rows })
    }

    /// Render back to delimiter-separated text.
    pub fn to_delimited(&self, delimiter: char) -> String {
        let sep = delimiter.to_string();
        let mut out = self.headers.join(&sep);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join(&sep));
            out.push('\n');
        }
        out
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }
}

/// Parse a flag cell: `Y`/`N`, `1`/`0`, `TRUE`/`FALSE` (case-insensitive).
/// Empty cells yield `default`.
pub fn parse_flag(cell: &str, default: bool) -> bool {
    match cell.trim().to_ascii_uppercase().as_str() {
        "" => default,
        "Y" | "YES" | "1" | "TRUE" | "T" => true,
        _ => false,
    }
}

/// Render a flag cell as `Y`/`N`.
pub fn render_flag(value: bool) -> &'static str {
    if value {
        "Y"
    } else {
        "N"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_delimited_text_when_parsing_then_headers_and_rows_split() {
        let input = TabularInput::from_delimited("A,B\n1,2\n3,4\n", ',').unwrap();
        assert_eq!(input.headers, vec!["A", "B"]);
        assert_eq!(input.rows.len(), 2);
        assert_eq!(input.rows[1], vec!["3", "4"]);
    }

    #[test]
    fn given_ragged_row_when_parsing_then_errors() {
        let result = TabularInput::from_delimited("A,B\n1,2,3\n", ',');
        assert!(matches!(result, Err(DomainError::MalformedInput(_))));
    }

    #[test]
    fn given_tier4_candidates_then_column_count_covers_enterprise_schema() {
        let cols = Tier::Tier4.candidate_columns();
        // 4 identity columns + 15 level pairs + 6 flags + group + sort
        assert_eq!(cols.len(), 4 + 2 * MAX_LEVELS + 8);
    }

    #[test]
    fn given_flag_cells_when_parsing_then_common_spellings_accepted() {
        assert!(parse_flag("Y", false));
        assert!(parse_flag("true", false));
        assert!(!parse_flag("N", true));
        assert!(parse_flag("", true));
    }
}
