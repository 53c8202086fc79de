//! Application-level errors (wraps domain errors)

use std::fmt;

use thiserror::Error;

use crate::domain::DomainError;

/// Stage of the import pipeline an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Received,
    FormatDetected,
    Normalized,
    Validated,
    Committed,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::FormatDetected => "format-detected",
            Self::Normalized => "normalized",
            Self::Validated => "validated",
            Self::Committed => "committed",
        };
        write!(f, "{name}")
    }
}

/// One structured (row, reason) pair from a rejected batch.
/// `row` is the zero-based data-row index; `None` for batch-level errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub row: Option<usize>,
    pub error: DomainError,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {row}: {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Application errors wrap domain errors and add operation-level context.
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("import rejected at stage {stage}: {}", format_row_errors(errors))]
    ImportRejected {
        stage: ImportStage,
        errors: Vec<RowError>,
    },

    #[error("config error: {message}")]
    Config { message: String },

    #[error("operation failed: {context}")]
    OperationFailed {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

fn format_row_errors(errors: &[RowError]) -> String {
    let mut parts: Vec<String> = errors.iter().take(5).map(|e| e.to_string()).collect();
    if errors.len() > 5 {
        parts.push(format!("... and {} more", errors.len() - 5));
    }
    parts.join("; ")
}

impl ApplicationError {
    /// The structured error list of a rejected import, if this is one.
    pub fn row_errors(&self) -> Option<&[RowError]> {
        match self {
            Self::ImportRejected { errors, .. } => Some(errors),
            _ => None,
        }
    }
}

/// Result type for application layer operations.
pub type ApplicationResult<T> = Result<T, ApplicationError>;
