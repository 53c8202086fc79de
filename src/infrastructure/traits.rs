//! I/O boundary traits for testability
//!
//! The engine never opens files or sockets itself. Collaborators provide
//! tabular records through [`RecordSource`] and receive change
//! notifications through [`ChangeSink`]; both have in-memory
//! implementations for embedding and tests.

use std::sync::Mutex;

use crate::application::services::store::ChangeEvent;
use crate::domain::tabular::TabularInput;
use crate::infrastructure::error::InfraResult;

/// Supplier of raw tabular records (a file reader, a database cursor, a
/// network client).
pub trait RecordSource: Send + Sync {
    /// A label for error messages, e.g. a file path or query name.
    fn describe(&self) -> String;

    /// Produce the full record set.
    fn read_records(&self) -> InfraResult<TabularInput>;
}

/// In-memory record source.
#[derive(Debug, Clone)]
pub struct StaticRecords {
    label: String,
    input: TabularInput,
}

impl StaticRecords {
    pub fn new(label: impl Into<String>, input: TabularInput) -> Self {
        Self {
            label: label.into(),
            input,
        }
    }
}

impl RecordSource for StaticRecords {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn read_records(&self) -> InfraResult<TabularInput> {
        Ok(self.input.clone())
    }
}

/// Receiver of change events published after each successful store write.
///
/// A remote-sync collaborator mirrors state from these events; external
/// updates re-enter through the ordinary store operations. Sinks must not
/// block: they are called outside the store locks but on the writer's
/// thread.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, event: &ChangeEvent);
}

/// Sink collecting events in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ChangeEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events received so far.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take and clear the received events.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl ChangeSink for CollectingSink {
    fn publish(&self, event: &ChangeEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
