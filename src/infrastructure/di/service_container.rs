//! Service container for dependency injection
//!
//! Wires up all services with their dependencies.

use std::sync::Arc;

use crate::application::error::{ApplicationError, ApplicationResult};
use crate::application::services::exporter::Exporter;
use crate::application::services::formula_engine::FormulaEngine;
use crate::application::services::resolver::MappingResolver;
use crate::application::services::store::Store;
use crate::application::services::tree_builder::{ImportReport, TreeBuilder};
use crate::config::Settings;
use crate::domain::entities::ProjectId;
use crate::infrastructure::traits::RecordSource;

/// Container holding all application services.
pub struct ServiceContainer {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub tree_builder: TreeBuilder,
    pub resolver: MappingResolver,
    pub formula_engine: FormulaEngine,
    pub exporter: Exporter,
}

impl ServiceContainer {
    /// Create a container with the given settings and an empty store.
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let store = Arc::new(Store::new(&settings));
        let tree_builder = TreeBuilder::new(Arc::clone(&store), Arc::clone(&settings));

        Self {
            settings,
            store,
            tree_builder,
            resolver: MappingResolver::new(),
            formula_engine: FormulaEngine::new(),
            exporter: Exporter::new(),
        }
    }

    /// Create a container from the layered on-disk configuration.
    pub fn from_env() -> ApplicationResult<Self> {
        Ok(Self::new(Settings::load()?))
    }

    /// Read records from a source and import them as a hierarchy file.
    pub fn import_hierarchy_from(
        &self,
        project: &ProjectId,
        source: &dyn RecordSource,
    ) -> ApplicationResult<ImportReport> {
        let input = source
            .read_records()
            .map_err(|e| ApplicationError::OperationFailed {
                context: format!("reading records from {}", source.describe()),
                source: Box::new(e),
            })?;
        self.tree_builder.import_hierarchy(project, &input, None)
    }

    /// Read records from a source and import them as a mapping file.
    pub fn import_mappings_from(
        &self,
        project: &ProjectId,
        source: &dyn RecordSource,
    ) -> ApplicationResult<ImportReport> {
        let input = source
            .read_records()
            .map_err(|e| ApplicationError::OperationFailed {
                context: format!("reading records from {}", source.describe()),
                source: Box::new(e),
            })?;
        self.tree_builder.import_mappings(project, &input)
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
