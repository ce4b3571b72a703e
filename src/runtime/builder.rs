use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use crate::config::EngineConfig;
use crate::executor::OperatorExecutor;
use crate::pipeline::CatalogHandle;
use crate::store::RunStore;

use super::scheduler::RunScheduler;

/// Builder for constructing a [`RunScheduler`] with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the scheduler. Each dependency is configured via a `with_*`
/// method.
///
/// # Example
///
/// ```ignore
/// use crucible::{RunSchedulerBuilder, EngineConfig};
///
/// let scheduler = RunSchedulerBuilder::new(EngineConfig::default())
///     .with_catalog(catalog)
///     .with_store(store)
///     .with_executor(executor)
///     .build()?;
/// ```
pub struct RunSchedulerBuilder {
    config: EngineConfig,
    catalog: Option<CatalogHandle>,
    store: Option<Arc<dyn RunStore>>,
    executor: Option<Arc<dyn OperatorExecutor>>,
}

impl fmt::Debug for RunSchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSchedulerBuilder")
            .field("config", &self.config)
            .field("catalog_set", &self.catalog.is_some())
            .field("store_set", &self.store.is_some())
            .field("executor_set", &self.executor.is_some())
            .finish()
    }
}

impl RunSchedulerBuilder {
    /// Create a new builder with the given engine configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            catalog: None,
            store: None,
            executor: None,
        }
    }

    /// Set the dataset/pipeline catalog.
    pub fn with_catalog(mut self, catalog: CatalogHandle) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the lifecycle store.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the operator executor that computes folds.
    pub fn with_executor(mut self, executor: Arc<dyn OperatorExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate dependencies and construct the scheduler.
    pub fn build(self) -> anyhow::Result<RunScheduler> {
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow!("catalog is required: call with_catalog()"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow!("store is required: call with_store()"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow!("executor is required: call with_executor()"))?;

        Ok(RunScheduler::new(self.config, catalog, store, executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FoldError;
    use crate::executor::{FoldContext, FoldOutcome};
    use crate::pipeline::InMemoryCatalog;
    use crate::store::InMemoryRunStore;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl OperatorExecutor for NoopExecutor {
        async fn execute_fold(&self, _ctx: FoldContext) -> Result<FoldOutcome, FoldError> {
            Ok(FoldOutcome::default())
        }
    }

    #[test]
    fn test_build_requires_all_dependencies() {
        let err = RunSchedulerBuilder::new(EngineConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("catalog"));

        let err = RunSchedulerBuilder::new(EngineConfig::default())
            .with_catalog(Arc::new(InMemoryCatalog::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("store"));

        let err = RunSchedulerBuilder::new(EngineConfig::default())
            .with_catalog(Arc::new(InMemoryCatalog::new()))
            .with_store(Arc::new(InMemoryRunStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("executor"));
    }

    #[test]
    fn test_build_with_all_dependencies() {
        let scheduler = RunSchedulerBuilder::new(EngineConfig::default())
            .with_catalog(Arc::new(InMemoryCatalog::new()))
            .with_store(Arc::new(InMemoryRunStore::new()))
            .with_executor(Arc::new(NoopExecutor))
            .build();
        assert!(scheduler.is_ok());
    }
}
