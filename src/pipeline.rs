//! Cached validation of a single package

use crate::batch::Task;
use crate::cache::{CacheKey, CacheStore, CacheValue, ContentHash, Metadata};
use crate::error::{ModcheckError, ModcheckResult};
use crate::monitor::{OpKind, OpMetadata, OpResult, PerformanceMonitor};
use crate::package::{PackageId, Validator, Workspace};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Result of checking one package
#[derive(Debug, Clone, PartialEq)]
pub struct Checked<R> {
    pub result: R,
    /// Whether the result came from the cache
    pub cached: bool,
}

/// Hash, look up, and on a miss validate and store
pub struct ValidationPipeline<R> {
    store: Arc<CacheStore<R>>,
    validator: Arc<dyn Validator<R>>,
    workspace: Arc<dyn Workspace>,
    monitor: Arc<PerformanceMonitor>,
}

impl<R> Clone for ValidationPipeline<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            validator: Arc::clone(&self.validator),
            workspace: Arc::clone(&self.workspace),
            monitor: Arc::clone(&self.monitor),
        }
    }
}

impl<R: CacheValue> ValidationPipeline<R> {
    /// Bind a store to a validator.
    ///
    /// The store must have been opened with the validator's version tag,
    /// otherwise results of another validation logic could be served.
    pub fn new(
        store: Arc<CacheStore<R>>,
        validator: Arc<dyn Validator<R>>,
        workspace: Arc<dyn Workspace>,
        monitor: Arc<PerformanceMonitor>,
    ) -> ModcheckResult<Self> {
        if store.validator_version() != validator.version() {
            return Err(ModcheckError::ValidatorVersionMismatch {
                store: store.validator_version().to_string(),
                validator: validator.version().to_string(),
            });
        }
        Ok(Self {
            store,
            validator,
            workspace,
            monitor,
        })
    }

    pub fn store(&self) -> &Arc<CacheStore<R>> {
        &self.store
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.workspace
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Cache key the package's results are stored under
    pub fn key_for(&self, package: &PackageId) -> CacheKey {
        let fingerprint = self.validator.options_fingerprint();
        CacheKey::for_package(package, fingerprint.as_deref())
    }

    /// Validate `package`, reusing a cached result when its inputs are
    /// unchanged. Validation errors are returned and never cached.
    pub async fn check(&self, package: &PackageId) -> ModcheckResult<Checked<R>> {
        let op_id = format!("check:{}:{}", package, Uuid::new_v4());
        self.monitor
            .start_op(op_id.clone(), OpMetadata::for_package(OpKind::Validation, package));

        let outcome = self.check_inner(package).await;
        let result = match &outcome {
            Ok(checked) => OpResult::ok().with_cache_hit(checked.cached),
            Err(_) => OpResult::failed(),
        };
        self.monitor.end_op(&op_id, result);
        outcome
    }

    async fn check_inner(&self, package: &PackageId) -> ModcheckResult<Checked<R>> {
        let inputs = self.workspace.inputs_of(package)?;
        let hash = ContentHash::of_files(&inputs.files).await?;
        let key = self.key_for(package);

        if let Some(result) = self.store.get(&key, &hash).await {
            debug!("Cache hit for {} ({})", package, hash);
            return Ok(Checked {
                result,
                cached: true,
            });
        }

        debug!("Cache miss for {} ({}), validating", package, hash);
        let result = self.validator.validate(package).await?;
        self.store.set(
            &key,
            &hash,
            &result,
            Metadata::new(inputs.files, inputs.dependencies),
        )?;

        Ok(Checked {
            result,
            cached: false,
        })
    }

    /// One batch task per package, identified by the package id
    pub fn tasks(&self, packages: &[PackageId]) -> Vec<Task<Checked<R>>> {
        packages
            .iter()
            .map(|package| {
                let pipeline = self.clone();
                let package = package.clone();
                Task::new(package.to_string(), move || async move {
                    pipeline.check(&package).await
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StoreOptions;
    use crate::package::PackageGraph;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingValidator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Validator<String> for CountingValidator {
        fn version(&self) -> &str {
            "1"
        }

        async fn validate(&self, package: &PackageId) -> ModcheckResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if package.as_str() == "broken" {
                return Err(ModcheckError::validation("broken", "missing manifest"));
            }
            Ok(format!("{package}: ok"))
        }
    }

    fn setup(dir: &TempDir) -> (ValidationPipeline<String>, Arc<CountingValidator>) {
        let core = dir.path().join("core");
        std::fs::create_dir_all(&core).unwrap();
        std::fs::write(core.join("a.json"), b"{}").unwrap();

        let graph = PackageGraph::new()
            .with_package("core", &core, vec![core.join("a.json")], vec![])
            .with_package("broken", dir.path().join("broken"), vec![], vec![]);

        let validator = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(CacheStore::memory_only(StoreOptions::default(), "1"));
        let pipeline = ValidationPipeline::new(
            store,
            Arc::clone(&validator) as Arc<dyn Validator<String>>,
            Arc::new(graph),
            Arc::new(PerformanceMonitor::default()),
        )
        .unwrap();
        (pipeline, validator)
    }

    struct TaggedValidator(&'static str);

    #[async_trait]
    impl Validator<String> for TaggedValidator {
        fn version(&self) -> &str {
            self.0
        }

        async fn validate(&self, package: &PackageId) -> ModcheckResult<String> {
            Ok(format!("{package} by {}", self.0))
        }
    }

    #[tokio::test]
    async fn store_of_another_validator_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let core = dir.path().join("core");
        std::fs::create_dir_all(&core).unwrap();
        std::fs::write(core.join("a.json"), b"{}").unwrap();
        let graph: Arc<dyn Workspace> = Arc::new(PackageGraph::new().with_package(
            "core",
            &core,
            vec![core.join("a.json")],
            vec![],
        ));

        let store = Arc::new(CacheStore::memory_only(StoreOptions::default(), "1"));
        let v1 = ValidationPipeline::new(
            Arc::clone(&store),
            Arc::new(TaggedValidator("1")),
            Arc::clone(&graph),
            Arc::new(PerformanceMonitor::default()),
        )
        .unwrap();
        assert!(!v1.check(&"core".into()).await.unwrap().cached);

        let err = ValidationPipeline::new(
            Arc::clone(&store),
            Arc::new(TaggedValidator("2")),
            Arc::clone(&graph),
            Arc::new(PerformanceMonitor::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            ModcheckError::ValidatorVersionMismatch { ref store, ref validator }
                if store == "1" && validator == "2"
        ));

        let v2 = ValidationPipeline::new(
            Arc::new(CacheStore::memory_only(StoreOptions::default(), "2")),
            Arc::new(TaggedValidator("2")),
            graph,
            Arc::new(PerformanceMonitor::default()),
        )
        .unwrap();
        let checked = v2.check(&"core".into()).await.unwrap();
        assert!(!checked.cached);
        assert_eq!(checked.result, "core by 2");
    }

    #[tokio::test]
    async fn second_check_is_cached() {
        let dir = TempDir::new().unwrap();
        let (pipeline, validator) = setup(&dir);

        let first = pipeline.check(&"core".into()).await.unwrap();
        assert!(!first.cached);
        let second = pipeline.check(&"core".into()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.result, "core: ok");
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);

        let stats = pipeline.monitor().stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test]
    async fn changed_file_revalidates() {
        let dir = TempDir::new().unwrap();
        let (pipeline, validator) = setup(&dir);

        pipeline.check(&"core".into()).await.unwrap();
        std::fs::write(dir.path().join("core/a.json"), b"{\"changed\":true}").unwrap();
        let again = pipeline.check(&"core".into()).await.unwrap();

        assert!(!again.cached);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let (pipeline, validator) = setup(&dir);

        assert!(pipeline.check(&"broken".into()).await.is_err());
        assert!(pipeline.check(&"broken".into()).await.is_err());
        assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
        assert!(!pipeline.store().contains(&pipeline.key_for(&"broken".into())));
    }

    #[tokio::test]
    async fn tasks_are_keyed_by_package() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = setup(&dir);
        let tasks = pipeline.tasks(&["core".into(), "broken".into()]);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["core", "broken"]);
    }
}
