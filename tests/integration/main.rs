//! Integration tests for Modcheck

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use modcheck::cache::{CacheKey, CacheStore, ContentHash, Metadata, StoreOptions};
    use modcheck::config::Config;
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn modcheck() -> Command {
        cargo_bin_cmd!("modcheck")
    }

    /// Write a config pointing the cache at `<temp>/cache`
    fn temp_config(temp: &TempDir) -> (PathBuf, PathBuf) {
        let cache_dir = temp.path().join("cache");
        let mut config = Config::default();
        config.cache.dir = Some(cache_dir.clone());

        let path = temp.path().join("config.toml");
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
        (path, cache_dir)
    }

    fn populate(cache_dir: &Path, keys: &[&str]) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let options = StoreOptions::memory_only(1 << 20).with_dir(cache_dir);
            let store: CacheStore<String> = CacheStore::open(options, "1").await.unwrap();
            for key in keys {
                store
                    .set(
                        &CacheKey::from(*key),
                        &ContentHash::of_bytes(key.as_bytes()),
                        &format!("{key} ok"),
                        Metadata::default(),
                    )
                    .unwrap();
            }
            store.flush().await.unwrap();
        });
    }

    #[test]
    fn help_displays() {
        modcheck()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("validation cache"));
    }

    #[test]
    fn version_displays() {
        modcheck()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("modcheck"));
    }

    #[test]
    fn config_path_honors_flag() {
        let temp = TempDir::new().unwrap();
        let (path, _) = temp_config(&temp);
        modcheck()
            .args(["--config", path.to_str().unwrap(), "config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        let (path, _) = temp_config(&temp);
        modcheck()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]").and(predicate::str::contains("[batch]")));
    }

    #[test]
    fn config_init_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        modcheck()
            .args(["--config", path.to_str().unwrap(), "config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(path.exists());
    }

    #[test]
    fn invalid_config_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[batch]\nconcurrency = 0\n").unwrap();
        modcheck()
            .args(["--config", path.to_str().unwrap(), "cache", "stats"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn cache_stats_without_dir() {
        let temp = TempDir::new().unwrap();
        let (path, _) = temp_config(&temp);
        modcheck()
            .args(["--config", path.to_str().unwrap(), "cache", "stats"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache directory yet"));
    }

    #[test]
    fn cache_stats_json() {
        let temp = TempDir::new().unwrap();
        let (path, cache_dir) = temp_config(&temp);
        populate(&cache_dir, &["core", "ui"]);

        modcheck()
            .args([
                "--config",
                path.to_str().unwrap(),
                "cache",
                "stats",
                "--format",
                "json",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"entries\": 2"));
    }

    #[test]
    fn cache_prune_removes_foreign_versions() {
        let temp = TempDir::new().unwrap();
        let (path, cache_dir) = temp_config(&temp);
        populate(&cache_dir, &["core", "ui"]);

        modcheck()
            .args([
                "--config",
                path.to_str().unwrap(),
                "cache",
                "prune",
                "--validator-version",
                "2",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("removed 2 of 2"));
    }

    #[test]
    fn cache_clear_requires_confirmation() {
        let temp = TempDir::new().unwrap();
        let (path, cache_dir) = temp_config(&temp);
        populate(&cache_dir, &["core"]);

        modcheck()
            .args(["--config", path.to_str().unwrap(), "cache", "clear"])
            .write_stdin("n\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("Aborted."));

        modcheck()
            .args(["--config", path.to_str().unwrap(), "cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cleared 1 entry"));

        modcheck()
            .args(["--config", path.to_str().unwrap(), "cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached entries to clear"));
    }
}

mod scenario_tests {
    use async_trait::async_trait;
    use modcheck::cache::{CacheKey, CacheStore, ContentHash, Metadata, StoreOptions};
    use modcheck::config::{BatchConfig, WatchConfig};
    use modcheck::coordinator::{IncrementalCoordinator, PackageOutcome};
    use modcheck::monitor::PerformanceMonitor;
    use modcheck::package::{DependencyGraph, PackageGraph, PackageId, Validator, Workspace};
    use modcheck::pipeline::ValidationPipeline;
    use modcheck::ModcheckResult;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ValidationResult {
        package: String,
        warnings: Vec<String>,
    }

    struct ManifestValidator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Validator<ValidationResult> for ManifestValidator {
        fn version(&self) -> &str {
            "schema-7"
        }

        async fn validate(&self, package: &PackageId) -> ModcheckResult<ValidationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ValidationResult {
                package: package.to_string(),
                warnings: vec![],
            })
        }
    }

    #[tokio::test]
    async fn hash_change_misses_after_set() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.json");
        std::fs::write(&file, r#"{"name":"a"}"#).unwrap();

        let store: CacheStore<ValidationResult> =
            CacheStore::memory_only(StoreOptions::default(), "schema-7");
        let key = CacheKey::from("pkg-a:v1");
        let hash_a = ContentHash::of_files(std::slice::from_ref(&file)).await.unwrap();

        assert!(store.get(&key, &hash_a).await.is_none());

        let result_a = ValidationResult {
            package: "pkg-a".to_string(),
            warnings: vec!["unused texture".to_string()],
        };
        store
            .set(&key, &hash_a, &result_a, Metadata::files_only(vec![PathBuf::from("a.json")]))
            .unwrap();
        assert_eq!(store.get(&key, &hash_a).await, Some(result_a));

        std::fs::write(&file, r#"{"name":"a","version":2}"#).unwrap();
        let hash_a2 = ContentHash::of_files(std::slice::from_ref(&file)).await.unwrap();
        assert_ne!(hash_a, hash_a2);
        assert!(store.get(&key, &hash_a2).await.is_none());
    }

    #[tokio::test]
    async fn dependency_invalidation_survives_restart() {
        let temp = TempDir::new().unwrap();
        let options = StoreOptions::memory_only(1 << 20).with_dir(temp.path());
        let result = ValidationResult {
            package: "ui".to_string(),
            warnings: vec![],
        };

        {
            let store = CacheStore::open(options.clone(), "schema-7").await.unwrap();
            store
                .set(
                    &CacheKey::from("ui"),
                    &ContentHash::from("u1"),
                    &result,
                    Metadata::new(vec![PathBuf::from("/mods/ui/ui.json")], vec!["core".into()]),
                )
                .unwrap();
            store.flush().await.unwrap();
        }

        let store: CacheStore<ValidationResult> =
            CacheStore::open(options, "schema-7").await.unwrap();
        assert_eq!(store.get(&CacheKey::from("ui"), &ContentHash::from("u1")).await, Some(result));

        assert_eq!(store.invalidate(&[], &["core".into()]), 1);
        assert!(store.get(&CacheKey::from("ui"), &ContentHash::from("u1")).await.is_none());
    }

    #[tokio::test]
    async fn unusable_dir_falls_back_to_memory() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let options = StoreOptions::memory_only(1 << 20).with_dir(blocker.join("cache"));
        let store = match CacheStore::<ValidationResult>::open(options.clone(), "schema-7").await {
            Ok(store) => store,
            Err(e) if e.is_fallback_eligible() => CacheStore::memory_only(options, "schema-7"),
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn change_revalidates_only_affected_packages() {
        let temp = TempDir::new().unwrap();
        let mods = temp.path().join("mods");
        let mut graph = PackageGraph::new();
        for (name, deps) in [("core", vec![]), ("ui", vec!["core"]), ("maps", vec![])] {
            let root = mods.join(name);
            std::fs::create_dir_all(&root).unwrap();
            let manifest = root.join("manifest.json");
            std::fs::write(&manifest, name).unwrap();
            graph.insert(
                name,
                &root,
                vec![manifest],
                deps.into_iter().map(PackageId::from).collect(),
            );
        }
        let graph = Arc::new(graph);

        let options = StoreOptions::memory_only(1 << 20).with_dir(temp.path().join("cache"));
        let store = Arc::new(CacheStore::open(options, "schema-7").await.unwrap());
        let validator = Arc::new(ManifestValidator {
            calls: AtomicUsize::new(0),
        });
        let pipeline = ValidationPipeline::new(
            Arc::clone(&store),
            Arc::clone(&validator) as Arc<dyn Validator<ValidationResult>>,
            Arc::clone(&graph) as Arc<dyn Workspace>,
            Arc::new(PerformanceMonitor::default()),
        )
        .unwrap();

        for name in ["core", "ui", "maps"] {
            assert!(!pipeline.check(&name.into()).await.unwrap().cached);
        }

        let handle = IncrementalCoordinator::new(
            pipeline.clone(),
            Arc::clone(&graph) as Arc<dyn DependencyGraph>,
            &BatchConfig::default(),
            &WatchConfig { debounce_ms: 50 },
        )
        .unwrap()
        .spawn();
        let mut reports = handle.subscribe();

        let changed = mods.join("core").join("manifest.json");
        std::fs::write(&changed, "core v2").unwrap();
        handle.on_files_changed(vec![changed]).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.affected.len(), 2);
        assert!(report
            .outcomes
            .values()
            .all(|o| matches!(o, PackageOutcome::Valid { cached: false, .. })));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 5);

        assert!(pipeline.check(&"maps".into()).await.unwrap().cached);
        handle.shutdown().await.unwrap();
    }
}
