//! Invalidation index
//!
//! Tracks, per cache entry, the files and dependency packages it was computed
//! from, and answers which entries a set of changes invalidates.
//!
//! An entry is affected iff one of its files matches a changed path or one of
//! its dependencies is a changed package. Missing a match serves stale
//! results; an extra match only costs a revalidation. Ambiguous path
//! comparisons therefore resolve towards matching.
//!
//! # Path matching
//!
//! Paths are normalized lexically first (`.` dropped, `..` folded, `\`
//! treated as a separator). Equal paths always match. With
//! [`PathMatch::Suffix`] a relative path also matches any path ending in the
//! same components, so `a.json` matches `/mods/core/a.json`. Two different
//! absolute paths never match.

use crate::cache::entry::Metadata;
use crate::cache::key::CacheKey;
use crate::config::PathMatch;
use crate::package::PackageId;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let unified = path.to_string_lossy().replace('\\', "/");
    let mut parts: Vec<Component<'_>> = Vec::new();

    for comp in Path::new(&unified).components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(comp),
            },
            other => parts.push(other),
        }
    }

    parts.iter().collect()
}

/// Compare two normalized paths under a matching strategy
pub fn paths_match(a: &Path, b: &Path, mode: PathMatch) -> bool {
    if a == b {
        return true;
    }
    if mode == PathMatch::Exact {
        return false;
    }

    let a_abs = a.is_absolute();
    let b_abs = b.is_absolute();
    if a_abs && b_abs {
        return false;
    }

    (!a_abs && is_component_suffix(a, b)) || (!b_abs && is_component_suffix(b, a))
}

fn is_component_suffix(short: &Path, long: &Path) -> bool {
    let short: Vec<Component<'_>> = short.components().collect();
    let long: Vec<Component<'_>> = long.components().collect();
    !short.is_empty() && long.len() >= short.len() && long[long.len() - short.len()..] == short[..]
}

fn last_component(path: &Path) -> Option<OsString> {
    path.components()
        .next_back()
        .map(|c| c.as_os_str().to_os_string())
}

#[derive(Debug, Clone)]
struct IndexRecord {
    files: Vec<PathBuf>,
    dependencies: Vec<PackageId>,
}

/// Reverse index from files and dependencies to cache keys
#[derive(Debug)]
pub struct InvalidationIndex {
    mode: PathMatch,
    records: HashMap<CacheKey, IndexRecord>,
    by_name: HashMap<OsString, HashSet<CacheKey>>,
    by_dependency: HashMap<PackageId, HashSet<CacheKey>>,
}

impl InvalidationIndex {
    /// Create an empty index
    pub fn new(mode: PathMatch) -> Self {
        Self {
            mode,
            records: HashMap::new(),
            by_name: HashMap::new(),
            by_dependency: HashMap::new(),
        }
    }

    /// Record the inputs of `key`, replacing anything recorded before
    pub fn insert(&mut self, key: &CacheKey, metadata: &Metadata) {
        self.remove(key);

        let files: Vec<PathBuf> = metadata.files().iter().map(|f| normalize_path(f)).collect();
        for file in &files {
            if let Some(name) = last_component(file) {
                self.by_name.entry(name).or_default().insert(key.clone());
            }
        }
        for dep in metadata.dependencies() {
            self.by_dependency
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }

        self.records.insert(
            key.clone(),
            IndexRecord {
                files,
                dependencies: metadata.dependencies().to_vec(),
            },
        );
    }

    /// Forget `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(record) = self.records.remove(key) else {
            return false;
        };

        for file in &record.files {
            if let Some(name) = last_component(file) {
                if let Some(keys) = self.by_name.get_mut(&name) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_name.remove(&name);
                    }
                }
            }
        }
        for dep in &record.dependencies {
            if let Some(keys) = self.by_dependency.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_dependency.remove(dep);
                }
            }
        }
        true
    }

    /// Keys whose files match a changed path or whose dependencies include a
    /// changed package
    pub fn affected(
        &self,
        changed_files: &[PathBuf],
        changed_deps: &[PackageId],
    ) -> HashSet<CacheKey> {
        let mut hits = HashSet::new();

        for changed in changed_files {
            let changed = normalize_path(changed);
            let Some(name) = last_component(&changed) else {
                continue;
            };
            let Some(candidates) = self.by_name.get(&name) else {
                continue;
            };

            for key in candidates {
                if hits.contains(key) {
                    continue;
                }
                let matched = self.records.get(key).is_some_and(|record| {
                    record
                        .files
                        .iter()
                        .any(|file| paths_match(file, &changed, self.mode))
                });
                if matched {
                    hits.insert(key.clone());
                }
            }
        }

        for dep in changed_deps {
            if let Some(keys) = self.by_dependency.get(dep) {
                hits.extend(keys.iter().cloned());
            }
        }

        hits
    }

    /// Whether `key` is tracked
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_name.clear();
        self.by_dependency.clear();
    }
}
