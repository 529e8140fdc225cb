//! Package identities and the collaborators the cache works against
//!
//! The content validation itself, manifest loading, and dependency resolution
//! live outside this crate. They are reached through three traits:
//!
//! - [`Validator`] produces an opaque result for a package
//! - [`Workspace`] knows where packages live and which inputs they read
//! - [`DependencyGraph`] answers "who depends on this package"
//!
//! [`PackageGraph`] is an in-memory implementation of the last two for
//! callers that already hold the loaded package set.

use crate::error::{ModcheckError, ModcheckResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Identifier of a content package ("mod")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    /// Create a package identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PackageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Files and declared dependencies a package's validation reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInputs {
    /// Files in the order they are hashed
    pub files: Vec<PathBuf>,
    /// Packages the validation result depends on
    pub dependencies: Vec<PackageId>,
}

/// Content validation supplied by the surrounding system
///
/// The cache never looks inside `R`; it only stores and returns it.
#[async_trait]
pub trait Validator<R>: Send + Sync {
    /// Version tag of the validation logic. Cached entries written under a
    /// different tag are treated as stale.
    fn version(&self) -> &str;

    /// Validation options folded into cache keys, if any
    fn options_fingerprint(&self) -> Option<String> {
        None
    }

    /// Validate one package
    async fn validate(&self, package: &PackageId) -> ModcheckResult<R>;
}

/// Reverse dependency lookup over the loaded package set
pub trait DependencyGraph: Send + Sync {
    /// Packages that declare a direct dependency on `package`
    fn dependents_of(&self, package: &PackageId) -> Vec<PackageId>;
}

/// Package layout of the workspace being validated
pub trait Workspace: Send + Sync {
    /// All known packages
    fn packages(&self) -> Vec<PackageId>;

    /// Root directory of a package
    fn root_of(&self, package: &PackageId) -> Option<PathBuf>;

    /// Inputs read when validating a package
    fn inputs_of(&self, package: &PackageId) -> ModcheckResult<PackageInputs>;
}

#[derive(Debug, Clone)]
struct PackageNode {
    root: PathBuf,
    inputs: PackageInputs,
}

/// In-memory package set with forward and reverse dependency edges
#[derive(Debug, Clone, Default)]
pub struct PackageGraph {
    nodes: BTreeMap<PackageId, PackageNode>,
    dependents: BTreeMap<PackageId, BTreeSet<PackageId>>,
}

impl PackageGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package, replacing any previous registration
    pub fn insert(
        &mut self,
        id: impl Into<PackageId>,
        root: impl Into<PathBuf>,
        files: Vec<PathBuf>,
        dependencies: Vec<PackageId>,
    ) {
        let id = id.into();
        if let Some(previous) = self.nodes.remove(&id) {
            for dep in &previous.inputs.dependencies {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(&id);
                }
            }
        }

        for dep in &dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
        }

        self.nodes.insert(
            id,
            PackageNode {
                root: root.into(),
                inputs: PackageInputs {
                    files,
                    dependencies,
                },
            },
        );
    }

    /// Builder form of [`PackageGraph::insert`]
    pub fn with_package(
        mut self,
        id: impl Into<PackageId>,
        root: impl Into<PathBuf>,
        files: Vec<PathBuf>,
        dependencies: Vec<PackageId>,
    ) -> Self {
        self.insert(id, root, files, dependencies);
        self
    }

    /// Number of registered packages
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no packages are registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl DependencyGraph for PackageGraph {
    fn dependents_of(&self, package: &PackageId) -> Vec<PackageId> {
        self.dependents
            .get(package)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Workspace for PackageGraph {
    fn packages(&self) -> Vec<PackageId> {
        self.nodes.keys().cloned().collect()
    }

    fn root_of(&self, package: &PackageId) -> Option<PathBuf> {
        self.nodes.get(package).map(|node| node.root.clone())
    }

    fn inputs_of(&self, package: &PackageId) -> ModcheckResult<PackageInputs> {
        self.nodes
            .get(package)
            .map(|node| node.inputs.clone())
            .ok_or_else(|| ModcheckError::UnknownPackage(package.to_string()))
    }
}
