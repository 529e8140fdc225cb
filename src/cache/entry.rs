//! Cache entry model
//!
//! Entries are immutable once written: a changed input produces a new entry
//! under the same key, never an in-place edit.

use crate::cache::key::{CacheKey, ContentHash};
use crate::package::PackageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Inputs an entry was computed from, used for invalidation matching
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    files: Vec<PathBuf>,
    dependencies: Vec<PackageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
}

impl Metadata {
    /// Metadata for an entry reading `files` and depending on `dependencies`
    pub fn new(files: Vec<PathBuf>, dependencies: Vec<PackageId>) -> Self {
        Self {
            files,
            dependencies,
            size_bytes: None,
        }
    }

    /// Metadata listing only files
    pub fn files_only(files: Vec<PathBuf>) -> Self {
        Self::new(files, Vec::new())
    }

    /// Override the size accounted against the memory budget.
    ///
    /// Without an override the serialized size of the entry is used.
    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Files the entry depends on
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Packages the entry depends on
    pub fn dependencies(&self) -> &[PackageId] {
        &self.dependencies
    }

    /// Caller-provided size, if any
    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }
}

/// Why a stored entry cannot answer a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staleness {
    /// Inputs changed since the entry was written
    HashMismatch,
    /// Older than the configured maximum age
    Expired,
    /// Written by a different version of the validation logic
    VersionMismatch,
}

/// Everything about an entry except its result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryHeader {
    pub key: CacheKey,
    pub hash: ContentHash,
    pub created_at: DateTime<Utc>,
    pub validator_version: String,
    pub metadata: Metadata,
    pub size_bytes: u64,
}

impl EntryHeader {
    /// Check the entry against a lookup.
    ///
    /// Order is hash, age, version; the first failure wins.
    pub fn check(
        &self,
        hash: &ContentHash,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
        version: &str,
    ) -> Result<(), Staleness> {
        if &self.hash != hash {
            return Err(Staleness::HashMismatch);
        }
        if self.is_expired(now, max_age) {
            return Err(Staleness::Expired);
        }
        if self.validator_version != version {
            return Err(Staleness::VersionMismatch);
        }
        Ok(())
    }

    /// Whether the entry outlived `max_age`
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        let Some(max_age) = max_age else {
            return false;
        };
        // Entries stamped in the future (clock skew) count as fresh
        match (now - self.created_at).to_std() {
            Ok(age) => age > max_age,
            Err(_) => false,
        }
    }
}

/// A cached validation result together with its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<R> {
    pub(crate) header: EntryHeader,
    pub(crate) result: R,
}

impl<R> CacheEntry<R> {
    /// Key the entry is stored under
    pub fn key(&self) -> &CacheKey {
        &self.header.key
    }

    /// Hash of the inputs at write time
    pub fn hash(&self) -> &ContentHash {
        &self.header.hash
    }

    /// Stored result
    pub fn result(&self) -> &R {
        &self.result
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.header.created_at
    }

    /// Validator version the result was produced by
    pub fn validator_version(&self) -> &str {
        &self.header.validator_version
    }

    /// Invalidation metadata
    pub fn metadata(&self) -> &Metadata {
        &self.header.metadata
    }

    /// Size accounted against the memory budget
    pub fn size_bytes(&self) -> u64 {
        self.header.size_bytes
    }
}
