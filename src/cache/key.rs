//! Cache keys and content hashes
//!
//! A `CacheKey` names a validation request; a `ContentHash` pins the exact
//! inputs it was computed from. Same key + same hash = same result.

use crate::error::{ModcheckError, ModcheckResult};
use crate::package::PackageId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// Deterministic identifier of a cacheable validation request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for validating `package` with the given options fingerprint
    pub fn for_package(package: &PackageId, options: Option<&str>) -> Self {
        match options {
            Some(opts) if !opts.is_empty() => Self(format!("{}:{}", package, opts)),
            _ => Self(package.to_string()),
        }
    }

    /// Borrow the key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 hex digest of the key, safe to use as a file name
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Digest over the ordered inputs of a validation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Hash the given files in order.
    ///
    /// Each file contributes its path and length-prefixed contents. A missing
    /// file contributes a marker instead of failing, so deleting an input
    /// changes the hash. Other read errors are returned.
    pub async fn of_files(paths: &[PathBuf]) -> ModcheckResult<Self> {
        let mut hasher = Sha256::new();

        for path in paths {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);

            match fs::read(path).await {
                Ok(contents) => {
                    hasher.update((contents.len() as u64).to_le_bytes());
                    hasher.update(&contents);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    hasher.update(b"\xffmissing");
                }
                Err(e) => {
                    return Err(ModcheckError::io(
                        format!("hashing input {}", path.display()),
                        e,
                    ))
                }
            }
        }

        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Fold several hashes into one (order-sensitive)
    pub fn combine<'a>(hashes: impl IntoIterator<Item = &'a ContentHash>) -> Self {
        let mut hasher = Sha256::new();
        for hash in hashes {
            hasher.update(hash.0.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Borrow the digest as a hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell hashes apart in logs
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(i, _)| i);
        f.write_str(&self.0[..end])
    }
}

impl From<&str> for ContentHash {
    fn from(hash: &str) -> Self {
        Self(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_with_options() {
        let pkg = PackageId::from("pkg-a");
        assert_eq!(CacheKey::for_package(&pkg, None).as_str(), "pkg-a");
        assert_eq!(CacheKey::for_package(&pkg, Some("")).as_str(), "pkg-a");
        assert_eq!(
            CacheKey::for_package(&pkg, Some("strict")).as_str(),
            "pkg-a:strict"
        );
    }

    #[test]
    fn digest_is_filename_safe() {
        let key = CacheKey::from("mods/../weird key:with*chars");
        let digest = key.digest();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, CacheKey::from("mods/../weird key:with*chars").digest());
    }

    #[tokio::test]
    async fn file_hash_tracks_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, b"{\"v\":1}").unwrap();

        let files = vec![path.clone()];
        let first = ContentHash::of_files(&files).await.unwrap();
        assert_eq!(first, ContentHash::of_files(&files).await.unwrap());

        std::fs::write(&path, b"{\"v\":2}").unwrap();
        let second = ContentHash::of_files(&files).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn file_hash_is_order_sensitive() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let ab = ContentHash::of_files(&[a.clone(), b.clone()]).await.unwrap();
        let ba = ContentHash::of_files(&[b, a]).await.unwrap();
        assert_ne!(ab, ba);
    }

    #[tokio::test]
    async fn missing_file_changes_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.json");
        std::fs::write(&path, b"x").unwrap();
        let files = vec![path.clone()];

        let present = ContentHash::of_files(&files).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        let missing = ContentHash::of_files(&files).await.unwrap();

        assert_ne!(present, missing);
    }

    #[test]
    fn display_shortens_on_char_boundaries() {
        let hex = ContentHash::of_bytes(b"a");
        assert_eq!(hex.to_string(), &hex.as_str()[..12]);

        let wide = ContentHash::from("ääääääääääääääää");
        assert_eq!(wide.to_string(), "ä".repeat(12));
        assert_eq!(ContentHash::from("short").to_string(), "short");
    }

    #[test]
    fn combine_depends_on_order() {
        let a = ContentHash::of_bytes(b"a");
        let b = ContentHash::of_bytes(b"b");
        assert_ne!(ContentHash::combine([&a, &b]), ContentHash::combine([&b, &a]));
    }
}
