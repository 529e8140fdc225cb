//! On-disk entry storage
//!
//! One file per entry, named `<sha256(key)>.entry`, holding the JSON-encoded
//! entry (optionally gzipped). Writes and removals go through a single
//! background writer task so they land in the order they were issued and
//! never run under the in-memory lock. Unreadable files are treated as
//! absent.

use crate::cache::entry::EntryHeader;
use crate::cache::key::CacheKey;
use crate::error::{ModcheckError, ModcheckResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Bumped whenever the persisted layout changes
const FORMAT_VERSION: u32 = 1;

/// Extension of entry files
pub(crate) const ENTRY_EXT: &str = "entry";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Serialize)]
struct PersistedEntryRef<'a, R> {
    format: u32,
    header: &'a EntryHeader,
    result: &'a R,
}

#[derive(Deserialize)]
struct PersistedEntry<R> {
    format: u32,
    header: EntryHeader,
    result: R,
}

/// Same file, result skipped
#[derive(Deserialize)]
struct PersistedHeader {
    format: u32,
    header: EntryHeader,
}

/// Work for the background writer
pub(crate) enum PersistOp {
    Write { path: PathBuf, bytes: Vec<u8> },
    Remove { path: PathBuf },
    Clear { reply: oneshot::Sender<ModcheckResult<usize>> },
    Flush { reply: oneshot::Sender<()> },
}

/// Outcome of reading one entry file
#[derive(Debug)]
pub(crate) enum ColdRead<R> {
    Loaded(EntryHeader, R),
    /// Missing or undecodable; the file will never answer a lookup
    Invalid,
    /// Timed out or hit an I/O error; the file may still be good
    Unavailable,
}

/// A readable entry file found by [`DiskStore::scan`]
#[derive(Debug)]
pub(crate) struct ScannedEntry {
    pub path: PathBuf,
    pub header: EntryHeader,
    pub file_bytes: u64,
}

/// Result of walking the cache directory
#[derive(Debug, Default)]
pub(crate) struct DiskScan {
    pub entries: Vec<ScannedEntry>,
    pub corrupt: Vec<PathBuf>,
}

/// Handle to the persistent side of a cache store
pub(crate) struct DiskStore {
    dir: PathBuf,
    compress: bool,
    writer: mpsc::UnboundedSender<PersistOp>,
    failures: Arc<AtomicU64>,
}

impl DiskStore {
    /// Create the cache directory, verify it is writable, and start the
    /// background writer. Must be called inside a tokio runtime.
    pub async fn open(dir: &Path, compress: bool) -> ModcheckResult<Self> {
        let unusable = |source| ModcheckError::CacheDirUnusable {
            path: dir.to_path_buf(),
            source,
        };

        fs::create_dir_all(dir).await.map_err(unusable)?;

        let probe = dir.join(".probe");
        fs::write(&probe, b"ok").await.map_err(unusable)?;
        fs::remove_file(&probe).await.map_err(unusable)?;

        let failures = Arc::new(AtomicU64::new(0));
        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dir.to_path_buf(), rx, Arc::clone(&failures)));

        debug!("Opened cache directory {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            compress,
            writer,
            failures,
        })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the entry for `key`
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.digest(), ENTRY_EXT))
    }

    /// Number of background operations that failed so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Queue an operation. Never blocks.
    pub fn submit(&self, op: PersistOp) -> ModcheckResult<()> {
        self.writer
            .send(op)
            .map_err(|_| ModcheckError::CacheWriterStopped)
    }

    /// Queue a write of an encoded entry
    pub fn schedule_write(&self, key: &CacheKey, bytes: Vec<u8>) {
        let path = self.path_for(key);
        if self.submit(PersistOp::Write { path, bytes }).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Cache writer stopped, entry {} kept in memory only", key);
        }
    }

    /// Queue removal of an entry file
    pub fn schedule_remove(&self, key: &CacheKey) {
        self.schedule_remove_path(self.path_for(key));
    }

    /// Queue removal of a file by path
    pub fn schedule_remove_path(&self, path: PathBuf) {
        if self.submit(PersistOp::Remove { path }).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Cache writer stopped, could not schedule removal");
        }
    }

    /// Wait until every operation queued so far has been applied
    pub async fn flush(&self) -> ModcheckResult<()> {
        let (reply, done) = oneshot::channel();
        self.submit(PersistOp::Flush { reply })?;
        done.await.map_err(|_| ModcheckError::CacheWriterStopped)
    }

    /// Encode an entry for writing
    pub fn encode<R: Serialize>(&self, header: &EntryHeader, result: &R) -> ModcheckResult<Vec<u8>> {
        let encode_err = |reason: String| ModcheckError::CacheEncode {
            key: header.key.to_string(),
            reason,
        };

        let json = serde_json::to_vec(&PersistedEntryRef {
            format: FORMAT_VERSION,
            header,
            result,
        })
        .map_err(|e| encode_err(e.to_string()))?;

        if !self.compress {
            return Ok(json);
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
        encoder
            .write_all(&json)
            .map_err(|e| encode_err(e.to_string()))?;
        encoder.finish().map_err(|e| encode_err(e.to_string()))
    }

    /// Read a full entry, bounded by `timeout`
    pub async fn read<R: DeserializeOwned>(&self, path: &Path, timeout: Duration) -> ColdRead<R> {
        let bytes = match tokio::time::timeout(timeout, fs::read(path)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => return ColdRead::Invalid,
            Ok(Err(e)) => {
                debug!("Cold read of {} failed: {}", path.display(), e);
                return ColdRead::Unavailable;
            }
            Err(_) => {
                warn!("Cold read of {} timed out after {:?}", path.display(), timeout);
                return ColdRead::Unavailable;
            }
        };

        match decode_entry(&bytes) {
            Some((header, result)) => ColdRead::Loaded(header, result),
            None => ColdRead::Invalid,
        }
    }

    /// Walk the cache directory and read every entry header
    pub async fn scan(&self) -> ModcheckResult<DiskScan> {
        scan_dir(&self.dir).await
    }
}

/// Read every entry header under `dir`. Files that cannot be decoded, or
/// whose name does not match their key, are reported as corrupt.
pub(crate) async fn scan_dir(dir: &Path) -> ModcheckResult<DiskScan> {
    let mut scan = DiskScan::default();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| ModcheckError::io("reading cache directory", e))?;

    while let Some(item) = entries
        .next_entry()
        .await
        .map_err(|e| ModcheckError::io("reading cache directory entry", e))?
    {
        let path = item.path();
        if !path.extension().is_some_and(|ext| ext == ENTRY_EXT) {
            continue;
        }

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            // Removed between listing and reading
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Unreadable cache file {}: {}", path.display(), e);
                scan.corrupt.push(path);
                continue;
            }
        };

        let header = decode_header(&bytes).filter(|header| {
            path.file_stem()
                .is_some_and(|stem| stem.to_string_lossy() == header.key.digest())
        });

        match header {
            Some(header) => scan.entries.push(ScannedEntry {
                path,
                header,
                file_bytes: bytes.len() as u64,
            }),
            None => scan.corrupt.push(path),
        }
    }

    Ok(scan)
}

/// Decode a full entry file
fn decode_entry<R: DeserializeOwned>(bytes: &[u8]) -> Option<(EntryHeader, R)> {
    let json = decompress(bytes)?;
    let entry: PersistedEntry<R> = serde_json::from_slice(&json).ok()?;
    (entry.format == FORMAT_VERSION).then_some((entry.header, entry.result))
}

/// Decode only the header of an entry file
fn decode_header(bytes: &[u8]) -> Option<EntryHeader> {
    let json = decompress(bytes)?;
    let entry: PersistedHeader = serde_json::from_slice(&json).ok()?;
    (entry.format == FORMAT_VERSION).then_some(entry.header)
}

/// Accept both compressed and plain files regardless of the current setting
fn decompress(bytes: &[u8]) -> Option<Vec<u8>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Some(bytes.to_vec());
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

async fn run_writer(
    dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
    failures: Arc<AtomicU64>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Write { path, bytes } => {
                if let Err(e) = write_atomic(&dir, &path, &bytes).await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to persist cache entry {}: {}", path.display(), e);
                }
            }
            PersistOp::Remove { path } => match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to remove cache entry {}: {}", path.display(), e);
                }
            },
            PersistOp::Clear { reply } => {
                let _ = reply.send(clear_dir(&dir).await);
            }
            PersistOp::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!("Cache writer for {} stopped", dir.display());
}

async fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // Recreate the directory if it was removed underneath us
    fs::create_dir_all(dir).await?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

pub(crate) async fn clear_dir(dir: &Path) -> ModcheckResult<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ModcheckError::io("reading cache directory", e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ModcheckError::io("reading cache entry", e))?
    {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|ext| ext == ENTRY_EXT || ext == "tmp")
        {
            fs::remove_file(&path)
                .await
                .map_err(|e| ModcheckError::io(format!("removing {}", path.display()), e))?;
            removed += 1;
        }
    }

    Ok(removed)
}
