//! # Bitstream Cache
//!
//! Content-addressed, unbounded, on-disk memoization of encoder output. A
//! reference encoder can take minutes per picture, so re-running a sweep with
//! a different vision model or evaluator must not re-encode anything.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! └── <codec>-<version>/
//!     └── <config fingerprint, 16 hex chars>/
//!         └── op<operating point>/
//!             └── <sha256 of the full key>.vcmb
//! ```
//!
//! The directory levels exist for humans (`du`, `rm -r` of one codec release).
//! Correctness rests on the file name, which hashes every key component, and on
//! the header stored inside each entry, which repeats the full key and is
//! compared field by field on lookup. A header that does not match is a miss,
//! never a reuse.
//!
//! ## Entry format
//!
//! ```text
//! ┌──────┬─────────┬────────────┬─────────────────────────┬─────────┐
//! │ VCMB │ ver u16 │ hdr_len u32│ JSON header             │ payload │
//! │      │  (le)   │   (le)     │ {key, meta, payload_sha}│         │
//! └──────┴─────────┴────────────┴─────────────────────────┴─────────┘
//! ```
//!
//! ## Concurrency and durability
//!
//! Entries are written to a temporary file in the destination directory,
//! synced, then moved into place in one step. Readers see either no file or a
//! complete one, so a crash mid-write never leaves a torn entry. Writers for
//! different keys never touch the same file. The cache is never evicted;
//! [`clear`] is the explicit external cleanup.

// Standard library imports
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

// External crate imports
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

// Internal module imports
use crate::codec::{ArtifactMeta, CodecIdentity, EncodedArtifact, OperatingPoint};
use crate::core::{fingerprint_json, sha256_hex};
use crate::error::{EvalError, EvalResult};

const MAGIC: &[u8; 4] = b"VCMB";
const FORMAT_VERSION: u16 = 1;
const ENTRY_EXTENSION: &str = "vcmb";
const PREAMBLE_LEN: usize = 4 + 2 + 4;

/// How a fresh encode treats an entry that already exists at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Look up before encoding; keep whatever entry is already committed.
    #[default]
    Reuse,
    /// Always encode; atomically replace an existing entry.
    Overwrite,
}

/// Everything that determines an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub codec: CodecIdentity,
    pub config_fingerprint: String,
    pub sample_id: String,
    pub operating_point: OperatingPoint,
}

impl CacheKey {
    pub fn new(
        codec: CodecIdentity,
        config_fingerprint: impl Into<String>,
        sample_id: impl Into<String>,
        operating_point: OperatingPoint,
    ) -> Self {
        Self {
            codec,
            config_fingerprint: config_fingerprint.into(),
            sample_id: sample_id.into(),
            operating_point,
        }
    }

    /// SHA-256 over the canonical JSON of all four components.
    pub fn digest(&self) -> EvalResult<String> {
        fingerprint_json(self)
    }

    /// Path of this key's entry relative to the cache root.
    pub fn relative_path(&self) -> EvalResult<PathBuf> {
        let fp: String = self.config_fingerprint.chars().take(16).collect();
        Ok(PathBuf::from(self.codec.slug())
            .join(crate::core::path_safe(&fp))
            .join(format!("op{}", self.operating_point.value))
            .join(format!("{}.{}", self.digest()?, ENTRY_EXTENSION)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    key: CacheKey,
    meta: ArtifactMeta,
    payload_sha256: String,
}

fn encode_entry(key: &CacheKey, artifact: &EncodedArtifact) -> EvalResult<Vec<u8>> {
    let header = serde_json::to_vec(&EntryHeader {
        key: key.clone(),
        meta: artifact.meta().clone(),
        payload_sha256: sha256_hex(artifact.payload()),
    })?;
    let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + artifact.payload().len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(artifact.payload());
    Ok(out)
}

fn decode_entry(bytes: &[u8]) -> Result<(CacheKey, EncodedArtifact), String> {
    if bytes.len() < PREAMBLE_LEN || &bytes[..4] != MAGIC {
        return Err("not a cache entry".to_string());
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported entry version {}", version));
    }
    let header_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let body = &bytes[PREAMBLE_LEN..];
    if body.len() < header_len {
        return Err("truncated header".to_string());
    }
    let (header, payload) = body.split_at(header_len);
    let header: EntryHeader =
        serde_json::from_slice(header).map_err(|e| format!("bad header: {}", e))?;
    if sha256_hex(payload) != header.payload_sha256 {
        return Err("payload checksum mismatch".to_string());
    }
    let artifact =
        EncodedArtifact::from_parts(payload.to_vec(), header.meta).map_err(|e| e.to_string())?;
    Ok((header.key, artifact))
}

#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> std::io::Result<()> {
    fs::File::open(path)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// What [`BitstreamCache::store`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// No entry existed; ours was committed.
    Written,
    /// An entry existed and was replaced (overwrite policy or unusable entry).
    Replaced,
    /// A valid entry was committed first; ours was discarded.
    KeptExisting,
}

/// Durable, unbounded artifact store rooted at one directory.
#[derive(Debug, Clone)]
pub struct BitstreamCache {
    root: PathBuf,
    policy: ConflictPolicy,
}

impl BitstreamCache {
    pub fn new(root: impl Into<PathBuf>, policy: ConflictPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn path_for(&self, key: &CacheKey) -> EvalResult<PathBuf> {
        Ok(self.root.join(key.relative_path()?))
    }

    /// Read the entry for `key`, if a valid one exists. Never encodes.
    ///
    /// Unreadable, corrupt or mismatched entries are reported as misses with a
    /// warning; only unexpected I/O failures are errors.
    pub fn lookup(&self, key: &CacheKey) -> EvalResult<Option<EncodedArtifact>> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EvalError::io_at("read cache entry", &path, e)),
        };
        match decode_entry(&bytes) {
            Ok((stored, artifact)) if stored == *key => {
                debug!("cache hit {}", path.display());
                Ok(Some(artifact))
            }
            Ok((stored, _)) => {
                warn!(
                    "cache entry {} belongs to a different key ({} / {} / {}), ignoring",
                    path.display(),
                    stored.codec,
                    stored.sample_id,
                    stored.operating_point
                );
                Ok(None)
            }
            Err(reason) => {
                warn!("cache entry {} unusable: {}", path.display(), reason);
                Ok(None)
            }
        }
    }

    /// Commit `artifact` under `key`.
    ///
    /// Safe under concurrent writers: each writes its own temporary file and
    /// the final placement is a single atomic step. Under [`ConflictPolicy::Reuse`]
    /// the first valid committed entry wins; under [`ConflictPolicy::Overwrite`]
    /// the last writer wins. Either way a conflict is logged as a warning.
    pub fn store(&self, key: &CacheKey, artifact: &EncodedArtifact) -> EvalResult<StoreOutcome> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| EvalError::cache(&path, "entry path has no parent"))?;
        fs::create_dir_all(dir).map_err(|e| EvalError::io_at("create cache directory", dir, e))?;

        let bytes = encode_entry(key, artifact)?;
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| EvalError::io_at("create cache temp file", dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| EvalError::io_at("write cache entry", tmp.path(), e))?;

        let outcome = match self.policy {
            ConflictPolicy::Reuse => match tmp.persist_noclobber(&path) {
                Ok(_) => StoreOutcome::Written,
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                    if self.lookup(key)?.is_some() {
                        warn!(
                            "{}",
                            EvalError::cache_conflict(&path, "keeping the committed entry")
                        );
                        return Ok(StoreOutcome::KeptExisting);
                    }
                    warn!(
                        "{}",
                        EvalError::cache_conflict(&path, "existing entry unusable, replacing")
                    );
                    err.file
                        .persist(&path)
                        .map_err(|e| EvalError::io_at("replace cache entry", &path, e.error))?;
                    StoreOutcome::Replaced
                }
                Err(err) => {
                    return Err(EvalError::io_at("commit cache entry", &path, err.error));
                }
            },
            ConflictPolicy::Overwrite => {
                let existed = path.exists();
                tmp.persist(&path)
                    .map_err(|e| EvalError::io_at("commit cache entry", &path, e.error))?;
                if existed {
                    warn!("{}", EvalError::cache_conflict(&path, "overwritten"));
                    StoreOutcome::Replaced
                } else {
                    StoreOutcome::Written
                }
            }
        };
        sync_directory(dir).map_err(|e| EvalError::io_at("sync cache directory", dir, e))?;
        Ok(outcome)
    }
}

/// Size of one cache root, per codec directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
    pub per_codec: BTreeMap<String, (u64, u64)>,
}

fn visit_entries(dir: &Path, f: &mut dyn FnMut(&Path, u64)) -> EvalResult<()> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EvalError::io_at("list cache directory", dir, e)),
    };
    for entry in read {
        let entry = entry.map_err(|e| EvalError::io_at("list cache directory", dir, e))?;
        let path = entry.path();
        let meta = entry
            .metadata()
            .map_err(|e| EvalError::io_at("stat cache entry", &path, e))?;
        if meta.is_dir() {
            visit_entries(&path, f)?;
        } else if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
            f(&path, meta.len());
        }
    }
    Ok(())
}

/// Count entries and bytes under `root`.
pub fn stats(root: &Path) -> EvalResult<CacheStats> {
    let mut stats = CacheStats::default();
    visit_entries(root, &mut |path: &Path, len: u64| {
        stats.entries += 1;
        stats.bytes += len;
        let codec = path
            .strip_prefix(root)
            .ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let slot = stats.per_codec.entry(codec).or_default();
        slot.0 += 1;
        slot.1 += len;
    })?;
    Ok(stats)
}

fn remove_empty_dirs(dir: &Path, keep: bool) -> EvalResult<()> {
    let Ok(read) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in read.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            remove_empty_dirs(&entry.path(), false)?;
        }
    }
    if !keep {
        // Non-empty directories (foreign files) are left alone.
        let _ = fs::remove_dir(dir);
    }
    Ok(())
}

/// Delete every cache entry under `root`; files that are not cache entries are
/// kept. Returns the number of entries removed.
pub fn clear(root: &Path) -> EvalResult<u64> {
    let mut paths = Vec::new();
    visit_entries(root, &mut |path: &Path, _| paths.push(path.to_path_buf()))?;
    for path in &paths {
        fs::remove_file(path).map_err(|e| EvalError::io_at("remove cache entry", path, e))?;
    }
    remove_empty_dirs(root, true)?;
    Ok(paths.len() as u64)
}
