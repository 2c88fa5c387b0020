//! Warm-start snapshot cache.
//!
//! [`SnapshotManager`] captures a snapshot once per (embed source, warmup
//! script, runtime) and hands the same bytes to every later script
//! instantiation, so the expensive warmup only ever runs on the first one.
//!
//! Snapshots are opaque. The cache never inspects them; it only keys them
//! by a SHA-256 digest of the sources that produced them plus the runtime
//! flavor they were captured under. With a directory configured, each
//! snapshot is persisted as `<digest>-<runtime>.snapshot` next to a
//! `<digest>-<runtime>.json` [`SnapshotRecord`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::runtime::ScriptRuntime;
use crate::models::script_options::ScriptOptions;
use crate::models::snapshot_options::SnapshotOptions;
use crate::session::{Script, Session};
use crate::{AppError, Result};

/// Cache key: what produced a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    digest: String,
    runtime: ScriptRuntime,
}

impl SnapshotKey {
    /// Key for the snapshot captured from `embed_source` and `options`.
    #[must_use]
    pub fn new(embed_source: &str, options: &SnapshotOptions) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(embed_source.as_bytes());
        hasher.update([0_u8]);
        hasher.update(options.warmup_script().as_bytes());
        Self {
            digest: format!("{:x}", hasher.finalize()),
            runtime: options.runtime(),
        }
    }

    /// Hex SHA-256 of the sources.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Runtime the snapshot belongs to.
    #[must_use]
    pub fn runtime(&self) -> ScriptRuntime {
        self.runtime
    }

    fn file_stem(&self) -> String {
        format!("{}-{}", self.digest, self.runtime)
    }
}

/// Metadata describing a cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Hex SHA-256 of the sources.
    pub digest: String,
    /// Runtime the snapshot was captured under.
    pub runtime: ScriptRuntime,
    /// Snapshot length in bytes.
    pub size: usize,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    record: SnapshotRecord,
    bytes: Bytes,
}

/// Snapshot cache, memory-backed with optional on-disk persistence.
///
/// Captures are serialized: while one snapshot is being taken, other
/// lookups wait.
#[derive(Debug, Default)]
pub struct SnapshotManager {
    entries: Mutex<HashMap<SnapshotKey, Entry>>,
    dir: Option<PathBuf>,
}

impl SnapshotManager {
    /// Memory-only cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache persisting snapshots under `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub async fn with_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            AppError::Io(format!("cannot create snapshot dir {}: {err}", dir.display()))
        })?;
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    /// Persistence directory, if any.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Look a snapshot up in memory, then on disk.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if a persisted snapshot exists but cannot be
    /// read.
    pub async fn get(&self, key: &SnapshotKey) -> Result<Option<Bytes>> {
        let mut entries = self.entries.lock().await;
        self.lookup(&mut entries, key).await
    }

    /// Store `bytes` under `key`, replacing any previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if persisting fails.
    pub async fn insert(&self, key: SnapshotKey, bytes: Bytes) -> Result<SnapshotRecord> {
        let mut entries = self.entries.lock().await;
        self.store(&mut entries, key, bytes).await
    }

    /// Return the cached snapshot for `embed_source` and `options`, capturing
    /// it through `session` on a miss.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::snapshot_script`] failures and persistence
    /// errors.
    pub async fn get_or_create(
        &self,
        session: &Session,
        embed_source: &str,
        options: &SnapshotOptions,
    ) -> Result<Bytes> {
        let key = SnapshotKey::new(embed_source, options);
        let mut entries = self.entries.lock().await;

        if let Some(bytes) = self.lookup(&mut entries, &key).await? {
            debug!(digest = key.digest(), runtime = %key.runtime(), "snapshot cache hit");
            return Ok(bytes);
        }

        let bytes = session
            .snapshot_script(embed_source, options)
            .instrument(info_span!("capture_snapshot", digest = key.digest()))
            .await?;
        self.store(&mut entries, key, bytes.clone()).await?;
        Ok(bytes)
    }

    /// Create a script that warm-starts from the cached snapshot, capturing
    /// the snapshot first if needed.
    ///
    /// The script runs under the runtime of `options`, which is what the
    /// snapshot was captured under.
    ///
    /// # Errors
    ///
    /// Propagates snapshot and script-creation failures.
    pub async fn create_script(
        &self,
        session: &Session,
        source: &str,
        embed_source: &str,
        options: &SnapshotOptions,
    ) -> Result<Script> {
        let snapshot = self.get_or_create(session, embed_source, options).await?;
        let script_options = ScriptOptions::default()
            .with_runtime(options.runtime())
            .with_snapshot(snapshot);
        session
            .create_script_with_options(source, Some(script_options))
            .await
    }

    /// Drop a snapshot from memory and disk. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if a persisted file cannot be removed.
    pub async fn evict(&self, key: &SnapshotKey) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let mut existed = entries.remove(key).is_some();

        if let Some(dir) = &self.dir {
            for path in [snapshot_path(dir, key), record_path(dir, key)] {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => existed = true,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(AppError::Io(format!(
                            "cannot remove {}: {err}",
                            path.display()
                        )))
                    }
                }
            }
        }

        if existed {
            info!(digest = key.digest(), runtime = %key.runtime(), "snapshot evicted");
        }
        Ok(existed)
    }

    /// Records of every snapshot currently held in memory.
    pub async fn records(&self) -> Vec<SnapshotRecord> {
        let entries = self.entries.lock().await;
        let mut records: Vec<_> = entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    async fn lookup(
        &self,
        entries: &mut HashMap<SnapshotKey, Entry>,
        key: &SnapshotKey,
    ) -> Result<Option<Bytes>> {
        if let Some(entry) = entries.get(key) {
            return Ok(Some(entry.bytes.clone()));
        }

        let Some(dir) = &self.dir else {
            return Ok(None);
        };

        let Some(entry) = load_persisted(dir, key).await? else {
            return Ok(None);
        };
        let bytes = entry.bytes.clone();
        entries.insert(key.clone(), entry);
        Ok(Some(bytes))
    }

    async fn store(
        &self,
        entries: &mut HashMap<SnapshotKey, Entry>,
        key: SnapshotKey,
        bytes: Bytes,
    ) -> Result<SnapshotRecord> {
        let record = SnapshotRecord {
            digest: key.digest.clone(),
            runtime: key.runtime,
            size: bytes.len(),
            created_at: Utc::now(),
        };

        if let Some(dir) = &self.dir {
            persist(dir, &key, &record, &bytes).await?;
        }

        info!(
            digest = record.digest,
            runtime = %record.runtime,
            size = record.size,
            "snapshot cached"
        );
        entries.insert(
            key,
            Entry {
                record: record.clone(),
                bytes,
            },
        );
        Ok(record)
    }
}

fn snapshot_path(dir: &Path, key: &SnapshotKey) -> PathBuf {
    dir.join(format!("{}.snapshot", key.file_stem()))
}

fn record_path(dir: &Path, key: &SnapshotKey) -> PathBuf {
    dir.join(format!("{}.json", key.file_stem()))
}

async fn persist(
    dir: &Path,
    key: &SnapshotKey,
    record: &SnapshotRecord,
    bytes: &[u8],
) -> Result<()> {
    let snapshot = snapshot_path(dir, key);
    tokio::fs::write(&snapshot, bytes)
        .await
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", snapshot.display())))?;

    let meta = serde_json::to_vec_pretty(record)
        .map_err(|err| AppError::Io(format!("cannot encode snapshot record: {err}")))?;
    let record_file = record_path(dir, key);
    tokio::fs::write(&record_file, meta)
        .await
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", record_file.display())))
}

async fn load_persisted(dir: &Path, key: &SnapshotKey) -> Result<Option<Entry>> {
    let snapshot = snapshot_path(dir, key);
    let bytes = match tokio::fs::read(&snapshot).await {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::Io(format!(
                "cannot read {}: {err}",
                snapshot.display()
            )))
        }
    };

    let record = match tokio::fs::read(record_path(dir, key)).await {
        Ok(raw) => match serde_json::from_slice::<SnapshotRecord>(&raw) {
            Ok(record) if record.size == bytes.len() => record,
            Ok(record) => {
                warn!(
                    digest = key.digest(),
                    expected = record.size,
                    actual = bytes.len(),
                    "persisted snapshot size mismatch, ignoring"
                );
                return Ok(None);
            }
            Err(err) => {
                warn!(digest = key.digest(), %err, "unreadable snapshot record, ignoring");
                return Ok(None);
            }
        },
        Err(err) => {
            warn!(digest = key.digest(), %err, "snapshot record missing, ignoring");
            return Ok(None);
        }
    };

    debug!(digest = key.digest(), runtime = %key.runtime(), "snapshot loaded from disk");
    Ok(Some(Entry { record, bytes }))
}
