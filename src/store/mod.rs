//! Content-addressed blob storage.
//!
//! One file per finished blob under the blob directory, named by lowercase
//! hex hash, no extension. In-progress files carry a `.tmp` suffix and are
//! garbage-collected at startup. A sled index tracks status, length and
//! announce bookkeeping across restarts.

mod blob;
mod meta;

pub use blob::{Blob, BlobWriter};
pub use meta::{BlobIndex, BlobRecord, BlobStatus};

use crate::types::{BlobHash, MAX_BLOB_SIZE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob exceeds maximum size of {MAX_BLOB_SIZE} bytes")]
    BlobTooLarge,
    #[error("finalized bytes do not hash to the blob identity")]
    HashMismatch,
    #[error("length {got} conflicts with known length {known}")]
    InvalidLength { known: u64, got: u64 },
    #[error("blob is not verified")]
    NotVerified,
    #[error("metadata index corrupt: {0}")]
    Corrupt(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata db: {0}")]
    Db(#[from] sled::Error),
    #[error("metadata encoding: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),
}

/// Owns the blob directory and the metadata index. All mutation of a given
/// hash funnels through the interned `Blob` handle, which serializes
/// finalize; different hashes are fully independent.
pub struct BlobStore {
    blob_dir: PathBuf,
    index: BlobIndex,
    blobs: Mutex<HashMap<BlobHash, Arc<Blob>>>,
}

impl BlobStore {
    /// Open (or create) the store. Orphaned `.tmp` files from interrupted
    /// writes are deleted here, before anything can reference them.
    pub fn open(blob_dir: &Path, db_dir: &Path) -> Result<Self, BlobError> {
        std::fs::create_dir_all(blob_dir)?;
        std::fs::create_dir_all(db_dir)?;
        let index = BlobIndex::open(&db_dir.join("blob_index"))?;

        let mut swept = 0usize;
        for entry in std::fs::read_dir(blob_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".tmp") {
                std::fs::remove_file(entry.path())?;
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "removed interrupted blob writes");
        }

        Ok(Self {
            blob_dir: blob_dir.to_path_buf(),
            index,
            blobs: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, hash: &BlobHash) -> PathBuf {
        self.blob_dir.join(hash.to_hex())
    }

    /// Handle for a blob, creating a `Pending` record if unknown. Fails with
    /// `InvalidLength` when `expected_length` conflicts with a known length.
    pub async fn get_blob(
        &self,
        hash: BlobHash,
        expected_length: Option<u64>,
    ) -> Result<Arc<Blob>, BlobError> {
        if let Some(len) = expected_length {
            if len > MAX_BLOB_SIZE {
                return Err(BlobError::BlobTooLarge);
            }
            if len == 0 {
                return Err(BlobError::InvalidLength { known: 0, got: 0 });
            }
        }

        let mut blobs = self.blobs.lock().await;
        if let Some(blob) = blobs.get(&hash) {
            match (blob.length(), expected_length) {
                (Some(known), Some(expected)) if known != expected => {
                    return Err(BlobError::InvalidLength {
                        known,
                        got: expected,
                    });
                }
                (None, Some(expected)) => blob.set_length(expected),
                _ => {}
            }
            return Ok(blob.clone());
        }

        let path = self.path_for(&hash);
        let record = self.index.get(&hash)?;
        let (length, verified) = match record {
            Some(rec) if rec.status == BlobStatus::Finished => {
                if let (Some(known), Some(expected)) = (rec.length, expected_length) {
                    if known != expected {
                        return Err(BlobError::InvalidLength {
                            known,
                            got: expected,
                        });
                    }
                }
                match std::fs::metadata(&path) {
                    Ok(md) if Some(md.len()) == rec.length => (rec.length, true),
                    _ => {
                        // file vanished or was truncated under us
                        warn!(blob = %hash.to_hex(), "finished blob missing on disk, demoting");
                        self.index
                            .update(&hash, |r| r.status = BlobStatus::Pending)?;
                        (rec.length, false)
                    }
                }
            }
            Some(rec) if rec.status == BlobStatus::Pending => {
                if let (Some(known), Some(expected)) = (rec.length, expected_length) {
                    if known != expected {
                        return Err(BlobError::InvalidLength {
                            known,
                            got: expected,
                        });
                    }
                }
                let length = rec.length.or(expected_length);
                if length != rec.length {
                    self.index.update(&hash, |r| r.length = length)?;
                }
                (length, false)
            }
            _ => {
                // unknown or previously deleted: fresh pending record
                self.index.put(&hash, &BlobRecord::pending(expected_length))?;
                (expected_length, false)
            }
        };

        let blob = Blob::new(hash, path, self.index.clone(), length, verified);
        blobs.insert(hash, blob.clone());
        Ok(blob)
    }

    /// Handle for a blob only if it is already `Finished`. Unlike
    /// `get_blob` this never creates a record, so serving requests for
    /// unknown hashes does not grow the index.
    pub async fn finished_blob(&self, hash: BlobHash) -> Result<Option<Arc<Blob>>, BlobError> {
        {
            let blobs = self.blobs.lock().await;
            if let Some(blob) = blobs.get(&hash) {
                return Ok(if blob.is_verified() {
                    Some(blob.clone())
                } else {
                    None
                });
            }
        }
        match self.index.get(&hash)? {
            Some(rec) if rec.status == BlobStatus::Finished => {
                let blob = self.get_blob(hash, None).await?;
                Ok(if blob.is_verified() { Some(blob) } else { None })
            }
            _ => Ok(None),
        }
    }

    /// Bytes of a finished blob; `NotVerified` otherwise.
    pub async fn read_blob(&self, hash: BlobHash) -> Result<Vec<u8>, BlobError> {
        self.get_blob(hash, None).await?.read_all().await
    }

    /// Re-hash a finished blob against its identity. On mismatch the file is
    /// removed and the record demoted to `Pending`; returns whether the blob
    /// is still good.
    pub async fn verify_blob(&self, hash: BlobHash) -> Result<bool, BlobError> {
        let blob = self.get_blob(hash, None).await?;
        if !blob.is_verified() {
            return Ok(false);
        }
        let path = blob.file_path().clone();
        let ok = tokio::task::spawn_blocking(move || -> Result<bool, BlobError> {
            let bytes = std::fs::read(&path)?;
            Ok(crate::types::sha384(&bytes) == hash)
        })
        .await
        .map_err(|_| BlobError::Io(std::io::Error::other("verify task aborted")))??;

        if !ok {
            warn!(blob = %hash.to_hex(), "stored blob failed verification, demoting");
            blob.mark_unverified();
            let _ = std::fs::remove_file(blob.file_path());
            self.index
                .update(&hash, |r| r.status = BlobStatus::Pending)?;
        }
        Ok(ok)
    }

    /// Remove blob files and mark their records `Deleted`.
    pub async fn delete(&self, hashes: &[BlobHash]) -> Result<(), BlobError> {
        let mut blobs = self.blobs.lock().await;
        for hash in hashes {
            if let Some(blob) = blobs.remove(hash) {
                blob.mark_unverified();
            }
            let path = self.path_for(hash);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let _ = std::fs::remove_file(blob::tmp_path(&path));
            self.index.update(hash, |r| {
                r.status = BlobStatus::Deleted;
                r.should_announce = false;
            })?;
            debug!(blob = %hash.to_hex(), "deleted");
        }
        Ok(())
    }

    /// Lazy enumeration of all finished blobs. Index rows that fail to
    /// decode are skipped rather than poisoning the whole listing.
    pub fn completed_hashes(&self) -> impl Iterator<Item = BlobHash> {
        self.index.iter().filter_map(|item| match item {
            Ok((hash, rec)) if rec.status == BlobStatus::Finished => Some(hash),
            Ok(_) => None,
            Err(e) => {
                warn!("skipping unreadable index row: {e}");
                None
            }
        })
    }

    pub fn mark_should_announce(&self, hash: &BlobHash, flag: bool) -> Result<(), BlobError> {
        self.index.update(hash, |r| r.should_announce = flag)?;
        Ok(())
    }

    /// Record a successful announce at unix time `ts`.
    pub fn announced(&self, hash: &BlobHash, ts: u64) -> Result<(), BlobError> {
        self.index.update(hash, |r| r.last_announced_at = Some(ts))?;
        Ok(())
    }

    /// Finished blobs due for a (re-)announce at unix time `now`. With
    /// `head_and_sd_only` only blobs flagged `should_announce` qualify.
    pub fn blobs_to_announce(
        &self,
        now: u64,
        interval: Duration,
        head_and_sd_only: bool,
    ) -> Vec<BlobHash> {
        let interval = interval.as_secs();
        self.index
            .iter()
            .filter_map(|item| item.ok())
            .filter(|(_, rec)| rec.status == BlobStatus::Finished)
            .filter(|(_, rec)| !head_and_sd_only || rec.should_announce)
            .filter(|(_, rec)| match rec.last_announced_at {
                None => true,
                Some(t) => t.saturating_add(interval) <= now,
            })
            .map(|(hash, _)| hash)
            .collect()
    }

    pub fn flush(&self) -> Result<(), BlobError> {
        self.index.flush()
    }
}
