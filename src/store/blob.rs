//! Blob handle and verified-on-finalize writer.

use super::meta::{BlobIndex, BlobStatus};
use super::BlobError;
use crate::types::{sha384, BlobHash, MAX_BLOB_SIZE};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// In-memory handle to one content-addressed blob.
///
/// Handles are interned by the store: all callers touching the same hash
/// share one `Arc<Blob>`, so the verified flag and the write lock are
/// process-wide per hash.
#[derive(Debug)]
pub struct Blob {
    hash: BlobHash,
    path: PathBuf,
    index: BlobIndex,
    length: Mutex<Option<u64>>,
    verified_tx: watch::Sender<bool>,
    /// Serializes finalize: concurrent race losers see `verified` flip and
    /// discard their bytes instead of writing a second copy.
    write_lock: tokio::sync::Mutex<()>,
}

impl Blob {
    pub(super) fn new(
        hash: BlobHash,
        path: PathBuf,
        index: BlobIndex,
        length: Option<u64>,
        verified: bool,
    ) -> Arc<Self> {
        let (verified_tx, _) = watch::channel(verified);
        Arc::new(Self {
            hash,
            path,
            index,
            length: Mutex::new(length),
            verified_tx,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn hash(&self) -> BlobHash {
        self.hash
    }

    pub fn length(&self) -> Option<u64> {
        *self.length.lock().expect("blob lock poisoned")
    }

    pub(crate) fn set_length(&self, length: u64) {
        *self.length.lock().expect("blob lock poisoned") = Some(length);
    }

    pub fn is_verified(&self) -> bool {
        *self.verified_tx.borrow()
    }

    /// Watch-channel view of the verified flag, for select loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.verified_tx.subscribe()
    }

    /// Resolves once the blob is verified on disk.
    pub async fn wait_verified(&self) {
        let mut rx = self.verified_tx.subscribe();
        // sender lives in self, so this cannot error while we are borrowed
        let _ = rx.wait_for(|v| *v).await;
    }

    pub(super) fn mark_unverified(&self) {
        self.verified_tx.send_replace(false);
    }

    pub(super) fn file_path(&self) -> &PathBuf {
        &self.path
    }

    /// Buffered writer for this blob. Any number may exist; finalization is
    /// first-writer-wins and later finalizes discard their bytes.
    pub fn open_for_writing(self: &Arc<Self>) -> BlobWriter {
        BlobWriter {
            blob: self.clone(),
            buf: Vec::new(),
        }
    }

    /// Whole-blob read. Blobs are capped at 2 MiB so a single read is fine.
    pub async fn read_all(&self) -> Result<Vec<u8>, BlobError> {
        if !self.is_verified() {
            return Err(BlobError::NotVerified);
        }
        Ok(tokio::fs::read(&self.path).await?)
    }
}

/// Accumulates chunks in memory, then hashes, persists and marks the blob
/// finished in one finalize step. The buffer never exceeds `MAX_BLOB_SIZE`.
pub struct BlobWriter {
    blob: Arc<Blob>,
    buf: Vec<u8>,
}

impl BlobWriter {
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), BlobError> {
        let total = self.buf.len() as u64 + chunk.len() as u64;
        if total > MAX_BLOB_SIZE {
            return Err(BlobError::BlobTooLarge);
        }
        if let Some(expected) = self.blob.length() {
            if total > expected {
                return Err(BlobError::InvalidLength {
                    known: expected,
                    got: total,
                });
            }
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }

    /// Verify and persist. Returns `Ok(true)` if this writer's bytes became
    /// the blob, `Ok(false)` if another writer already finished (bytes are
    /// discarded, the blob handle is verified either way).
    ///
    /// Hashing and the write/fsync/rename all happen off the event loop.
    pub async fn finalize(self) -> Result<bool, BlobError> {
        let blob = self.blob;
        let buf = self.buf;

        if blob.is_verified() {
            return Ok(false);
        }
        let _guard = blob.write_lock.lock().await;
        if blob.is_verified() {
            return Ok(false);
        }

        let length = buf.len() as u64;
        if let Some(expected) = blob.length() {
            if length != expected {
                return Err(BlobError::InvalidLength {
                    known: expected,
                    got: length,
                });
            }
        }
        if length == 0 || length > MAX_BLOB_SIZE {
            return Err(BlobError::BlobTooLarge);
        }

        let hash = blob.hash;
        let path = blob.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BlobError> {
            if sha384(&buf) != hash {
                return Err(BlobError::HashMismatch);
            }
            let tmp = tmp_path(&path);
            {
                let mut file = std::fs::File::create(&tmp)?;
                std::io::Write::write_all(&mut file, &buf)?;
                file.sync_all()?;
            }
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await
        .map_err(|_| BlobError::Io(std::io::Error::other("finalize task aborted")))??;

        blob.set_length(length);
        blob.index.update(&hash, |r| {
            r.length = Some(length);
            r.status = BlobStatus::Finished;
        })?;
        blob.verified_tx.send_replace(true);
        debug!(blob = %hash.to_hex(), length, "blob finished");
        Ok(true)
    }
}

pub(super) fn tmp_path(final_path: &std::path::Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    final_path.with_file_name(name)
}
