//! Durable blob metadata index.
//!
//! One record per blob keyed by the raw 48-byte hash. Values are
//! bincode-encoded; bincode stays local-only, the wire never sees it.

use super::BlobError;
use crate::types::{BlobHash, HASH_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    Pending,
    Finished,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub length: Option<u64>,
    pub status: BlobStatus,
    pub last_announced_at: Option<u64>,
    pub should_announce: bool,
}

impl BlobRecord {
    pub fn pending(length: Option<u64>) -> Self {
        Self {
            length,
            status: BlobStatus::Pending,
            last_announced_at: None,
            should_announce: false,
        }
    }
}

/// Sled-backed index. Read-modify-write cycles are serialized by an
/// in-process lock; sled itself makes individual operations durable.
#[derive(Clone, Debug)]
pub struct BlobIndex {
    db: sled::Db,
    write_lock: Arc<Mutex<()>>,
}

impl BlobIndex {
    pub fn open(path: &Path) -> Result<Self, BlobError> {
        Ok(Self {
            db: sled::open(path)?,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn get(&self, hash: &BlobHash) -> Result<Option<BlobRecord>, BlobError> {
        match self.db.get(hash.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, hash: &BlobHash, record: &BlobRecord) -> Result<(), BlobError> {
        let _guard = self.write_lock.lock().expect("index lock poisoned");
        self.db.insert(hash.as_bytes(), bincode::serialize(record)?)?;
        Ok(())
    }

    /// Apply `f` to the existing record, or to a fresh `Pending` one if the
    /// blob is unknown.
    pub fn update<F>(&self, hash: &BlobHash, f: F) -> Result<BlobRecord, BlobError>
    where
        F: FnOnce(&mut BlobRecord),
    {
        let _guard = self.write_lock.lock().expect("index lock poisoned");
        let mut record = match self.db.get(hash.as_bytes())? {
            Some(raw) => bincode::deserialize(&raw)?,
            None => BlobRecord::pending(None),
        };
        f(&mut record);
        self.db.insert(hash.as_bytes(), bincode::serialize(&record)?)?;
        Ok(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(BlobHash, BlobRecord), BlobError>> {
        self.db.iter().map(|item| {
            let (key, raw) = item?;
            if key.len() != HASH_SIZE {
                return Err(BlobError::Corrupt("bad index key width"));
            }
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&key);
            Ok((BlobHash(hash), bincode::deserialize(&raw)?))
        })
    }

    pub fn flush(&self) -> Result<(), BlobError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sha384;

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlobIndex::open(&dir.path().join("index")).unwrap();
        let hash = sha384(b"record");

        assert!(index.get(&hash).unwrap().is_none());

        index.put(&hash, &BlobRecord::pending(Some(9))).unwrap();
        let rec = index.get(&hash).unwrap().unwrap();
        assert_eq!(rec.length, Some(9));
        assert_eq!(rec.status, BlobStatus::Pending);

        index
            .update(&hash, |r| {
                r.status = BlobStatus::Finished;
                r.should_announce = true;
            })
            .unwrap();
        let rec = index.get(&hash).unwrap().unwrap();
        assert_eq!(rec.status, BlobStatus::Finished);
        assert!(rec.should_announce);

        let all: Vec<_> = index.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, hash);
    }

    #[test]
    fn test_update_creates_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlobIndex::open(&dir.path().join("index")).unwrap();
        let hash = sha384(b"fresh");

        index.update(&hash, |r| r.should_announce = true).unwrap();
        let rec = index.get(&hash).unwrap().unwrap();
        assert_eq!(rec.status, BlobStatus::Pending);
        assert!(rec.should_announce);
    }
}
