//! Stream creation: chunk a file into encrypted blobs plus a descriptor.

use super::crypt::{encrypt_blob, KEY_SIZE};
use super::descriptor::{BlobInfo, StreamDescriptor};
use super::StreamError;
use crate::config::Config;
use crate::store::BlobStore;
use crate::types::{sha384, BlobHash, AES_BLOCK_SIZE, MAX_BLOB_SIZE};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Plaintext bytes per data blob. Block-aligned so non-final blobs need no
/// padding, and one block short of the cap so the final blob's padding
/// still fits under `MAX_BLOB_SIZE`.
pub const MAX_BLOB_DATA_SIZE: usize = MAX_BLOB_SIZE as usize - AES_BLOCK_SIZE;

/// Result of publishing a file as a stream.
#[derive(Debug, Clone)]
pub struct CreatedStream {
    pub sd_hash: BlobHash,
    pub descriptor: StreamDescriptor,
}

/// Encrypt `source` into blobs, persist them, and store the descriptor blob.
/// The descriptor and head blob are flagged for DHT announcement.
pub async fn create_stream(
    store: &BlobStore,
    config: &Config,
    source: &Path,
    file_name: Option<String>,
) -> Result<CreatedStream, StreamError> {
    let name = match file_name {
        Some(name) => name,
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let key: [u8; KEY_SIZE] = rand::random();
    let mut file = tokio::fs::File::open(source).await?;
    let mut blobs: Vec<BlobInfo> = Vec::new();
    let mut blob_num: u32 = 0;

    // Read one chunk ahead so the loop knows which chunk is final and needs
    // padding. An empty file still produces one (all-padding) data blob.
    let mut current = read_chunk(&mut file).await?;
    loop {
        let next = if current.len() == MAX_BLOB_DATA_SIZE {
            read_chunk(&mut file).await?
        } else {
            Vec::new()
        };
        let is_final = next.is_empty();

        let iv: [u8; 16] = rand::random();
        let ciphertext = encrypt_blob(&key, &iv, &current, is_final)?;
        let hash = write_blob(store, &ciphertext).await?;
        blobs.push(BlobInfo {
            blob_hash: Some(hash),
            blob_num,
            iv: hex::encode(iv),
            length: ciphertext.len() as u64,
        });
        debug!(blob = %hash.to_hex(), blob_num, "stream blob written");
        blob_num += 1;

        if is_final {
            break;
        }
        current = next;
    }

    blobs.push(BlobInfo {
        blob_hash: None,
        blob_num,
        iv: hex::encode(rand::random::<[u8; 16]>()),
        length: 0,
    });

    let mut descriptor = StreamDescriptor {
        blobs,
        key: hex::encode(key),
        stream_hash: String::new(),
        stream_name: hex::encode(&name),
        suggested_file_name: hex::encode(&name),
    };
    descriptor.stream_hash = descriptor.compute_stream_hash();

    let sd_bytes = descriptor.serialize();
    let sd_hash = write_blob(store, &sd_bytes).await?;

    store.mark_should_announce(&sd_hash, true)?;
    if let Some(head) = descriptor.blobs[0].blob_hash.as_ref() {
        store.mark_should_announce(head, true)?;
    }
    if !config.announce_head_and_sd_only {
        for info in descriptor.data_blobs() {
            if let Some(hash) = info.blob_hash.as_ref() {
                store.mark_should_announce(hash, true)?;
            }
        }
    }

    info!(
        sd = %sd_hash.to_hex(),
        blobs = descriptor.data_blobs().len(),
        "stream created"
    );
    Ok(CreatedStream {
        sd_hash,
        descriptor,
    })
}

async fn read_chunk(file: &mut tokio::fs::File) -> Result<Vec<u8>, StreamError> {
    let mut buf = vec![0u8; MAX_BLOB_DATA_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn write_blob(store: &BlobStore, content: &[u8]) -> Result<BlobHash, StreamError> {
    let hash = sha384(content);
    let blob = store.get_blob(hash, Some(content.len() as u64)).await?;
    if blob.is_verified() {
        return Ok(hash);
    }
    let mut writer = blob.open_for_writing();
    writer.write(content)?;
    writer.finalize().await?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::crypt::decrypt_blob;

    fn test_config(dir: &Path) -> Config {
        Config::with_data_dir(dir.to_path_buf())
    }

    async fn setup(dir: &Path) -> BlobStore {
        BlobStore::open(&dir.join("blobfiles"), &dir.join("db")).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_decrypt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = setup(dir.path()).await;
        let config = test_config(dir.path());

        let source = dir.path().join("input.bin");
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &content).unwrap();

        let created = create_stream(&store, &config, &source, None).await.unwrap();
        let d = &created.descriptor;
        assert_eq!(d.suggested_file_name().unwrap(), "input.bin");
        assert_eq!(d.data_blobs().len(), 1);

        // descriptor blob is stored and hashes to sd_hash
        let sd_bytes = store.read_blob(created.sd_hash).await.unwrap();
        assert_eq!(StreamDescriptor::parse(&sd_bytes).unwrap(), *d);

        // decrypting the blobs in order yields the original file
        let key = d.key_bytes().unwrap();
        let mut plaintext = Vec::new();
        let data = d.data_blobs();
        for (i, info) in data.iter().enumerate() {
            let ct = store.read_blob(info.blob_hash.unwrap()).await.unwrap();
            let iv = info.iv_bytes().unwrap();
            plaintext.extend(decrypt_blob(&key, &iv, &ct, i == data.len() - 1).unwrap());
        }
        assert_eq!(plaintext, content);
    }

    #[tokio::test]
    async fn test_multi_blob_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = setup(dir.path()).await;
        let config = test_config(dir.path());

        // exactly one full chunk: a full blob plus a padding-only final blob
        // would be wasteful, so the chunk itself becomes the padded final
        let source = dir.path().join("exact.bin");
        std::fs::write(&source, vec![3u8; MAX_BLOB_DATA_SIZE]).unwrap();
        let created = create_stream(&store, &config, &source, None).await.unwrap();
        assert_eq!(created.descriptor.data_blobs().len(), 1);
        assert_eq!(
            created.descriptor.data_blobs()[0].length,
            MAX_BLOB_SIZE
        );

        // one byte over a chunk spills into a second data blob
        let source = dir.path().join("spill.bin");
        std::fs::write(&source, vec![4u8; MAX_BLOB_DATA_SIZE + 1]).unwrap();
        let created = create_stream(&store, &config, &source, None).await.unwrap();
        assert_eq!(created.descriptor.data_blobs().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_file_single_padding_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = setup(dir.path()).await;
        let config = test_config(dir.path());

        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();
        let created = create_stream(&store, &config, &source, None).await.unwrap();
        let data = created.descriptor.data_blobs();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].length, AES_BLOCK_SIZE as u64);
    }

    #[tokio::test]
    async fn test_head_and_sd_flagged_for_announce() {
        let dir = tempfile::tempdir().unwrap();
        let store = setup(dir.path()).await;
        let config = test_config(dir.path());

        let source = dir.path().join("file.bin");
        std::fs::write(&source, b"flag the head blob").unwrap();
        let created = create_stream(&store, &config, &source, None).await.unwrap();

        let due = store.blobs_to_announce(crate::types::now(), config.announce_interval, true);
        assert!(due.contains(&created.sd_hash));
        assert!(due.contains(&created.descriptor.blobs[0].blob_hash.unwrap()));
        assert_eq!(due.len(), 2);
    }
}
