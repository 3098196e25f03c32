//! Stream assembly: from an sd hash to a decrypted file on disk.

use super::crypt::decrypt_blob;
use super::descriptor::StreamDescriptor;
use super::StreamError;
use crate::config::Config;
use crate::dht::{Node, Peer};
use crate::exchange::BlobDownloader;
use crate::store::BlobStore;
use crate::types::BlobHash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

pub struct StreamDownloader {
    config: Arc<Config>,
    store: Arc<BlobStore>,
    node: Arc<Node>,
    /// Peers injected into every download alongside DHT results.
    fixed_peers: Vec<Peer>,
}

impl StreamDownloader {
    pub fn new(config: Arc<Config>, store: Arc<BlobStore>, node: Arc<Node>) -> Self {
        Self {
            config,
            store,
            node,
            fixed_peers: Vec::new(),
        }
    }

    /// Always race these peers in addition to whatever the DHT finds.
    pub fn add_fixed_peers(&mut self, peers: Vec<Peer>) {
        self.fixed_peers.extend(peers);
    }

    /// Materialize the stream named by `sd_hash` into `download_dir`.
    ///
    /// Dropping the returned future cancels the race, the DHT accumulator
    /// and the file write; a partial output file never survives an early
    /// exit.
    pub async fn download_stream(
        &self,
        sd_hash: BlobHash,
        download_dir: &Path,
        file_name: Option<String>,
    ) -> Result<PathBuf, StreamError> {
        let (search_tx, search_rx) = mpsc::channel(self.config.max_connections_per_download);
        // the accumulator dies with its task handle on every exit path
        let (peer_tx, peer_rx, _search_task) = self.node.accumulate_peers(search_rx);
        if !self.fixed_peers.is_empty() {
            let _ = peer_tx.try_send(self.fixed_peers.clone());
        }
        let mut downloader =
            BlobDownloader::new(self.config.clone(), self.store.clone(), peer_tx, peer_rx);

        // the descriptor race is the only one with its own deadline
        let _ = search_tx.send(sd_hash).await;
        let sd_blob = timeout(
            self.config.sd_download_timeout,
            downloader.download_blob(sd_hash, None),
        )
        .await
        .map_err(|_| StreamError::SdTimeout)??;

        let descriptor = StreamDescriptor::parse(&sd_blob.read_all().await?)?;
        debug!(sd = ?sd_hash, blobs = descriptor.data_blobs().len(), "descriptor fetched");

        self.store.mark_should_announce(&sd_hash, true)?;
        if let Some(head) = descriptor.blobs[0].blob_hash.as_ref() {
            self.store.mark_should_announce(head, true)?;
        }

        let name = match file_name {
            Some(name) => name,
            None => {
                let suggested = descriptor.suggested_file_name()?;
                if suggested.is_empty() {
                    sd_hash.to_hex()
                } else {
                    suggested
                }
            }
        };
        tokio::fs::create_dir_all(download_dir).await?;
        let mut out = PartialFile::create_unique(download_dir, &name).await?;

        let key = descriptor.key_bytes()?;
        let data_blobs = descriptor.data_blobs();
        let last = data_blobs.len() - 1;
        for (i, info) in data_blobs.iter().enumerate() {
            let Some(hash) = info.blob_hash else {
                return Err(StreamError::InvalidDescriptor(
                    super::DescriptorError::MissingBlobHash(info.blob_num),
                ));
            };
            let _ = search_tx.send(hash).await;
            let blob = downloader
                .download_blob(hash, Some(info.length))
                .await?;

            let ciphertext = blob.read_all().await?;
            let iv = info.iv_bytes()?;
            let is_last = i == last;
            let plaintext =
                tokio::task::spawn_blocking(move || decrypt_blob(&key, &iv, &ciphertext, is_last))
                    .await
                    .map_err(|_| StreamError::Cancelled)??;
            out.write_all(&plaintext).await?;
            debug!(blob = ?hash, blob_num = info.blob_num, "blob written");
        }
        downloader.close();

        let out_path = out.finish().await?;
        info!(sd = ?sd_hash, path = %out_path.display(), "stream downloaded");
        Ok(out_path)
    }
}

/// Strip anything path-like out of a network-supplied name.
fn sanitize_file_name(name: &str) -> String {
    let name = name
        .replace(['/', '\\'], "_")
        .trim_start_matches('.')
        .to_string();
    if name.is_empty() {
        "download".to_string()
    } else {
        name
    }
}

/// `name`, then `name-1.ext`, `name-2.ext`, … for collision retries.
fn suffixed_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

/// Output file that deletes itself unless `finish` is reached.
struct PartialFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    keep: bool,
}

impl PartialFile {
    async fn create(path: &Path) -> Result<Self, std::io::Error> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            keep: false,
        })
    }

    /// Create under the first free collision-suffixed name. `create_new`
    /// makes the claim atomic, so two concurrent downloads of the same
    /// stream land in different files instead of clobbering each other.
    async fn create_unique(dir: &Path, name: &str) -> Result<Self, std::io::Error> {
        let name = sanitize_file_name(name);
        let mut n = 0;
        loop {
            let path = dir.join(suffixed_name(&name, n));
            match Self::create(&path).await {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), std::io::Error> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes).await,
            None => Err(std::io::Error::other("file already closed")),
        }
    }

    async fn finish(mut self) -> Result<PathBuf, std::io::Error> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        self.keep = true;
        Ok(self.path.clone())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixed_name() {
        assert_eq!(suffixed_name("movie.mp4", 0), "movie.mp4");
        assert_eq!(suffixed_name("movie.mp4", 1), "movie-1.mp4");
        assert_eq!(suffixed_name("movie.mp4", 2), "movie-2.mp4");
        assert_eq!(suffixed_name("noext", 1), "noext-1");
        assert_eq!(suffixed_name(".hidden", 1), ".hidden-1");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name(""), "download");
        assert_eq!(sanitize_file_name("plain.bin"), "plain.bin");
    }

    #[tokio::test]
    async fn test_create_unique_walks_collisions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("movie-1.mp4"), b"x").unwrap();

        let partial = PartialFile::create_unique(dir.path(), "movie.mp4")
            .await
            .unwrap();
        let path = partial.finish().await.unwrap();
        assert_eq!(path, dir.path().join("movie-2.mp4"));
    }

    #[tokio::test]
    async fn test_partial_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        {
            let mut partial = PartialFile::create(&path).await.unwrap();
            partial.write_all(b"half a stream").await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_finished_file_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whole.bin");
        let mut partial = PartialFile::create(&path).await.unwrap();
        partial.write_all(b"all of it").await.unwrap();
        let finished = partial.finish().await.unwrap();
        assert!(finished.exists());
        assert_eq!(std::fs::read(finished).unwrap(), b"all of it");
    }
}
