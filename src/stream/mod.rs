//! Encrypted streams: descriptor format, creation, and assembly.

pub mod assembler;
pub mod creator;
pub mod crypt;
pub mod descriptor;

pub use assembler::StreamDownloader;
pub use creator::{create_stream, CreatedStream};
pub use crypt::CryptError;
pub use descriptor::{BlobInfo, DescriptorError, StreamDescriptor};

use crate::store::BlobError;
use thiserror::Error;

/// User-visible outcome of a failed stream operation. Per-peer trouble never
/// surfaces here; the race layer absorbs it.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("timed out fetching the stream descriptor")]
    SdTimeout,
    #[error("invalid stream descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("{0}")]
    Blob(#[from] BlobError),
    #[error("stream decryption failed: {0}")]
    Crypt(#[from] CryptError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}
