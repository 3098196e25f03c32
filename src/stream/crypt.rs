//! AES-128-CBC encryption of stream blobs.
//!
//! Every data blob is encrypted with the stream key and its own IV. Only the
//! stream's final data blob carries PKCS#7 padding; earlier blobs are a
//! whole number of AES blocks and decrypt without unpadding.

use crate::types::AES_BLOCK_SIZE;
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Stream key width in bytes.
pub const KEY_SIZE: usize = 16;
/// Per-blob IV width in bytes.
pub const IV_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptError {
    #[error("ciphertext is not a whole number of AES blocks")]
    NotBlockAligned,
    #[error("invalid PKCS#7 padding")]
    InvalidPadding,
}

/// Encrypt one blob's plaintext. `pad` is set for the stream's final data
/// blob; unpadded plaintext must already be block aligned.
pub fn encrypt_blob(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
    pad: bool,
) -> Result<Vec<u8>, CryptError> {
    let enc = Aes128CbcEnc::new(key.into(), iv.into());
    if pad {
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    } else {
        if plaintext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptError::NotBlockAligned);
        }
        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
    }
}

/// Decrypt one blob. `strip_padding` is set for the stream's final data blob.
pub fn decrypt_blob(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
    strip_padding: bool,
) -> Result<Vec<u8>, CryptError> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptError::NotBlockAligned);
    }
    let dec = Aes128CbcDec::new(key.into(), iv.into());
    if strip_padding {
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptError::InvalidPadding)
    } else {
        dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptError::InvalidPadding)
    }
}
