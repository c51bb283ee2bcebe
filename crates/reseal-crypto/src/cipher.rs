//! ChaCha20-Poly1305 authenticated encryption with detached tags
//!
//! Session keys are single-use, but nonces are still random: the envelope
//! format carries the nonce explicitly, so nothing depends on key uniqueness.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce, Tag,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;
/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// Poly1305 tag (16 bytes)
pub const TAG_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed - data may be corrupted or tampered")]
    DecryptionFailed,

    #[error("Invalid key size: expected {KEY_SIZE}, got {0}")]
    InvalidKeySize(usize),

    #[error("Invalid nonce size: expected {NONCE_SIZE}, got {0}")]
    InvalidNonceSize(usize),

    #[error("Invalid tag size: expected {TAG_SIZE}, got {0}")]
    InvalidTagSize(usize),
}

/// Generate a cryptographically secure random key
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut());
    key
}

/// Generate a cryptographically secure random nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` bound to `aad`.
///
/// Returns the ciphertext (same length as the plaintext) and the detached tag.
pub fn encrypt(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CipherError> {
    let cipher = new_cipher(key)?;
    let nonce = checked_nonce(nonce)?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, aad, &mut buffer)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((buffer, tag_bytes))
}

/// Decrypt a ciphertext produced by [`encrypt`].
///
/// Fails with `DecryptionFailed` on any tag or AAD mismatch; garbage is never returned.
pub fn decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let cipher = new_cipher(key)?;
    let nonce = checked_nonce(nonce)?;
    if tag.len() != TAG_SIZE {
        return Err(CipherError::InvalidTagSize(tag.len()));
    }

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(nonce, aad, buffer.as_mut_slice(), Tag::from_slice(tag))
        .map_err(|_| CipherError::DecryptionFailed)?;

    Ok(buffer)
}

fn new_cipher(key: &[u8]) -> Result<ChaCha20Poly1305, CipherError> {
    if key.len() != KEY_SIZE {
        return Err(CipherError::InvalidKeySize(key.len()));
    }
    ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize(key.len()))
}

fn checked_nonce(nonce: &[u8]) -> Result<&Nonce, CipherError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CipherError::InvalidNonceSize(nonce.len()));
    }
    Ok(Nonce::from_slice(nonce))
}
