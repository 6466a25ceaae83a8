//! At-rest encryption applied to every stored blob.
//!
//! Sealed bytes are `nonce || ciphertext` under AES-256-GCM with the owning
//! study's server key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

pub const SERVER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SealError {
    #[error("[RD405] server key must be {SERVER_KEY_LEN} bytes")]
    BadKey,
    #[error("[RD406] sealed object is truncated")]
    Truncated,
    #[error("[RD407] sealed object failed authentication")]
    Authentication,
}

/// Random key for a new study.
#[must_use]
pub fn generate_server_key() -> [u8; SERVER_KEY_LEN] {
    let mut key = [0u8; SERVER_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

#[must_use]
pub fn encode_server_key(key: &[u8; SERVER_KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// # Errors
/// Fails when the text is not base64 of exactly [`SERVER_KEY_LEN`] bytes.
pub fn decode_server_key(text: &str) -> Result<[u8; SERVER_KEY_LEN], SealError> {
    let raw = BASE64.decode(text.trim()).map_err(|_| SealError::BadKey)?;
    raw.try_into().map_err(|_| SealError::BadKey)
}

/// # Errors
/// Returns [`SealError::Authentication`] if the cipher rejects the input.
pub fn seal(key: &[u8; SERVER_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::BadKey)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealError::Authentication)?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// # Errors
/// Fails on truncated input or when authentication does not verify.
pub fn open(key: &[u8; SERVER_KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < NONCE_LEN {
        return Err(SealError::Truncated);
    }
    let (nonce_raw, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::BadKey)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_raw), ciphertext)
        .map_err(|_| SealError::Authentication)
}
