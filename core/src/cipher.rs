//! Authenticated encryption of per-message payloads.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce. The nonce travels
//! prepended to the ciphertext, so the transport form is
//! `nonce || ciphertext+tag`. Each message key seals exactly one payload
//! and is discarded afterwards; nonce reuse is therefore impossible by
//! construction, the random nonce only guards against state mix-ups.

use {
    chacha20poly1305::{
        aead::{Aead, KeyInit},
        ChaCha20Poly1305, Nonce,
    },
    rand::rngs::OsRng,
    rand_core::RngCore,
    thiserror::Error,
};

/// Nonce length prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Failures of the AEAD layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Authentication tag mismatch or truncated input. No plaintext is ever
    /// returned alongside this error.
    #[error("decryption failed")]
    DecryptionFailed,
    /// Encryption backend failure (should be unreachable with a 32-byte key).
    #[error("AEAD error")]
    Aead,
}

/// Ciphertext plus the nonce it was sealed under.
#[derive(Clone, Debug)]
pub struct EncryptedPayload {
    /// `nonce || ciphertext+tag`, ready for transport.
    pub ciphertext: Vec<u8>,
    /// The nonce, also carried separately for callers that store it apart.
    pub nonce: [u8; NONCE_LEN],
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<EncryptedPayload, CipherError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Aead)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(EncryptedPayload {
        ciphertext: out,
        nonce,
    })
}

/// Open a bare ciphertext with an explicit nonce.
pub fn decrypt(ciphertext: &[u8], key: &[u8; 32], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CipherError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::DecryptionFailed)
}

/// Open a transport-form payload (`nonce || ciphertext+tag`).
pub fn decrypt_prefixed(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CipherError> {
    if data.len() < NONCE_LEN {
        return Err(CipherError::DecryptionFailed);
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("split is exactly NONCE_LEN");
    decrypt(ct, key, &nonce)
}
