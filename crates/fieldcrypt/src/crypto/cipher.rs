//! AES-256-GCM-SIV encryption and decryption of individual field values.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! A fresh random nonce is still drawn per call, so two encryptions of the same
//! plaintext under the same key produce different bytes.
//!
//! **Do NOT substitute plain AES-256-GCM with a fixed nonce.** GCM nonce reuse
//! is catastrophic: it breaks both confidentiality and authentication.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use common::CryptoError;

use super::kdf::KeyMaterial;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag.
pub const TAG_LEN: usize = 16;

/// Largest plaintext accepted for a single field (64 KiB).
pub const MAX_PLAINTEXT_LEN: usize = 64 * 1024;

/// Encrypt `plaintext` under `material`.
///
/// Returns `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`CryptoError::PlaintextTooLarge`] above [`MAX_PLAINTEXT_LEN`].
pub fn encrypt(plaintext: &[u8], material: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::PlaintextTooLarge {
            len: plaintext.len(),
            max: MAX_PLAINTEXT_LEN,
        });
    }
    let cipher = build_cipher(material)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // Only fails on inputs far beyond MAX_PLAINTEXT_LEN.
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Integrity)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt bytes produced by [`encrypt`].
///
/// The tag is verified before any plaintext is released.
///
/// # Errors
///
/// Returns [`CryptoError::Integrity`] if the input is truncated, was altered,
/// or was sealed under different key material.
pub fn decrypt(sealed: &[u8], material: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Integrity);
    }
    let cipher = build_cipher(material)?;
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Integrity)
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256GcmSiv, CryptoError> {
    Aes256GcmSiv::new_from_slice(material.as_bytes())
        .map_err(|_| CryptoError::Configuration("key material has invalid length".into()))
}
