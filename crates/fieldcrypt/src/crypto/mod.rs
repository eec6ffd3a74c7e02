//! Key derivation and AES-256-GCM-SIV field encryption primitives.
//!
//! This module is free of registry and storage concerns. It turns a master
//! secret plus a key id into key material, and key material plus plaintext
//! into authenticated ciphertext bytes.
//!
//! # Ciphertext layout
//!
//! ```text
//! nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! The string form (`v2:<key_id>:<base64>`) is owned by [`crate::envelope`].

pub mod cipher;
pub mod kdf;

pub use cipher::{decrypt, encrypt, KEY_LEN, MAX_PLAINTEXT_LEN, NONCE_LEN, TAG_LEN};
pub use kdf::{KeyDerivation, KeyMaterial, MasterSecret};
