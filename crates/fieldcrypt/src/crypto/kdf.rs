//! Per-key material derivation from the master secret (HKDF-SHA256).
//!
//! Material is never persisted: the same master secret and key id always
//! derive the same 32 bytes, so only key ids are stored.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::CryptoError;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::cipher::KEY_LEN;

/// Minimum decoded master secret length.
pub const MIN_MASTER_SECRET_LEN: usize = 32;

/// HKDF `info` label; domain-separates field keys from any other use of the
/// master secret.
const FIELD_KEY_INFO: &[u8] = b"fieldcrypt/field-key/v2";

/// Context used for the implicit single key behind `v1` envelopes. Contains a
/// `/`, so it can never collide with a registry key id.
const V1_DEFAULT_CONTEXT: &str = "v1-default/implicit";

const FINGERPRINT_LABEL: &[u8] = b"fieldcrypt/key-check-value";

/// Root secret every field key is derived from.
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    /// Decode a base64 master secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if the value is empty, not valid
    /// base64, or shorter than [`MIN_MASTER_SECRET_LEN`] bytes once decoded.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(CryptoError::Configuration("master secret is not set".into()));
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::Configuration("master secret is not valid base64".into()))?;
        Self::from_bytes(bytes)
    }

    /// Wrap raw master secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if shorter than [`MIN_MASTER_SECRET_LEN`].
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() < MIN_MASTER_SECRET_LEN {
            return Err(CryptoError::Configuration(format!(
                "master secret must decode to at least {MIN_MASTER_SECRET_LEN} bytes"
            )));
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

/// Derived symmetric key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Key check value: first 8 bytes of HMAC-SHA256(material, label), hex.
    ///
    /// Safe to persist; reveals nothing usable about the material.
    pub fn fingerprint(&self) -> String {
        // HMAC accepts keys of any length.
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.0)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(FINGERPRINT_LABEL);
        let tag = mac.finalize().into_bytes();
        tag[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// Derives per-key material from an injected master secret.
///
/// Cheap to clone; the secret is shared behind an `Arc`.
#[derive(Clone, Debug)]
pub struct KeyDerivation {
    master: Arc<MasterSecret>,
}

impl KeyDerivation {
    pub fn new(master: MasterSecret) -> Self {
        Self {
            master: Arc::new(master),
        }
    }

    /// Derive the material for `key_id`, using the id as the HKDF salt.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if HKDF rejects the output length,
    /// which cannot happen for [`KEY_LEN`].
    pub fn derive(&self, key_id: &str) -> Result<KeyMaterial, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(key_id.as_bytes()), &self.master.0);
        let mut out = [0u8; KEY_LEN];
        hk.expand(FIELD_KEY_INFO, &mut out)
            .map_err(|e| CryptoError::Configuration(format!("key derivation failed: {e}")))?;
        Ok(KeyMaterial(out))
    }

    /// Material for the implicit default key of `v1` envelopes.
    pub fn derive_v1(&self) -> Result<KeyMaterial, CryptoError> {
        self.derive(V1_DEFAULT_CONTEXT)
    }
}
