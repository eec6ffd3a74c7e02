//! [`FieldCipher`]: the encode/decode service called by the owning application.
//!
//! Encrypt: active key → derive → seal → wrap as `v2`.
//! Decrypt: parse → resolve the key for the envelope's version → open.

use std::sync::Arc;

use common::CryptoError;

use crate::crypto;
use crate::envelope::{self, Envelope, VersionTag, WrapVersion};
use crate::legacy::LegacyMigrator;
use crate::registry::{ActiveKey, KeyRegistry};

/// Result of decrypting one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: String,
    pub version: VersionTag,
    pub key_id: Option<String>,
    /// The value is stored in a format that cannot take part in rotation
    /// (`legacy` or `v1`) and should be re-encrypted to `v2`.
    pub migration_needed: bool,
}

/// Field encryption service. Cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    registry: Arc<KeyRegistry>,
    legacy: LegacyMigrator,
}

impl FieldCipher {
    pub fn new(registry: Arc<KeyRegistry>, legacy: LegacyMigrator) -> Self {
        Self { registry, legacy }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn legacy(&self) -> &LegacyMigrator {
        &self.legacy
    }

    /// Encrypt `plaintext` under the Active key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoActiveKey`] if no key is Active; there is no
    /// unencrypted fallback.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let active = self.registry.active_key()?;
        self.encrypt_with(&active, plaintext)
    }

    /// Encrypt under an explicit key; used by rotation to write with its target.
    pub fn encrypt_with(&self, key: &ActiveKey, plaintext: &str) -> Result<String, CryptoError> {
        let sealed = crypto::encrypt(plaintext.as_bytes(), &key.material)?;
        envelope::wrap(
            WrapVersion::V2 {
                key_id: &key.key_id,
            },
            &sealed,
        )
    }

    /// Decrypt an envelope of any supported version.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Parse`] for malformed envelopes, [`CryptoError::Integrity`]
    /// for tampered data, [`CryptoError::KeyNotFound`] / [`CryptoError::KeyExpired`]
    /// for unreadable keys, and [`CryptoError::MigrationRequired`] for legacy
    /// payloads while legacy support is off.
    pub fn decrypt(&self, envelope: &str) -> Result<Decrypted, CryptoError> {
        match Envelope::parse(envelope)? {
            Envelope::Legacy { payload } => Ok(Decrypted {
                plaintext: self.legacy.decode(&payload)?,
                version: VersionTag::Legacy,
                key_id: None,
                migration_needed: true,
            }),
            Envelope::V1 { ciphertext } => {
                let material = self.registry.kdf().derive_v1()?;
                Ok(Decrypted {
                    plaintext: into_utf8(crypto::decrypt(&ciphertext, &material)?)?,
                    version: VersionTag::V1,
                    key_id: None,
                    migration_needed: true,
                })
            }
            Envelope::V2 { key_id, ciphertext } => {
                let material = self.registry.lookup(&key_id)?;
                Ok(Decrypted {
                    plaintext: into_utf8(crypto::decrypt(&ciphertext, &material)?)?,
                    version: VersionTag::V2,
                    key_id: Some(key_id),
                    migration_needed: false,
                })
            }
        }
    }

    /// Decrypt a field of `record_id`, raising the migration signal for that
    /// record when its value is in a pre-v2 format.
    pub fn decrypt_field(&self, record_id: &str, envelope: &str) -> Result<String, CryptoError> {
        let decrypted = self.decrypt(envelope)?;
        if decrypted.migration_needed {
            self.legacy.flag(record_id);
        }
        Ok(decrypted.plaintext)
    }
}

fn into_utf8(bytes: Vec<u8>) -> Result<String, CryptoError> {
    String::from_utf8(bytes).map_err(|_| CryptoError::Parse("decrypted value is not valid UTF-8".into()))
}
