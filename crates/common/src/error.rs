//! Error taxonomy shared by the derivation, cipher, envelope, registry, and
//! rotation layers.
//!
//! Messages never carry plaintext, ciphertext, or key material. Record-level
//! failures carry the record id and an [`ErrorKind`] only.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::KeyStatus;

/// Top-level error type for every field encryption operation.
///
/// Propagation rules:
/// - [`CryptoError::Configuration`] and [`CryptoError::NoActiveKey`] are fatal
///   (see [`CryptoError::is_fatal`]); callers abort startup or the request.
/// - [`CryptoError::Parse`] and [`CryptoError::Integrity`] are per field; the
///   caller decides whether one unreadable field fails the whole operation.
/// - [`CryptoError::Storage`], [`CryptoError::Conflict`] and
///   [`CryptoError::Timeout`] may be retried.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The master secret is missing or malformed, or a setting is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The envelope string is malformed. Never echoes the input.
    #[error("malformed envelope: {0}")]
    Parse(String),

    /// Authentication failed: tampered ciphertext or the wrong key material.
    #[error("integrity check failed")]
    Integrity,

    /// The key id is not present in the registry.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The key id exists but has expired; data under it can no longer be read.
    #[error("key expired: {0}")]
    KeyExpired(String),

    /// No key is currently active for new encryptions.
    #[error("no active key")]
    NoActiveKey,

    /// A legacy (compression-only) payload was found with legacy support disabled.
    #[error("legacy payload requires migration; legacy support is disabled")]
    MigrationRequired,

    /// The lifecycle state machine rejected a transition.
    #[error("invalid transition for key {key_id}: {from} -> {to}")]
    InvalidTransition {
        key_id: String,
        from: KeyStatus,
        to: KeyStatus,
    },

    /// Plaintext exceeds the supported field size.
    #[error("plaintext too large: {len} bytes (max {max})")]
    PlaintextTooLarge { len: usize, max: usize },

    /// The first failure within a rotation batch.
    #[error("rotation batch {batch} failed on record {record_id}: {kind}")]
    RotationBatch {
        batch: u64,
        record_id: String,
        kind: ErrorKind,
    },

    /// The record is claimed by another rotation worker.
    #[error("record is locked by another worker: {0}")]
    RecordLocked(String),

    /// The key store or record store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored value changed between read and write; the write was not applied.
    #[error("write conflict on record {0}")]
    Conflict(String),

    /// A batch step did not finish within its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl CryptoError {
    /// Returns the content-free classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::Configuration(_) => ErrorKind::Configuration,
            CryptoError::Parse(_) => ErrorKind::Parse,
            CryptoError::Integrity => ErrorKind::Integrity,
            CryptoError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            CryptoError::KeyExpired(_) => ErrorKind::KeyExpired,
            CryptoError::NoActiveKey => ErrorKind::NoActiveKey,
            CryptoError::MigrationRequired => ErrorKind::MigrationRequired,
            CryptoError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            CryptoError::PlaintextTooLarge { .. } => ErrorKind::PlaintextTooLarge,
            CryptoError::RotationBatch { .. } => ErrorKind::RotationBatch,
            CryptoError::RecordLocked(_) => ErrorKind::RecordLocked,
            CryptoError::Storage(_) => ErrorKind::Storage,
            CryptoError::Conflict(_) => ErrorKind::Conflict,
            CryptoError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Errors that must abort startup or request handling outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CryptoError::Configuration(_) | CryptoError::NoActiveKey)
    }

    /// Errors worth retrying with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CryptoError::Storage(_) | CryptoError::Conflict(_) | CryptoError::Timeout(_)
        )
    }
}

/// Serializable classification of a [`CryptoError`], safe for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Parse,
    Integrity,
    KeyNotFound,
    KeyExpired,
    NoActiveKey,
    MigrationRequired,
    InvalidTransition,
    PlaintextTooLarge,
    RotationBatch,
    RecordLocked,
    Storage,
    Conflict,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Parse => "parse",
            ErrorKind::Integrity => "integrity",
            ErrorKind::KeyNotFound => "key_not_found",
            ErrorKind::KeyExpired => "key_expired",
            ErrorKind::NoActiveKey => "no_active_key",
            ErrorKind::MigrationRequired => "migration_required",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::PlaintextTooLarge => "plaintext_too_large",
            ErrorKind::RotationBatch => "rotation_batch",
            ErrorKind::RecordLocked => "record_locked",
            ErrorKind::Storage => "storage",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
