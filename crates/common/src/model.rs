//! Key metadata and rotation reports.
//!
//! These types are persisted by the key store as JSON and printed by the
//! operator CLI, so every field is plain serializable data. None of them ever
//! hold key material.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, ErrorKind};

// ---------------------------------------------------------------------------
// Key lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of an encryption key.
///
/// Forward order: `Pending → Active → Rotating → Retired → Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Created, not yet used for new writes.
    Pending,
    /// The single key used for new encryptions.
    Active,
    /// Replaced by a newer key; existing data is being re-encrypted.
    Rotating,
    /// No longer referenced by migrated data; still readable.
    Retired,
    /// Terminal. Data under an expired key can no longer be read.
    Expired,
}

impl KeyStatus {
    /// Whether data encrypted under a key in this state may be decrypted.
    ///
    /// Pending keys are readable because rotation writes with the target key
    /// before it is activated.
    pub fn can_decrypt(self) -> bool {
        !matches!(self, KeyStatus::Expired)
    }

    /// Whether the forward state machine allows `self → next`.
    pub fn can_transition_to(self, next: KeyStatus) -> bool {
        matches!(
            (self, next),
            (KeyStatus::Pending, KeyStatus::Active)
                | (KeyStatus::Active, KeyStatus::Rotating)
                | (KeyStatus::Rotating, KeyStatus::Retired)
                | (KeyStatus::Retired, KeyStatus::Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Retired => "retired",
            KeyStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a key's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationNote {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Metadata for a single encryption key. The key material itself is derived
/// on demand and never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Opaque, unique, stable identifier embedded in v2 envelopes.
    pub key_id: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Append-only audit trail of lifecycle events.
    #[serde(default)]
    pub rotation_notes: Vec<RotationNote>,
    /// Number of decryptions performed with this key. Monotonic.
    #[serde(default)]
    pub usage_counter: u64,
    /// `usage_counter` at the moment the key was retired.
    #[serde(default)]
    pub usage_at_retirement: Option<u64>,
    /// Key check value of the derived material, used to detect a changed
    /// master secret.
    pub fingerprint: String,
}

impl KeyRecord {
    /// A fresh Pending record.
    pub fn pending(key_id: impl Into<String>, fingerprint: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            key_id: key_id.into(),
            status: KeyStatus::Pending,
            created_at: now,
            activated_at: None,
            retired_at: None,
            expires_at: None,
            rotation_notes: Vec::new(),
            usage_counter: 0,
            usage_at_retirement: None,
            fingerprint: fingerprint.into(),
        };
        record.note(now, "created");
        record
    }

    /// Append an audit note.
    pub fn note(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.rotation_notes.push(RotationNote {
            at,
            message: message.into(),
        });
    }

    /// True when the key was decrypted with after it was retired.
    pub fn used_since_retirement(&self) -> bool {
        match self.usage_at_retirement {
            Some(mark) => self.usage_counter > mark,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

/// A record that could not be migrated. Carries no field content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub batch: u64,
    pub record_id: String,
    pub kind: ErrorKind,
}

/// Incremental progress of a rotation run, published after every batch.
///
/// `last_record_id` is the resume cursor: a restarted run passes it as
/// `resume_after` instead of rescanning from the start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationProgress {
    pub batches_done: u64,
    pub records_migrated: u64,
    pub records_failed: u64,
    pub last_record_id: Option<String>,
}

impl RotationProgress {
    /// Counters summed across concurrent sub-runs. The sum has no resume
    /// cursor, since each sub-run tracks its own.
    pub fn total<'a>(parts: impl IntoIterator<Item = &'a RotationProgress>) -> Self {
        parts.into_iter().fold(Self::default(), |mut sum, p| {
            sum.batches_done += p.batches_done;
            sum.records_migrated += p.records_migrated;
            sum.records_failed += p.records_failed;
            sum
        })
    }
}

/// Final outcome of a rotation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub target_key_id: String,
    pub dry_run: bool,
    pub batches_done: u64,
    pub records_scanned: u64,
    /// Records re-encrypted (or, in a dry run, that would be).
    pub records_migrated: u64,
    /// Records already fully on the target key.
    pub records_skipped: u64,
    pub records_failed: u64,
    pub failures: Vec<RecordFailure>,
    /// Dry run only: ids of records that would change.
    pub would_change: Vec<String>,
    pub last_record_id: Option<String>,
    /// Keys moved to Retired by the final registry transition.
    pub retired_keys: Vec<String>,
    /// Every batch was processed without a failure. A run that commits the
    /// registry transition also requires every stored field to already be
    /// under the target key; otherwise this stays false and nothing retires.
    pub completed: bool,
    pub cancelled: bool,
    /// The run stopped early on a failure.
    pub halted: bool,
}

impl RotationReport {
    pub fn new(target_key_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            target_key_id: target_key_id.into(),
            dry_run,
            ..Self::default()
        }
    }

    /// Snapshot of the counters for progress reporting.
    pub fn progress(&self) -> RotationProgress {
        RotationProgress {
            batches_done: self.batches_done,
            records_migrated: self.records_migrated,
            records_failed: self.records_failed,
            last_record_id: self.last_record_id.clone(),
        }
    }

    /// Turn a halted run into the [`CryptoError::RotationBatch`] that stopped it.
    pub fn into_result(self) -> Result<Self, CryptoError> {
        if self.halted {
            if let Some(f) = self.failures.last() {
                return Err(CryptoError::RotationBatch {
                    batch: f.batch,
                    record_id: f.record_id.clone(),
                    kind: f.kind,
                });
            }
        }
        Ok(self)
    }

    /// Fold a sub-run (e.g. one range of a parallel rotation) into this report.
    pub fn absorb(&mut self, other: RotationReport) {
        self.batches_done += other.batches_done;
        self.records_scanned += other.records_scanned;
        self.records_migrated += other.records_migrated;
        self.records_skipped += other.records_skipped;
        self.records_failed += other.records_failed;
        self.failures.extend(other.failures);
        self.would_change.extend(other.would_change);
        self.cancelled |= other.cancelled;
        self.halted |= other.halted;
    }
}

/// Outcome of an expiry sweep over retired keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub expired: Vec<String>,
    /// Past `expires_at` but decrypted with since retirement; left Retired.
    pub still_in_use: Vec<String>,
}
