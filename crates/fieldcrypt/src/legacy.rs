//! Pre-encryption (`legacy`) payloads: decode on read, flag for upgrade, and an
//! opportunistic sweep that re-encrypts flagged records to `v2`.
//!
//! Legacy payloads are zstd-compressed plaintext with no integrity protection.
//! Reading them requires the explicit `legacy_support` flag; without it every
//! legacy value is a hard [`CryptoError::MigrationRequired`].

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::{Arc, Mutex};

use common::model::RecordFailure;
use common::CryptoError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::crypto::MAX_PLAINTEXT_LEN;
use crate::rotation::{plan_record, roll_back};
use crate::rotation::records::RecordStore;
use crate::service::FieldCipher;

/// Record ids whose stored values need re-encryption to `v2`.
#[derive(Debug, Clone, Default)]
pub struct MigrationQueue {
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl MigrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self, record_id: &str) {
        self.lock().insert(record_id.to_owned());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current contents, in record-id order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Remove and return every flagged id.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    fn requeue(&self, ids: &[String]) {
        self.lock().extend(ids.iter().cloned());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        // A set of ids cannot be left half-updated; recover from poisoning.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of one [`LegacyMigrator::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub records_scanned: u64,
    pub records_upgraded: u64,
    pub fields_upgraded: u64,
    pub failures: Vec<RecordFailure>,
    /// Ids put back on the queue for a later sweep.
    pub requeued: u64,
}

/// Decodes legacy payloads and tracks records needing migration.
#[derive(Debug, Clone)]
pub struct LegacyMigrator {
    enabled: bool,
    queue: MigrationQueue,
}

impl LegacyMigrator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            queue: MigrationQueue::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn queue(&self) -> &MigrationQueue {
        &self.queue
    }

    /// Decompress a legacy payload to plaintext.
    ///
    /// # Errors
    ///
    /// [`CryptoError::MigrationRequired`] when legacy support is disabled;
    /// [`CryptoError::Parse`] when the payload is not a zstd frame, exceeds
    /// [`MAX_PLAINTEXT_LEN`] once decompressed, or is not UTF-8.
    pub fn decode(&self, payload: &[u8]) -> Result<String, CryptoError> {
        if !self.enabled {
            warn!("legacy payload encountered with legacy support disabled");
            return Err(CryptoError::MigrationRequired);
        }
        decompress(payload)
    }

    /// Flag `record_id` for re-encryption.
    pub fn flag(&self, record_id: &str) {
        debug!(record_id, "record flagged for migration");
        self.queue.flag(record_id);
    }

    /// Re-encrypt every flagged record's `legacy` and `v1` fields to `v2`
    /// under the Active key, `batch_size` records per atomic write.
    ///
    /// A batch containing an unreadable record is skipped as a whole and its
    /// ids go back on the queue. So is a batch whose write fails, after any
    /// part of it that landed has been undone.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoActiveKey`] (the queue is left intact), or a store
    /// error while fetching (the unprocessed ids are requeued).
    pub async fn sweep<S: RecordStore>(
        &self,
        cipher: &FieldCipher,
        store: &S,
        batch_size: usize,
    ) -> Result<SweepReport, CryptoError> {
        let active = cipher.registry().active_key()?;
        let ids = self.queue.drain();
        let mut report = SweepReport::default();

        let chunks: Vec<&[String]> = ids.chunks(batch_size.max(1)).collect();
        for (n, chunk) in chunks.iter().enumerate() {
            let records = match store.fetch_by_ids(chunk).await {
                Ok(r) => r,
                Err(e) => {
                    let rest: Vec<String> = chunks[n..].iter().flat_map(|c| c.iter().cloned()).collect();
                    self.queue.requeue(&rest);
                    return Err(e);
                }
            };
            report.records_scanned += records.len() as u64;

            let mut updates = Vec::new();
            let mut upgraded = 0u64;
            let mut failure = None;
            for record in &records {
                match plan_record(cipher, &active, record, true) {
                    Ok(planned) if planned.is_empty() => {}
                    Ok(planned) => {
                        upgraded += 1;
                        updates.extend(planned);
                    }
                    Err(e) => {
                        failure = Some(RecordFailure {
                            batch: n as u64 + 1,
                            record_id: record.record_id.clone(),
                            kind: e.kind(),
                        });
                        break;
                    }
                }
            }

            if let Some(f) = failure {
                warn!(record_id = %f.record_id, kind = %f.kind, "legacy sweep batch skipped");
                report.failures.push(f);
                self.queue.requeue(chunk);
                report.requeued += chunk.len() as u64;
                continue;
            }
            if updates.is_empty() {
                continue;
            }
            if let Err(e) = store.write_batch(&updates).await {
                match roll_back(store, &updates).await {
                    Ok(restored) => {
                        warn!(error = %e, restored, "legacy sweep write failed; batch requeued")
                    }
                    Err(undo) => error!(
                        error = %e,
                        rollback_error = %undo,
                        "legacy sweep rollback failed; records may be mixed"
                    ),
                }
                report.failures.push(RecordFailure {
                    batch: n as u64 + 1,
                    record_id: updates[0].record_id.clone(),
                    kind: e.kind(),
                });
                self.queue.requeue(chunk);
                report.requeued += chunk.len() as u64;
                continue;
            }
            report.records_upgraded += upgraded;
            report.fields_upgraded += updates.len() as u64;
        }

        info!(
            upgraded = report.records_upgraded,
            requeued = report.requeued,
            "legacy sweep finished"
        );
        Ok(report)
    }
}

fn decompress(payload: &[u8]) -> Result<String, CryptoError> {
    let invalid = || CryptoError::Parse("legacy payload is not a valid compressed frame".into());
    let decoder = zstd::stream::read::Decoder::new(payload).map_err(|_| invalid())?;
    let mut out = Vec::new();
    decoder
        .take(MAX_PLAINTEXT_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| invalid())?;
    if out.len() > MAX_PLAINTEXT_LEN {
        return Err(CryptoError::Parse(
            "legacy payload exceeds the maximum field size".into(),
        ));
    }
    String::from_utf8(out).map_err(|_| CryptoError::Parse("legacy payload is not valid UTF-8".into()))
}
