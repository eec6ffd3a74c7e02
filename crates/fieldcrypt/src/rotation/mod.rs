//! Key rotation: re-encrypt every stored field under a target key, in batches.
//!
//! Each batch is decrypt-all, then re-encrypt-all, then one compare-and-swap
//! write. A record that cannot be read discards its whole batch before
//! anything is written, so no record is ever left half-migrated. A write that
//! fails is undone and the batch is re-read and re-planned before the retry,
//! so values written by the application in the meantime are never replaced
//! by a stale re-encryption. Earlier batches stay committed and the run can be
//! resumed from `last_record_id`.
//!
//! The registry only moves (target Active, old keys Retired) after a run with
//! no failures, and only once every stored field is under the target key; see
//! [`KeyRegistry::complete_rotation`].
//!
//! [`KeyRegistry::complete_rotation`]: crate::registry::KeyRegistry::complete_rotation

pub mod claims;
pub mod records;

pub use claims::ClaimSet;
pub use records::{FieldRecord, FieldUpdate, FileRecordStore, MemoryRecordStore, RecordRange, RecordStore};

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::model::{RecordFailure, RotationProgress};
use common::{CryptoError, ErrorKind, RotationReport};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::envelope::peek_key_id;
use crate::registry::ActiveKey;
use crate::service::FieldCipher;

/// Store-facing limits for one rotation run.
#[derive(Debug, Clone)]
pub struct RotationSettings {
    /// Upper bound on each fetch and each batch write.
    pub batch_timeout: Duration,
    /// Extra attempts for a fetch or write that failed or timed out.
    pub max_batch_retries: u32,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(30),
            max_batch_retries: 2,
        }
    }
}

/// What to rotate and how.
#[derive(Debug, Clone)]
pub struct RotationJob {
    pub target_key_id: String,
    pub batch_size: usize,
    /// Plan every batch but write nothing and leave the registry alone.
    pub dry_run: bool,
    /// Record failures and keep going instead of halting on the first one.
    pub continue_on_error: bool,
    pub range: RecordRange,
    /// Resume cursor from an earlier run's `last_record_id`.
    pub resume_after: Option<String>,
    /// Commit the registry transition when the run finishes cleanly and no
    /// stored field is left under an older key.
    pub finalize: bool,
}

impl RotationJob {
    pub fn new(target_key_id: impl Into<String>, batch_size: usize) -> Self {
        Self {
            target_key_id: target_key_id.into(),
            batch_size,
            dry_run: false,
            continue_on_error: false,
            range: RecordRange::all(),
            resume_after: None,
            finalize: true,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn range(mut self, range: RecordRange) -> Self {
        self.range = range;
        self
    }

    pub fn resume_after(mut self, record_id: Option<String>) -> Self {
        self.resume_after = record_id;
        self
    }
}

/// Plan the field rewrites that bring `record` onto `target`.
///
/// Fields already under `target` are left alone. With `unkeyed_only`, only
/// `legacy` and `v1` fields are touched; `v2` fields under any key are kept.
pub(crate) fn plan_record(
    cipher: &FieldCipher,
    target: &ActiveKey,
    record: &FieldRecord,
    unkeyed_only: bool,
) -> Result<Vec<FieldUpdate>, CryptoError> {
    let mut updates = Vec::new();
    for (field, current) in &record.fields {
        if let Some(key_id) = peek_key_id(current) {
            if unkeyed_only || key_id == target.key_id {
                continue;
            }
        }
        let decrypted = cipher.decrypt(current)?;
        updates.push(FieldUpdate {
            record_id: record.record_id.clone(),
            field: field.clone(),
            previous: current.clone(),
            envelope: cipher.encrypt_with(target, &decrypted.plaintext)?,
        });
    }
    Ok(updates)
}

/// Undo whatever part of `written` reached the store.
///
/// Only fields that still hold the envelope from `written` are restored, so a
/// value the application changed since is kept. Returns the number of fields
/// restored.
pub(crate) async fn roll_back<S: RecordStore>(
    store: &S,
    written: &[FieldUpdate],
) -> Result<usize, CryptoError> {
    let mut ids: Vec<String> = written.iter().map(|u| u.record_id.clone()).collect();
    ids.dedup();
    let current = store.fetch_by_ids(&ids).await?;
    let landed: Vec<FieldUpdate> = written
        .iter()
        .filter(|u| {
            current
                .iter()
                .any(|r| r.record_id == u.record_id && r.fields.get(&u.field) == Some(&u.envelope))
        })
        .map(FieldUpdate::inverse)
        .collect();
    if landed.is_empty() {
        return Ok(0);
    }
    store.write_batch(&landed).await?;
    Ok(landed.len())
}

#[derive(Default)]
struct BatchPlan {
    updates: Vec<FieldUpdate>,
    migrated: u64,
    skipped: u64,
    changed: Vec<String>,
}

enum BatchOutcome {
    Committed(BatchPlan),
    /// Nothing was written; one record could not be processed.
    Rejected(RecordFailure),
    /// The store could not take the batch even after retries. `record_id` is
    /// the first record the batch tried to change.
    Failed { record_id: String, error: CryptoError },
}

/// This worker's entry on a board shared by the workers of one parallel run.
#[derive(Clone)]
struct ProgressSlot {
    index: usize,
    board: Arc<Mutex<Vec<RotationProgress>>>,
}

/// Runs rotation jobs against one record store.
///
/// Clones share the claim set and the progress channel.
pub struct RotationOrchestrator<S> {
    cipher: FieldCipher,
    store: Arc<S>,
    settings: RotationSettings,
    claims: ClaimSet,
    progress: Arc<watch::Sender<RotationProgress>>,
    slot: Option<ProgressSlot>,
}

impl<S> Clone for RotationOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            cipher: self.cipher.clone(),
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            claims: self.claims.clone(),
            progress: Arc::clone(&self.progress),
            slot: self.slot.clone(),
        }
    }
}

impl<S: RecordStore + 'static> RotationOrchestrator<S> {
    pub fn new(cipher: FieldCipher, store: Arc<S>, settings: RotationSettings) -> Self {
        let (progress, _) = watch::channel(RotationProgress::default());
        Self {
            cipher,
            store,
            settings,
            claims: ClaimSet::new(),
            progress: Arc::new(progress),
            slot: None,
        }
    }

    /// Share record claims with other orchestrators over the same records.
    pub fn with_claims(mut self, claims: ClaimSet) -> Self {
        self.claims = claims;
        self
    }

    /// Progress after every batch. During [`run_parallel`](Self::run_parallel)
    /// the counters are summed over all ranges.
    pub fn subscribe(&self) -> watch::Receiver<RotationProgress> {
        self.progress.subscribe()
    }

    /// Rotate the records in `job.range` onto `job.target_key_id`.
    ///
    /// Record-level failures are reported in the returned report; a halted
    /// run has `halted` set and converts to [`CryptoError::RotationBatch`]
    /// through [`RotationReport::into_result`]. Cancellation is observed at
    /// batch boundaries only.
    ///
    /// # Errors
    ///
    /// Invalid job parameters, an unusable target key, a store that stays
    /// unreadable after retries, or a failed registry commit.
    #[instrument(skip_all, fields(target_key_id = %job.target_key_id, dry_run = job.dry_run))]
    pub async fn run(
        &self,
        job: RotationJob,
        cancel: &CancellationToken,
    ) -> Result<RotationReport, CryptoError> {
        if job.batch_size == 0 {
            return Err(CryptoError::Configuration("batch size must be at least 1".into()));
        }
        let target = self.cipher.registry().rotation_target(&job.target_key_id)?;
        let mut report = RotationReport::new(&job.target_key_id, job.dry_run);
        report.last_record_id = job.resume_after.clone();
        info!(
            batch_size = job.batch_size,
            resume_after = job.resume_after.as_deref(),
            "rotation started"
        );

        let mut batch = 0u64;
        loop {
            if cancel.is_cancelled() {
                info!(batches = report.batches_done, "rotation cancelled");
                report.cancelled = true;
                break;
            }
            let records = self
                .fetch(&job.range, report.last_record_id.as_deref(), job.batch_size)
                .await?;
            let Some(last) = records.last().map(|r| r.record_id.clone()) else {
                break;
            };
            batch += 1;
            report.records_scanned += records.len() as u64;

            match self.process_batch(&job, &target, batch, &records).await {
                BatchOutcome::Committed(plan) => {
                    report.batches_done += 1;
                    report.records_migrated += plan.migrated;
                    report.records_skipped += plan.skipped;
                    report.would_change.extend(plan.changed);
                    info!(
                        batch,
                        migrated = plan.migrated,
                        skipped = plan.skipped,
                        last_record_id = %last,
                        "rotation batch done"
                    );
                }
                BatchOutcome::Rejected(failure) => {
                    warn!(
                        batch,
                        record_id = %failure.record_id,
                        kind = %failure.kind,
                        "rotation batch discarded"
                    );
                    report.records_failed += 1;
                    report.failures.push(failure);
                    if !job.continue_on_error {
                        report.halted = true;
                        self.publish(&report);
                        break;
                    }
                }
                BatchOutcome::Failed { record_id, error } => {
                    error!(
                        batch,
                        record_id = %record_id,
                        error = %error,
                        resume_after = report.last_record_id.as_deref(),
                        "rotation halted; batch could not be written"
                    );
                    report.records_failed += 1;
                    report.failures.push(RecordFailure {
                        batch,
                        record_id,
                        kind: error.kind(),
                    });
                    report.halted = true;
                    self.publish(&report);
                    break;
                }
            }
            report.last_record_id = Some(last);
            self.publish(&report);
        }

        self.finish(&job, &mut report).await?;
        info!(
            migrated = report.records_migrated,
            skipped = report.records_skipped,
            failed = report.records_failed,
            completed = report.completed,
            "rotation finished"
        );
        Ok(report)
    }

    /// Run `job` over disjoint `ranges` concurrently and finalize once.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Configuration`] for empty or overlapping ranges, or the
    /// first error returned by any worker.
    pub async fn run_parallel(
        &self,
        job: RotationJob,
        ranges: Vec<RecordRange>,
        cancel: &CancellationToken,
    ) -> Result<RotationReport, CryptoError> {
        if ranges.is_empty() {
            return Err(CryptoError::Configuration("no record ranges given".into()));
        }
        for (i, a) in ranges.iter().enumerate() {
            if ranges[i + 1..].iter().any(|b| a.overlaps(b)) {
                return Err(CryptoError::Configuration(format!(
                    "record range {a:?} overlaps another range"
                )));
            }
        }
        // Fail before spawning anything if the target is unusable.
        self.cipher.registry().rotation_target(&job.target_key_id)?;

        let board = Arc::new(Mutex::new(vec![RotationProgress::default(); ranges.len()]));
        let mut workers = JoinSet::new();
        for (index, range) in ranges.into_iter().enumerate() {
            let mut worker = self.clone();
            worker.slot = Some(ProgressSlot {
                index,
                board: Arc::clone(&board),
            });
            let sub = RotationJob {
                range,
                resume_after: None,
                finalize: false,
                ..job.clone()
            };
            let cancel = cancel.clone();
            workers.spawn(async move { worker.run(sub, &cancel).await });
        }

        let mut report = RotationReport::new(&job.target_key_id, job.dry_run);
        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(sub)) => report.absorb(sub),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(CryptoError::Storage(format!("rotation worker failed: {e}")));
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        self.finish(&job, &mut report).await?;
        Ok(report)
    }

    /// Decide whether the run completed and, if so, commit the registry.
    ///
    /// A resumed run or a single range only sees part of the store, so the
    /// whole store is scanned first; any field not yet under the target key
    /// keeps the old keys in service.
    async fn finish(&self, job: &RotationJob, report: &mut RotationReport) -> Result<(), CryptoError> {
        report.completed = !report.cancelled && !report.halted && report.failures.is_empty();
        if !report.completed || !job.finalize || job.dry_run {
            return Ok(());
        }
        if let Some(record_id) = self.first_unrotated(&job.target_key_id, job.batch_size).await? {
            warn!(
                record_id = %record_id,
                "records outside this run are not on the target key; registry left unchanged"
            );
            report.completed = false;
            return Ok(());
        }
        report.retired_keys = self.cipher.registry().complete_rotation(&job.target_key_id)?;
        Ok(())
    }

    /// The first record holding a field that is not under `target_key_id`.
    async fn first_unrotated(
        &self,
        target_key_id: &str,
        page: usize,
    ) -> Result<Option<String>, CryptoError> {
        let all = RecordRange::all();
        let mut after: Option<String> = None;
        loop {
            let records = self.fetch(&all, after.as_deref(), page).await?;
            let Some(last) = records.last().map(|r| r.record_id.clone()) else {
                return Ok(None);
            };
            if let Some(stale) = records
                .iter()
                .find(|r| r.fields.values().any(|v| peek_key_id(v) != Some(target_key_id)))
            {
                return Ok(Some(stale.record_id.clone()));
            }
            after = Some(last);
        }
    }

    async fn fetch(
        &self,
        range: &RecordRange,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FieldRecord>, CryptoError> {
        let mut attempt = 0;
        loop {
            let err = match self
                .bounded(self.store.fetch_after(range, after, limit), "record fetch")
                .await
            {
                Ok(records) => return Ok(records),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.settings.max_batch_retries {
                error!(error = %err, resume_after = after, "record fetch failed");
                return Err(err);
            }
            attempt += 1;
            warn!(attempt, error = %err, "record fetch failed; retrying");
        }
    }

    /// Claim, plan and write one batch.
    ///
    /// A failed write is undone, then the batch is re-read and re-planned so
    /// the retry compares against what the store holds now.
    async fn process_batch(
        &self,
        job: &RotationJob,
        target: &ActiveKey,
        batch: u64,
        records: &[FieldRecord],
    ) -> BatchOutcome {
        let ids: Vec<String> = records.iter().map(|r| r.record_id.clone()).collect();
        let _claim = match self.claims.try_claim(&ids) {
            Ok(guard) => guard,
            Err(record_id) => {
                return BatchOutcome::Rejected(RecordFailure {
                    batch,
                    record_id,
                    kind: ErrorKind::RecordLocked,
                })
            }
        };

        let mut current = records.to_vec();
        let mut attempt = 0;
        loop {
            let plan = match self.plan_batch(job, target, batch, &current) {
                Ok(plan) => plan,
                Err(failure) => return BatchOutcome::Rejected(failure),
            };
            let Some(record_id) = plan.updates.first().map(|u| u.record_id.clone()) else {
                return BatchOutcome::Committed(plan);
            };
            if job.dry_run {
                return BatchOutcome::Committed(plan);
            }

            let label = format!("batch {batch} write");
            let written = self.bounded(self.store.write_batch(&plan.updates), &label).await;
            let err = match written {
                Ok(()) => return BatchOutcome::Committed(plan),
                Err(e) => e,
            };

            let label = format!("batch {batch} rollback");
            match self.bounded(roll_back(&*self.store, &plan.updates), &label).await {
                Ok(restored) => debug!(batch, restored, "failed batch write rolled back"),
                Err(e) => {
                    error!(batch, error = %e, "batch rollback failed; records may be mixed");
                    return BatchOutcome::Failed { record_id, error: e };
                }
            }

            if !err.is_retryable() || attempt >= self.settings.max_batch_retries {
                return BatchOutcome::Failed { record_id, error: err };
            }
            attempt += 1;
            warn!(batch, attempt, error = %err, "batch write failed; re-reading batch and retrying");

            let label = format!("batch {batch} re-read");
            current = match self.bounded(self.store.fetch_by_ids(&ids), &label).await {
                Ok(records) => records,
                Err(e) => return BatchOutcome::Failed { record_id, error: e },
            };
        }
    }

    fn plan_batch(
        &self,
        job: &RotationJob,
        target: &ActiveKey,
        batch: u64,
        records: &[FieldRecord],
    ) -> Result<BatchPlan, RecordFailure> {
        let mut plan = BatchPlan::default();
        for record in records {
            match plan_record(&self.cipher, target, record, false) {
                Ok(planned) if planned.is_empty() => plan.skipped += 1,
                Ok(planned) => {
                    plan.migrated += 1;
                    if job.dry_run {
                        plan.changed.push(record.record_id.clone());
                    }
                    plan.updates.extend(planned);
                }
                Err(e) => {
                    return Err(RecordFailure {
                        batch,
                        record_id: record.record_id.clone(),
                        kind: e.kind(),
                    })
                }
            }
        }
        Ok(plan)
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CryptoError>>,
        what: &str,
    ) -> Result<T, CryptoError> {
        timeout(self.settings.batch_timeout, op)
            .await
            .unwrap_or_else(|_| Err(CryptoError::Timeout(what.to_owned())))
    }

    fn publish(&self, report: &RotationReport) {
        let progress = report.progress();
        match &self.slot {
            None => {
                self.progress.send_replace(progress);
            }
            Some(slot) => {
                let mut board = slot.board.lock().unwrap_or_else(|e| e.into_inner());
                board[slot.index] = progress;
                self.progress.send_replace(RotationProgress::total(board.iter()));
            }
        }
    }
}

/// Rotate every record in `store` onto `target_key_id` with default settings.
pub async fn rotate<S: RecordStore + 'static>(
    cipher: &FieldCipher,
    store: Arc<S>,
    target_key_id: &str,
    batch_size: usize,
    dry_run: bool,
) -> Result<RotationReport, CryptoError> {
    RotationOrchestrator::new(cipher.clone(), store, RotationSettings::default())
        .run(
            RotationJob::new(target_key_id, batch_size).dry_run(dry_run),
            &CancellationToken::new(),
        )
        .await
}
