//! The owning application's records, as seen by rotation: [`RecordStore`] plus
//! an in-memory store and a JSON-file store for the operator CLI.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use common::CryptoError;
use serde::{Deserialize, Serialize};

/// A record holding zero or more encrypted fields, keyed by a stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub record_id: String,
    /// Field name → envelope string.
    pub fields: BTreeMap<String, String>,
}

impl FieldRecord {
    pub fn new<'a>(
        record_id: impl Into<String>,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        }
    }
}

/// One field rewrite. `previous` is the rollback log entry for `envelope`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub record_id: String,
    pub field: String,
    pub previous: String,
    pub envelope: String,
}

impl FieldUpdate {
    /// The update that restores the previous value.
    pub fn inverse(&self) -> Self {
        Self {
            record_id: self.record_id.clone(),
            field: self.field.clone(),
            previous: self.envelope.clone(),
            envelope: self.previous.clone(),
        }
    }
}

/// Half-open record-id range `[start, end)`; `None` is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl RecordRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(start: Option<&str>, end: Option<&str>) -> Self {
        Self {
            start: start.map(str::to_owned),
            end: end.map(str::to_owned),
        }
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.start.as_deref().map_or(true, |s| record_id >= s)
            && self.end.as_deref().map_or(true, |e| record_id < e)
    }

    pub fn overlaps(&self, other: &RecordRange) -> bool {
        let starts_before = |start: &Option<String>, end: &Option<String>| match (start, end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        starts_before(&self.start, &other.end) && starts_before(&other.start, &self.end)
    }
}

/// Access to the records whose fields are rotated.
///
/// `fetch_after` must return records in ascending `record_id` order so that
/// the last id of a batch is a valid resume cursor.
///
/// `write_batch` is a compare-and-swap on [`FieldUpdate::previous`]: when any
/// field no longer holds its `previous` value, nothing is written and the call
/// fails with [`CryptoError::Conflict`]. It should also be all-or-nothing; when
/// a store cannot guarantee that, the orchestrator undoes the part of a failed
/// write that landed.
pub trait RecordStore: Send + Sync {
    /// Up to `limit` records in `range` with ids strictly after `after`.
    fn fetch_after(
        &self,
        range: &RecordRange,
        after: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<FieldRecord>, CryptoError>> + Send;

    /// The records with the given ids; unknown ids are skipped.
    fn fetch_by_ids(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<FieldRecord>, CryptoError>> + Send;

    /// Apply `updates` if every field still holds its `previous` value.
    fn write_batch(
        &self,
        updates: &[FieldUpdate],
    ) -> impl Future<Output = Result<(), CryptoError>> + Send;
}

fn select_after(
    records: &BTreeMap<String, FieldRecord>,
    range: &RecordRange,
    after: Option<&str>,
    limit: usize,
) -> Vec<FieldRecord> {
    records
        .values()
        .filter(|r| after.map_or(true, |a| r.record_id.as_str() > a))
        .filter(|r| range.contains(&r.record_id))
        .take(limit)
        .cloned()
        .collect()
}

/// Fails with the first record whose field no longer matches `previous`.
fn check_previous(
    records: &BTreeMap<String, FieldRecord>,
    updates: &[FieldUpdate],
) -> Result<(), CryptoError> {
    for u in updates {
        let current = records.get(&u.record_id).and_then(|r| r.fields.get(&u.field));
        if current != Some(&u.previous) {
            return Err(CryptoError::Conflict(u.record_id.clone()));
        }
    }
    Ok(())
}

fn apply(records: &mut BTreeMap<String, FieldRecord>, updates: &[FieldUpdate]) {
    for u in updates {
        if let Some(record) = records.get_mut(&u.record_id) {
            record.fields.insert(u.field.clone(), u.envelope.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Faults {
    write_delay: Duration,
    /// Upcoming writes that sleep for `write_delay` first.
    delayed_writes: u32,
    /// Upcoming writes that apply only their first half, then fail.
    partial_failures: u32,
    writes: u64,
}

/// In-memory [`RecordStore`] with fault injection for exercising rollback,
/// retry and timeout paths.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, FieldRecord>>,
    faults: Mutex<Faults>,
}

impl MemoryRecordStore {
    pub fn new(records: Vec<FieldRecord>) -> Self {
        Self {
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|r| (r.record_id.clone(), r))
                    .collect(),
            ),
            faults: Mutex::default(),
        }
    }

    pub fn get(&self, record_id: &str) -> Option<FieldRecord> {
        self.records().get(record_id).cloned()
    }

    pub fn all(&self) -> Vec<FieldRecord> {
        self.records().values().cloned().collect()
    }

    /// Make the next `n` writes fail after applying half of their updates.
    pub fn fail_next_writes(&self, n: u32) {
        self.faults().partial_failures = n;
    }

    /// Make the next `n` writes sleep for `delay` before touching any record.
    pub fn delay_next_writes(&self, n: u32, delay: Duration) {
        let mut faults = self.faults();
        faults.delayed_writes = n;
        faults.write_delay = delay;
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.faults().writes
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, FieldRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RecordStore for MemoryRecordStore {
    async fn fetch_after(
        &self,
        range: &RecordRange,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FieldRecord>, CryptoError> {
        Ok(select_after(&self.records(), range, after, limit))
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<FieldRecord>, CryptoError> {
        let records = self.records();
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn write_batch(&self, updates: &[FieldUpdate]) -> Result<(), CryptoError> {
        let delay = {
            let mut faults = self.faults();
            if faults.delayed_writes > 0 {
                faults.delayed_writes -= 1;
                Some(faults.write_delay)
            } else {
                None
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut faults = self.faults();
        let mut records = self.records();
        check_previous(&records, updates)?;
        if faults.partial_failures > 0 {
            faults.partial_failures -= 1;
            apply(&mut records, &updates[..updates.len() / 2]);
            return Err(CryptoError::Storage("injected write failure".into()));
        }
        apply(&mut records, updates);
        faults.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// [`RecordStore`] over a JSON array of [`FieldRecord`]s. Each batch write
/// rewrites the file through a temp file + rename, so it is all-or-nothing.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, FieldRecord>, CryptoError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CryptoError::Storage(format!("failed to read records {}: {e}", self.path.display()))
        })?;
        let records: Vec<FieldRecord> = serde_json::from_str(&text).map_err(|e| {
            CryptoError::Storage(format!("records file {} is corrupt: {e}", self.path.display()))
        })?;
        Ok(records
            .into_iter()
            .map(|r| (r.record_id.clone(), r))
            .collect())
    }
}

impl RecordStore for FileRecordStore {
    async fn fetch_after(
        &self,
        range: &RecordRange,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FieldRecord>, CryptoError> {
        Ok(select_after(&self.load().await?, range, after, limit))
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<FieldRecord>, CryptoError> {
        let records = self.load().await?;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn write_batch(&self, updates: &[FieldUpdate]) -> Result<(), CryptoError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        check_previous(&records, updates)?;
        apply(&mut records, updates);
        let list: Vec<&FieldRecord> = records.values().collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|e| CryptoError::Storage(format!("failed to serialise records: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        let io_err = |e: std::io::Error| {
            CryptoError::Storage(format!("failed to write {}: {e}", self.path.display()))
        };
        tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str) -> FieldRecord {
        FieldRecord::new(id, [("email", "v1:x")])
    }

    #[test]
    fn range_contains_half_open() {
        let r = RecordRange::new(Some("b"), Some("d"));
        assert!(!r.contains("a"));
        assert!(r.contains("b"));
        assert!(r.contains("c"));
        assert!(!r.contains("d"));
        assert!(RecordRange::all().contains("anything"));
    }

    #[test]
    fn range_overlap() {
        let ab = RecordRange::new(Some("a"), Some("m"));
        let mz = RecordRange::new(Some("m"), None);
        let all = RecordRange::all();
        assert!(!ab.overlaps(&mz));
        assert!(!mz.overlaps(&ab));
        assert!(ab.overlaps(&all));
        assert!(RecordRange::new(Some("a"), Some("n")).overlaps(&mz));
    }

    #[test]
    fn inverse_swaps_values() {
        let u = FieldUpdate {
            record_id: "r".into(),
            field: "f".into(),
            previous: "old".into(),
            envelope: "new".into(),
        };
        let inv = u.inverse();
        assert_eq!(inv.envelope, "old");
        assert_eq!(inv.previous, "new");
    }

    #[tokio::test]
    async fn memory_store_pages_in_id_order() {
        let store = MemoryRecordStore::new(vec![rec("c"), rec("a"), rec("b")]);
        let first = store.fetch_after(&RecordRange::all(), None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.record_id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        let rest = store
            .fetch_after(&RecordRange::all(), Some("b"), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record_id, "c");
    }

    #[tokio::test]
    async fn memory_store_partial_failure_applies_half() {
        let store = MemoryRecordStore::new(vec![rec("a"), rec("b")]);
        store.fail_next_writes(1);
        let updates: Vec<FieldUpdate> = ["a", "b"]
            .iter()
            .map(|id| FieldUpdate {
                record_id: (*id).into(),
                field: "email".into(),
                previous: "v1:x".into(),
                envelope: "v1:y".into(),
            })
            .collect();
        assert!(matches!(
            store.write_batch(&updates).await,
            Err(CryptoError::Storage(_))
        ));
        assert_eq!(store.get("a").unwrap().fields["email"], "v1:y");
        assert_eq!(store.get("b").unwrap().fields["email"], "v1:x");

        // `a` no longer holds its previous value, so the whole batch is refused.
        assert!(matches!(
            store.write_batch(&updates).await,
            Err(CryptoError::Conflict(id)) if id == "a"
        ));
        assert_eq!(store.get("b").unwrap().fields["email"], "v1:x");
        store.write_batch(&updates[1..]).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn stale_previous_value_is_a_conflict() {
        let store = MemoryRecordStore::new(vec![rec("a"), rec("b")]);
        let stale = [
            FieldUpdate {
                record_id: "a".into(),
                field: "email".into(),
                previous: "v1:x".into(),
                envelope: "v1:new".into(),
            },
            FieldUpdate {
                record_id: "b".into(),
                field: "email".into(),
                previous: "v1:changed-by-app".into(),
                envelope: "v1:new".into(),
            },
        ];
        assert!(matches!(
            store.write_batch(&stale).await,
            Err(CryptoError::Conflict(id)) if id == "b"
        ));
        assert_eq!(store.get("a").unwrap().fields["email"], "v1:x");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, serde_json::to_string(&vec![rec("a"), rec("b")]).unwrap()).unwrap();

        let store = FileRecordStore::new(&path);
        store
            .write_batch(&[FieldUpdate {
                record_id: "b".into(),
                field: "email".into(),
                previous: "v1:x".into(),
                envelope: "v1:z".into(),
            }])
            .await
            .unwrap();
        let got = store.fetch_by_ids(&["b".to_string()]).await.unwrap();
        assert_eq!(got[0].fields["email"], "v1:z");
        assert!(!path.with_extension("tmp").exists());

        let replay = store
            .write_batch(&[FieldUpdate {
                record_id: "b".into(),
                field: "email".into(),
                previous: "v1:x".into(),
                envelope: "v1:w".into(),
            }])
            .await;
        assert!(matches!(replay, Err(CryptoError::Conflict(_))));
        let got = store.fetch_by_ids(&["b".to_string()]).await.unwrap();
        assert_eq!(got[0].fields["email"], "v1:z");
    }
}
