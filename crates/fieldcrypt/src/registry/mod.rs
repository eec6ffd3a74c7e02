//! Key registry: key metadata, the lifecycle state machine, and the single
//! Active key.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──activate──▶ Active ──(replacement activated)──▶ Rotating
//!                                                              │
//!                              Expired ◀──(expires_at)── Retired ◀──rotation complete
//! ```
//!
//! # Concurrency
//!
//! Readers (`active_key`, `lookup`) load an immutable [`Snapshot`] through
//! `arc-swap` and never block. Writers are serialized by a mutex, build the
//! next snapshot from a clone, persist it with one [`KeyStore::save`], and only
//! then swap it in. A reader therefore sees either the old or the new Active
//! key, never zero or two.
//!
//! # Invariants
//!
//! - At most one key is Active in every committed snapshot.
//! - Forward transitions only, except the separately audited
//!   [`KeyRegistry::reactivate_key`], which is disabled unless configured.
//! - Records are never removed; Expired is terminal.

pub mod store;

pub use store::{FileKeyStore, KeyStore, MemoryKeyStore};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use common::model::ExpiryReport;
use common::{CryptoError, KeyRecord, KeyStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{KeyDerivation, KeyMaterial};
use crate::envelope::is_valid_key_id;

/// Attempts at drawing an unused key id before giving up.
const KEY_ID_ATTEMPTS: usize = 8;

/// Tunables for the lifecycle state machine.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// How long a retired key stays readable before it may expire.
    pub retention: Duration,
    /// Whether [`KeyRegistry::reactivate_key`] is permitted at all.
    pub allow_reactivation: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            retention: Duration::days(90),
            allow_reactivation: false,
        }
    }
}

/// The key currently used for new encryptions.
#[derive(Debug)]
pub struct ActiveKey {
    pub key_id: String,
    pub material: KeyMaterial,
}

#[derive(Debug, Clone)]
struct KeyEntry {
    record: KeyRecord,
    /// Shared across snapshots so decrypt counts survive commits.
    usage: Arc<AtomicU64>,
}

impl KeyEntry {
    fn new(record: KeyRecord) -> Self {
        let usage = Arc::new(AtomicU64::new(record.usage_counter));
        Self { record, usage }
    }

    fn materialize(&self) -> KeyRecord {
        let mut record = self.record.clone();
        record.usage_counter = self.usage.load(Ordering::Relaxed);
        record
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    keys: BTreeMap<String, KeyEntry>,
    active: Option<String>,
}

impl Snapshot {
    fn build(keys: BTreeMap<String, KeyEntry>) -> Result<Self, CryptoError> {
        let active: Vec<&String> = keys
            .iter()
            .filter(|(_, e)| e.record.status == KeyStatus::Active)
            .map(|(id, _)| id)
            .collect();
        if active.len() > 1 {
            return Err(CryptoError::Configuration(format!(
                "key registry has {} active keys; at most one is allowed",
                active.len()
            )));
        }
        let active = active.first().map(|id| (*id).clone());
        Ok(Self { keys, active })
    }

    fn records(&self) -> Vec<KeyRecord> {
        self.keys.values().map(KeyEntry::materialize).collect()
    }
}

/// Thread-safe registry of encryption keys.
#[derive(Debug)]
pub struct KeyRegistry {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    store: Arc<dyn KeyStore>,
    kdf: KeyDerivation,
    policy: LifecyclePolicy,
}

impl KeyRegistry {
    /// Load the registry from `store` and check it against the master secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] if the store holds more than one
    /// Active key, an invalid or duplicate key id, or a fingerprint that does
    /// not match the material derived from the configured master secret.
    pub fn open(
        store: Arc<dyn KeyStore>,
        kdf: KeyDerivation,
        policy: LifecyclePolicy,
    ) -> Result<Self, CryptoError> {
        let mut keys = BTreeMap::new();
        for record in store.load()? {
            if !is_valid_key_id(&record.key_id) {
                return Err(CryptoError::Configuration(
                    "key store contains an invalid key id".into(),
                ));
            }
            if kdf.derive(&record.key_id)?.fingerprint() != record.fingerprint {
                return Err(CryptoError::Configuration(format!(
                    "master secret does not match stored key {}",
                    record.key_id
                )));
            }
            let key_id = record.key_id.clone();
            if keys.insert(key_id.clone(), KeyEntry::new(record)).is_some() {
                return Err(CryptoError::Configuration(format!(
                    "key store contains duplicate key id {key_id}"
                )));
            }
        }

        let snapshot = Snapshot::build(keys)?;
        info!(
            keys = snapshot.keys.len(),
            active = snapshot.active.as_deref().unwrap_or("none"),
            "key registry loaded"
        );

        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
            store,
            kdf,
            policy,
        })
    }

    /// The derivation used for every key, including the implicit v1 key.
    pub fn kdf(&self) -> &KeyDerivation {
        &self.kdf
    }

    /// Create a new Pending key.
    pub fn create_key(&self) -> Result<KeyRecord, CryptoError> {
        let record = self.commit(|keys, now| {
            let mut key_id = generate_key_id(now);
            let mut attempts = 1;
            while keys.contains_key(&key_id) {
                if attempts == KEY_ID_ATTEMPTS {
                    return Err(CryptoError::Storage("could not allocate a unique key id".into()));
                }
                key_id = generate_key_id(now);
                attempts += 1;
            }
            let fingerprint = self.kdf.derive(&key_id)?.fingerprint();
            let record = KeyRecord::pending(key_id.clone(), fingerprint, now);
            keys.insert(key_id, KeyEntry::new(record.clone()));
            Ok(record)
        })?;
        info!(key_id = %record.key_id, "key created");
        Ok(record)
    }

    /// Activate a Pending key. The current Active key, if any, is demoted to
    /// Rotating in the same commit.
    pub fn activate_key(&self, key_id: &str) -> Result<(), CryptoError> {
        let demoted = self.commit(|keys, now| {
            let status = status_in(keys, key_id)?;
            if status != KeyStatus::Pending {
                return Err(CryptoError::InvalidTransition {
                    key_id: key_id.to_owned(),
                    from: status,
                    to: KeyStatus::Active,
                });
            }
            let demoted = demote_active(keys, key_id, now);
            self.transition(keys, key_id, KeyStatus::Active, now, "activated")?;
            Ok(demoted)
        })?;
        info!(key_id, demoted = demoted.as_deref().unwrap_or("none"), "key activated");
        Ok(())
    }

    /// The Active key and its material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoActiveKey`] when no key is Active. Callers must
    /// treat this as fatal, never as "store unencrypted".
    pub fn active_key(&self) -> Result<ActiveKey, CryptoError> {
        let snapshot = self.snapshot.load();
        let key_id = snapshot.active.clone().ok_or(CryptoError::NoActiveKey)?;
        let material = self.kdf.derive(&key_id)?;
        Ok(ActiveKey { key_id, material })
    }

    /// Material for decrypting data under `key_id`; counts one use.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] for unknown ids and
    /// [`CryptoError::KeyExpired`] for Expired keys.
    pub fn lookup(&self, key_id: &str) -> Result<KeyMaterial, CryptoError> {
        let snapshot = self.snapshot.load();
        let Some(entry) = snapshot.keys.get(key_id) else {
            warn!(key_id, "decrypt refused: unknown key");
            return Err(CryptoError::KeyNotFound(key_id.to_owned()));
        };
        if !entry.record.status.can_decrypt() {
            warn!(key_id, "decrypt refused: key expired");
            return Err(CryptoError::KeyExpired(key_id.to_owned()));
        }
        entry.usage.fetch_add(1, Ordering::Relaxed);
        self.kdf.derive(key_id)
    }

    /// Material for writing with a rotation target, which must be Pending or
    /// Active.
    pub fn rotation_target(&self, key_id: &str) -> Result<ActiveKey, CryptoError> {
        let status = self
            .status_of(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_owned()))?;
        if !matches!(status, KeyStatus::Pending | KeyStatus::Active) {
            return Err(CryptoError::InvalidTransition {
                key_id: key_id.to_owned(),
                from: status,
                to: KeyStatus::Active,
            });
        }
        Ok(ActiveKey {
            key_id: key_id.to_owned(),
            material: self.kdf.derive(key_id)?,
        })
    }

    /// Final step of a successful rotation, committed atomically:
    /// the target becomes Active (if it is not already), the previously Active
    /// key and every Rotating key become Retired.
    ///
    /// Returns the ids of the retired keys.
    pub fn complete_rotation(&self, target: &str) -> Result<Vec<String>, CryptoError> {
        let retired = self.commit(|keys, now| {
            match status_in(keys, target)? {
                KeyStatus::Pending => {
                    demote_active(keys, target, now);
                    self.transition(keys, target, KeyStatus::Active, now, "activated by rotation")?;
                }
                KeyStatus::Active => {}
                other => {
                    return Err(CryptoError::InvalidTransition {
                        key_id: target.to_owned(),
                        from: other,
                        to: KeyStatus::Active,
                    })
                }
            }

            let rotating: Vec<String> = keys
                .iter()
                .filter(|(id, e)| e.record.status == KeyStatus::Rotating && id.as_str() != target)
                .map(|(id, _)| id.clone())
                .collect();
            let note = format!("rotation to {target} complete");
            for id in &rotating {
                self.transition(keys, id, KeyStatus::Retired, now, &note)?;
            }
            Ok(rotating)
        })?;
        info!(target_key_id = target, retired = ?retired, "rotation committed to registry");
        Ok(retired)
    }

    /// Expire Retired keys whose `expires_at` is at or before `now`.
    ///
    /// Keys decrypted with since retirement are reported in
    /// [`ExpiryReport::still_in_use`] and left Retired unless `force`.
    pub fn expire_due(&self, now: DateTime<Utc>, force: bool) -> Result<ExpiryReport, CryptoError> {
        let report = self.commit(|keys, at| {
            let mut report = ExpiryReport::default();
            let due: Vec<(String, bool)> = keys
                .iter()
                .filter(|(_, e)| {
                    e.record.status == KeyStatus::Retired
                        && e.record.expires_at.is_some_and(|t| t <= now)
                })
                .map(|(id, e)| (id.clone(), e.materialize().used_since_retirement()))
                .collect();

            for (id, in_use) in due {
                if in_use && !force {
                    warn!(key_id = %id, "retired key still in use; not expiring");
                    report.still_in_use.push(id);
                    continue;
                }
                let note = if in_use {
                    "expired (forced while still in use)"
                } else {
                    "expired"
                };
                self.transition(keys, &id, KeyStatus::Expired, at, note)?;
                report.expired.push(id);
            }
            Ok(report)
        })?;
        if !report.expired.is_empty() {
            info!(expired = ?report.expired, "keys expired");
        }
        Ok(report)
    }

    /// Audited backward transition: put a Rotating or Retired key back into
    /// service, demoting the current Active key to Rotating.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidTransition`] when reactivation is disabled or the
    /// key is in any other state, [`CryptoError::KeyExpired`] for Expired keys,
    /// and [`CryptoError::Configuration`] for an empty `reason`.
    pub fn reactivate_key(&self, key_id: &str, reason: &str) -> Result<(), CryptoError> {
        if reason.trim().is_empty() {
            return Err(CryptoError::Configuration(
                "reactivation requires a reason for the audit trail".into(),
            ));
        }
        self.commit(|keys, now| {
            let status = status_in(keys, key_id)?;
            match status {
                KeyStatus::Expired => return Err(CryptoError::KeyExpired(key_id.to_owned())),
                KeyStatus::Rotating | KeyStatus::Retired if self.policy.allow_reactivation => {}
                _ => {
                    return Err(CryptoError::InvalidTransition {
                        key_id: key_id.to_owned(),
                        from: status,
                        to: KeyStatus::Active,
                    })
                }
            }
            demote_active(keys, key_id, now);
            let entry = keys
                .get_mut(key_id)
                .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_owned()))?;
            entry.record.status = KeyStatus::Active;
            entry.record.activated_at = Some(now);
            entry.record.retired_at = None;
            entry.record.expires_at = None;
            entry.record.usage_at_retirement = None;
            entry
                .record
                .note(now, format!("REACTIVATED from {status}: {}", reason.trim()));
            Ok(())
        })?;
        warn!(key_id, reason, "key reactivated");
        Ok(())
    }

    /// Every key record, with current usage counters.
    pub fn key_status(&self) -> Vec<KeyRecord> {
        self.snapshot.load().records()
    }

    pub fn status_of(&self, key_id: &str) -> Option<KeyStatus> {
        self.snapshot
            .load()
            .keys
            .get(key_id)
            .map(|e| e.record.status)
    }

    /// Persist the in-memory usage counters.
    pub fn flush_usage(&self) -> Result<(), CryptoError> {
        self.commit(|_, _| Ok(()))
    }

    /// Serialize a mutation: clone, mutate, validate, persist, swap.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, KeyEntry>, DateTime<Utc>) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| CryptoError::Storage("registry writer lock poisoned".into()))?;
        let mut draft = self.snapshot.load().keys.clone();
        let out = mutate(&mut draft, Utc::now())?;
        let next = Snapshot::build(draft)?;
        self.store.save(&next.records())?;
        self.snapshot.store(Arc::new(next));
        Ok(out)
    }

    fn transition(
        &self,
        keys: &mut BTreeMap<String, KeyEntry>,
        key_id: &str,
        to: KeyStatus,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), CryptoError> {
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_owned()))?;
        let from = entry.record.status;
        if !from.can_transition_to(to) {
            return Err(CryptoError::InvalidTransition {
                key_id: key_id.to_owned(),
                from,
                to,
            });
        }
        entry.record.status = to;
        match to {
            KeyStatus::Active => entry.record.activated_at = Some(now),
            KeyStatus::Retired => {
                entry.record.retired_at = Some(now);
                entry.record.expires_at = Some(now + self.policy.retention);
                entry.record.usage_at_retirement = Some(entry.usage.load(Ordering::Relaxed));
            }
            _ => {}
        }
        entry.record.note(now, format!("{from} -> {to}: {reason}"));
        Ok(())
    }
}

fn status_in(keys: &BTreeMap<String, KeyEntry>, key_id: &str) -> Result<KeyStatus, CryptoError> {
    keys.get(key_id)
        .map(|e| e.record.status)
        .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_owned()))
}

/// Demote whichever key other than `successor` is Active to Rotating.
fn demote_active(
    keys: &mut BTreeMap<String, KeyEntry>,
    successor: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    let prior = keys
        .iter()
        .find(|(id, e)| e.record.status == KeyStatus::Active && id.as_str() != successor)
        .map(|(id, _)| id.clone());
    if let Some(id) = &prior {
        if let Some(entry) = keys.get_mut(id) {
            entry.record.status = KeyStatus::Rotating;
            entry
                .record
                .note(now, format!("active -> rotating: superseded by {successor}"));
        }
    }
    prior
}

/// `key_YYYYmmdd_HHMMSS_xxxx` with four random hex characters.
fn generate_key_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("key_{}_{}", now.format("%Y%m%d_%H%M%S"), &random[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterSecret;

    fn kdf(seed: u8) -> KeyDerivation {
        KeyDerivation::new(MasterSecret::from_bytes(vec![seed; 32]).unwrap())
    }

    fn registry_with(store: Arc<dyn KeyStore>, policy: LifecyclePolicy) -> KeyRegistry {
        KeyRegistry::open(store, kdf(1), policy).unwrap()
    }

    fn registry() -> KeyRegistry {
        registry_with(Arc::new(MemoryKeyStore::new()), LifecyclePolicy::default())
    }

    fn active_count(reg: &KeyRegistry) -> usize {
        reg.key_status()
            .iter()
            .filter(|r| r.status == KeyStatus::Active)
            .count()
    }

    #[test]
    fn generated_ids_are_valid_and_shaped() {
        let id = generate_key_id(Utc::now());
        assert!(id.starts_with("key_"));
        assert_eq!(id.len(), "key_20250927_153045_b7c2".len());
        assert!(is_valid_key_id(&id));
    }

    #[test]
    fn no_active_key_initially() {
        let reg = registry();
        assert!(matches!(reg.active_key(), Err(CryptoError::NoActiveKey)));
    }

    #[test]
    fn create_then_activate() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        assert_eq!(k1.status, KeyStatus::Pending);
        reg.activate_key(&k1.key_id).unwrap();
        assert_eq!(reg.active_key().unwrap().key_id, k1.key_id);
        assert_eq!(active_count(&reg), 1);
    }

    #[test]
    fn activating_replacement_demotes_prior() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.activate_key(&k2.key_id).unwrap();
        assert_eq!(reg.status_of(&k1.key_id), Some(KeyStatus::Rotating));
        assert_eq!(reg.status_of(&k2.key_id), Some(KeyStatus::Active));
        assert_eq!(active_count(&reg), 1);
    }

    #[test]
    fn backward_transitions_rejected() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let err = reg.activate_key(&k1.key_id).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidTransition { .. }));
        assert!(matches!(
            reg.activate_key("key_missing"),
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[test]
    fn lookup_policy_by_status() {
        let store = Arc::new(MemoryKeyStore::new());
        let reg = registry_with(store, LifecyclePolicy {
            retention: Duration::zero(),
            allow_reactivation: false,
        });
        let k1 = reg.create_key().unwrap();
        assert!(reg.lookup(&k1.key_id).is_ok(), "pending keys are readable");
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.complete_rotation(&k2.key_id).unwrap();
        assert_eq!(reg.status_of(&k1.key_id), Some(KeyStatus::Retired));
        assert!(reg.lookup(&k1.key_id).is_ok(), "retired keys are readable");

        let report = reg.expire_due(Utc::now(), true).unwrap();
        assert_eq!(report.expired, vec![k1.key_id.clone()]);
        assert!(matches!(
            reg.lookup(&k1.key_id),
            Err(CryptoError::KeyExpired(_))
        ));
        assert!(matches!(
            reg.lookup("key_unknown"),
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[test]
    fn lookup_counts_usage() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.lookup(&k1.key_id).unwrap();
        reg.lookup(&k1.key_id).unwrap();
        let rec = reg
            .key_status()
            .into_iter()
            .find(|r| r.key_id == k1.key_id)
            .unwrap();
        assert_eq!(rec.usage_counter, 2);
    }

    #[test]
    fn complete_rotation_retires_rotating_and_prior_active() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.activate_key(&k2.key_id).unwrap();
        let k3 = reg.create_key().unwrap();

        let retired = reg.complete_rotation(&k3.key_id).unwrap();
        assert_eq!(retired.len(), 2);
        assert_eq!(reg.status_of(&k1.key_id), Some(KeyStatus::Retired));
        assert_eq!(reg.status_of(&k2.key_id), Some(KeyStatus::Retired));
        assert_eq!(reg.status_of(&k3.key_id), Some(KeyStatus::Active));

        let k1_rec = reg
            .key_status()
            .into_iter()
            .find(|r| r.key_id == k1.key_id)
            .unwrap();
        assert!(k1_rec.retired_at.is_some());
        assert!(k1_rec.expires_at.is_some());
    }

    #[test]
    fn complete_rotation_rejects_retired_target() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.complete_rotation(&k2.key_id).unwrap();
        assert!(matches!(
            reg.complete_rotation(&k1.key_id),
            Err(CryptoError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn expiry_holds_back_keys_still_in_use() {
        let reg = registry_with(Arc::new(MemoryKeyStore::new()), LifecyclePolicy {
            retention: Duration::zero(),
            allow_reactivation: false,
        });
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.complete_rotation(&k2.key_id).unwrap();

        reg.lookup(&k1.key_id).unwrap();
        let report = reg.expire_due(Utc::now(), false).unwrap();
        assert_eq!(report.still_in_use, vec![k1.key_id.clone()]);
        assert_eq!(reg.status_of(&k1.key_id), Some(KeyStatus::Retired));
    }

    #[test]
    fn expiry_waits_for_expires_at() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.complete_rotation(&k2.key_id).unwrap();
        let report = reg.expire_due(Utc::now(), false).unwrap();
        assert!(report.expired.is_empty());
        let later = Utc::now() + Duration::days(91);
        let report = reg.expire_due(later, false).unwrap();
        assert_eq!(report.expired, vec![k1.key_id]);
    }

    #[test]
    fn reactivation_disabled_by_default() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.complete_rotation(&k2.key_id).unwrap();
        assert!(matches!(
            reg.reactivate_key(&k1.key_id, "undo operator mistake"),
            Err(CryptoError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reactivation_is_audited_when_enabled() {
        let reg = registry_with(Arc::new(MemoryKeyStore::new()), LifecyclePolicy {
            retention: Duration::days(90),
            allow_reactivation: true,
        });
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();
        let k2 = reg.create_key().unwrap();
        reg.complete_rotation(&k2.key_id).unwrap();

        assert!(reg.reactivate_key(&k1.key_id, "  ").is_err());
        reg.reactivate_key(&k1.key_id, "undo operator mistake").unwrap();
        assert_eq!(reg.status_of(&k1.key_id), Some(KeyStatus::Active));
        assert_eq!(reg.status_of(&k2.key_id), Some(KeyStatus::Rotating));
        assert_eq!(active_count(&reg), 1);
        let rec = reg
            .key_status()
            .into_iter()
            .find(|r| r.key_id == k1.key_id)
            .unwrap();
        assert!(rec
            .rotation_notes
            .last()
            .unwrap()
            .message
            .contains("REACTIVATED"));
    }

    #[test]
    fn open_rejects_two_active_keys() {
        let k = kdf(1);
        let mut a = KeyRecord::pending("key_a", k.derive("key_a").unwrap().fingerprint(), Utc::now());
        let mut b = KeyRecord::pending("key_b", k.derive("key_b").unwrap().fingerprint(), Utc::now());
        a.status = KeyStatus::Active;
        b.status = KeyStatus::Active;
        let store = Arc::new(MemoryKeyStore::with_records(vec![a, b]));
        assert!(matches!(
            KeyRegistry::open(store, kdf(1), LifecyclePolicy::default()),
            Err(CryptoError::Configuration(_))
        ));
    }

    #[test]
    fn open_rejects_changed_master_secret() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let reg = KeyRegistry::open(store.clone(), kdf(1), LifecyclePolicy::default()).unwrap();
        reg.create_key().unwrap();
        assert!(matches!(
            KeyRegistry::open(store, kdf(2), LifecyclePolicy::default()),
            Err(CryptoError::Configuration(_))
        ));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let k1 = {
            let reg = registry_with(Arc::new(FileKeyStore::new(&path)), LifecyclePolicy::default());
            let k1 = reg.create_key().unwrap();
            reg.activate_key(&k1.key_id).unwrap();
            reg.lookup(&k1.key_id).unwrap();
            reg.flush_usage().unwrap();
            k1
        };
        let reg = registry_with(Arc::new(FileKeyStore::new(&path)), LifecyclePolicy::default());
        assert_eq!(reg.active_key().unwrap().key_id, k1.key_id);
        assert_eq!(reg.key_status()[0].usage_counter, 1);
    }

    #[test]
    fn readers_never_see_zero_or_two_active() {
        let reg = registry();
        let k1 = reg.create_key().unwrap();
        reg.activate_key(&k1.key_id).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        assert!(reg.active_key().is_ok());
                        assert!(active_count(&reg) <= 1);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..20 {
                    let k = reg.create_key().unwrap();
                    reg.activate_key(&k.key_id).unwrap();
                }
            });
        });
        assert_eq!(active_count(&reg), 1);
    }
}
