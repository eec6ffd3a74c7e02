//! Per-record claims so concurrent rotation workers never process the same
//! record at the same time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared set of record ids currently being processed.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

/// Releases its ids when dropped.
#[derive(Debug)]
pub struct ClaimGuard {
    set: ClaimSet,
    ids: Vec<String>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every id in `ids`, or none of them.
    ///
    /// Returns the first id already held by someone else on conflict.
    pub fn try_claim(&self, ids: &[String]) -> Result<ClaimGuard, String> {
        let mut held = self.lock();
        if let Some(taken) = ids.iter().find(|id| held.contains(*id)) {
            return Err(taken.clone());
        }
        held.extend(ids.iter().cloned());
        Ok(ClaimGuard {
            set: self.clone(),
            ids: ids.to_vec(),
        })
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut held = self.set.lock();
        for id in &self.ids {
            held.remove(id);
        }
    }
}
