//! Workload identity map.
//!
//! Associates a logical application id with the image it runs and the
//! network address the runtime assigned to it. Entries are created when a
//! start is requested, get their address once the instance is observed
//! running, and are dropped when a stop is confirmed.
//!
//! Lifecycle operations on one application id are serialized: callers take
//! an [`IdentityGuard`] for the id and perform their whole
//! read-run-write sequence while holding it. Operations on different ids
//! proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Runtime identity assigned to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub app_id: String,
    pub image_name: String,
    /// Empty until the runtime reports an address.
    pub ip_address: String,
}

impl WorkloadIdentity {
    pub fn new(app_id: impl Into<String>, image_name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            image_name: image_name.into(),
            ip_address: String::new(),
        }
    }

    pub fn has_address(&self) -> bool {
        !self.ip_address.is_empty()
    }
}

/// Identities keyed by application id.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: Mutex<HashMap<String, WorkloadIdentity>>,
    /// Per-id operation locks. An entry lives while an identity exists for
    /// the id or a caller holds or awaits its lock.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the exclusive section for an application id.
    pub async fn lock(&self, app_id: &str) -> IdentityGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(app_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        IdentityGuard {
            map: self,
            app_id: app_id.to_string(),
            section: lock.lock_owned().await,
        }
    }

    /// Insert or replace an identity.
    pub async fn register(&self, identity: WorkloadIdentity) -> Option<WorkloadIdentity> {
        let guard = self.lock(&identity.app_id).await;
        guard.insert(identity)
    }

    /// Point-in-time copy of an identity.
    pub fn get(&self, app_id: &str) -> Option<WorkloadIdentity> {
        self.entries.lock().get(app_id).cloned()
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.entries.lock().contains_key(app_id)
    }

    /// All identities, sorted by application id.
    pub fn snapshot(&self) -> Vec<WorkloadIdentity> {
        let mut identities: Vec<_> = self.entries.lock().values().cloned().collect();
        identities.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        identities
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of ids with a live operation lock.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Exclusive access to one application id's identity.
pub struct IdentityGuard<'a> {
    map: &'a IdentityMap,
    app_id: String,
    section: OwnedMutexGuard<()>,
}

impl IdentityGuard<'_> {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn identity(&self) -> Option<WorkloadIdentity> {
        self.map.get(&self.app_id)
    }

    pub fn insert(&self, mut identity: WorkloadIdentity) -> Option<WorkloadIdentity> {
        identity.app_id = self.app_id.clone();
        self.map
            .entries
            .lock()
            .insert(self.app_id.clone(), identity)
    }

    /// Store the observed address. Returns false if there is no entry.
    pub fn set_address(&self, address: &str) -> bool {
        match self.map.entries.lock().get_mut(&self.app_id) {
            Some(identity) => {
                identity.ip_address = address.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self) -> Option<WorkloadIdentity> {
        self.map.entries.lock().remove(&self.app_id)
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        // Callers clone the lock under `locks` before awaiting it, so a count
        // of two (map plus this guard) means nobody else wants this id.
        let mut locks = self.map.locks.lock();
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.section)) == 2
            && !self.map.entries.lock().contains_key(&self.app_id)
        {
            locks.remove(&self.app_id);
        }
    }
}
