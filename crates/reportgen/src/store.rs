//! Request repository abstraction.
//!
//! Every mutation is a single atomic unit against one request record:
//! `update` runs its closure while the record is locked, so concurrent
//! read-modify-write cycles on the same request never lose updates.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::report::ReportRequest;

/// Keyed store of report requests.
pub trait RequestStore: Send + Sync {
    /// Persists a new request. Fails with `DuplicateId` if the id exists.
    fn insert(&self, request: &ReportRequest) -> Result<(), StoreError>;

    fn find_by_id(&self, id: &str) -> Result<Option<ReportRequest>, StoreError>;

    /// All requests in insertion order.
    fn list(&self) -> Result<Vec<ReportRequest>, StoreError>;

    /// Loads, mutates and persists one request atomically.
    ///
    /// `mutate` returns whether it changed anything; unchanged records are
    /// not written back. Returns `None` when the id is unknown, in which case
    /// `mutate` is never called.
    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut ReportRequest) -> bool,
    ) -> Result<Option<ReportRequest>, StoreError>;

    /// Removes the request and both sub-reports. Returns false if absent.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Records {
    by_id: HashMap<String, ReportRequest>,
    order: Vec<String>,
}

/// Process-local store, used for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryRequestStore {
    records: RwLock<Records>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Request store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Request store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl RequestStore for InMemoryRequestStore {
    fn insert(&self, request: &ReportRequest) -> Result<(), StoreError> {
        let mut records = self.write();
        if records.by_id.contains_key(&request.id) {
            return Err(StoreError::DuplicateId(request.id.clone()));
        }
        records.order.push(request.id.clone());
        records.by_id.insert(request.id.clone(), request.clone());
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<ReportRequest>, StoreError> {
        Ok(self.read().by_id.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<ReportRequest>, StoreError> {
        let records = self.read();
        Ok(records
            .order
            .iter()
            .filter_map(|id| records.by_id.get(id).cloned())
            .collect())
    }

    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut ReportRequest) -> bool,
    ) -> Result<Option<ReportRequest>, StoreError> {
        let mut records = self.write();
        let Some(stored) = records.by_id.get_mut(id) else {
            return Ok(None);
        };

        // Mutate a copy so a panicking closure cannot leave a half-applied record.
        let mut working = stored.clone();
        if mutate(&mut working) {
            *stored = working.clone();
        }
        Ok(Some(working))
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.write();
        if records.by_id.remove(id).is_none() {
            return Ok(false);
        }
        records.order.retain(|existing| existing != id);
        Ok(true)
    }
}
