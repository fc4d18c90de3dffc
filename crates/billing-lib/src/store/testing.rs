//! Store wrappers for exercising conflict handling

use super::{InMemoryInstanceStore, InstanceStore};
use crate::error::StoreError;
use crate::models::{InstanceRecord, InstanceState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rejects the first `conflicts` conditional updates with
/// `ConcurrentConflict`, then delegates to an in-memory store
pub(crate) struct ConflictingStore {
    pub(crate) inner: InMemoryInstanceStore,
    remaining: AtomicUsize,
    update_calls: AtomicUsize,
}

impl ConflictingStore {
    pub(crate) fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryInstanceStore::new(),
            remaining: AtomicUsize::new(conflicts),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Every update conflicts
    pub(crate) fn always() -> Self {
        Self::new(usize::MAX)
    }

    pub(crate) fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceStore for ConflictingStore {
    async fn create_if_absent(&self, record: InstanceRecord) -> Result<bool, StoreError> {
        self.inner.create_if_absent(record).await
    }

    async fn fetch_active(
        &self,
        account_id: &str,
        instance_id: &str,
        states: &[InstanceState],
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.inner.fetch_active(account_id, instance_id, states).await
    }

    async fn fetch(
        &self,
        account_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.inner.fetch(account_id, instance_id).await
    }

    async fn fetch_active_by_name(
        &self,
        account_id: &str,
        cluster_id: &str,
        instance_name: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.inner
            .fetch_active_by_name(account_id, cluster_id, instance_name)
            .await
    }

    async fn update_state(
        &self,
        record: &InstanceRecord,
        timestamp: DateTime<Utc>,
        new_state: InstanceState,
    ) -> Result<InstanceRecord, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let conflicted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(StoreError::ConcurrentConflict {
                account_id: record.account_id.clone(),
                instance_id: record.instance_id.clone(),
                expected_state: record.instance_state,
                expected_version: record.version,
            });
        }
        self.inner.update_state(record, timestamp, new_state).await
    }

    async fn fetch_active_at_time(
        &self,
        account_id: &str,
        setting_id: &str,
        cluster_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        self.inner
            .fetch_active_at_time(account_id, setting_id, cluster_id, as_of)
            .await
    }
}
