//! Instance state store
//!
//! Keyed persistence for instance records. Every writer reads through the
//! [`InstanceStore`] trait; only the lifecycle handler changes
//! `instance_state`, and it does so through the conditional
//! [`InstanceStore::update_state`].

mod memory;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryInstanceStore;

use crate::error::StoreError;
use crate::models::{InstanceRecord, InstanceState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Keyed persistence for instance records.
///
/// ## Concurrency
///
/// `create_if_absent` is atomic per (account, instance) key: the first writer
/// wins and later calls return `Ok(false)` while an active record exists.
///
/// `update_state` is a conditional write. It only succeeds if the stored
/// incarnation still has the state and version of the `record` passed in,
/// and returns [`StoreError::ConcurrentConflict`] otherwise.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert `record` unless an active record exists for its key.
    ///
    /// The store assigns `record_id` and resets `version`. Returns `true` when
    /// the record was inserted.
    async fn create_if_absent(&self, record: InstanceRecord) -> Result<bool, StoreError>;

    /// Fetch the record for the key whose state is one of `states`
    async fn fetch_active(
        &self,
        account_id: &str,
        instance_id: &str,
        states: &[InstanceState],
    ) -> Result<Option<InstanceRecord>, StoreError>;

    /// Fetch the latest incarnation for the key in any state
    async fn fetch(
        &self,
        account_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, StoreError>;

    /// Fetch the active record with the given instance name in a cluster
    async fn fetch_active_by_name(
        &self,
        account_id: &str,
        cluster_id: &str,
        instance_name: &str,
    ) -> Result<Option<InstanceRecord>, StoreError>;

    /// Move `record` to `new_state`, stamping usage start/stop with `timestamp`.
    ///
    /// Returns the stored record after the update.
    async fn update_state(
        &self,
        record: &InstanceRecord,
        timestamp: DateTime<Utc>,
        new_state: InstanceState,
    ) -> Result<InstanceRecord, StoreError>;

    /// Ids of records in the cluster that were active at `as_of`
    async fn fetch_active_at_time(
        &self,
        account_id: &str,
        setting_id: &str,
        cluster_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError>;
}
