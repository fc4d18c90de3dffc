//! In-memory instance store
//!
//! Records are held per (account, instance) key in a `DashMap`. Each key keeps
//! every incarnation in creation order so stopped records stay queryable.
//! Mutations go through the map's entry lock, which serializes writers of
//! the same key.

use super::InstanceStore;
use crate::error::StoreError;
use crate::models::{InstanceRecord, InstanceState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    account_id: String,
    instance_id: String,
}

impl InstanceKey {
    fn new(account_id: &str, instance_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

/// `DashMap`-backed [`InstanceStore`]
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    records: DashMap<InstanceKey, Vec<InstanceRecord>>,
    next_record_id: AtomicU64,
    /// Simulated outage, every call fails with `Unavailable` while set
    unavailable: AtomicBool,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored incarnations across all keys
    pub fn len(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All incarnations of one key, oldest first
    #[cfg(test)]
    pub(crate) fn history(&self, account_id: &str, instance_id: &str) -> Vec<InstanceRecord> {
        self.records
            .get(&InstanceKey::new(account_id, instance_id))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create_if_absent(&self, mut record: InstanceRecord) -> Result<bool, StoreError> {
        self.check_available()?;

        let key = InstanceKey::new(&record.account_id, &record.instance_id);
        let mut incarnations = self.records.entry(key).or_default();

        if incarnations.iter().any(|r| r.instance_state.is_active()) {
            debug!(
                account_id = %record.account_id,
                instance_id = %record.instance_id,
                "Active record already present, skipping create"
            );
            return Ok(false);
        }

        record.record_id = self.next_record_id.fetch_add(1, Ordering::SeqCst) + 1;
        record.version = 0;
        incarnations.push(record);
        Ok(true)
    }

    async fn fetch_active(
        &self,
        account_id: &str,
        instance_id: &str,
        states: &[InstanceState],
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.check_available()?;

        Ok(self
            .records
            .get(&InstanceKey::new(account_id, instance_id))
            .and_then(|entry| {
                entry
                    .value()
                    .iter()
                    .rev()
                    .find(|r| states.contains(&r.instance_state))
                    .cloned()
            }))
    }

    async fn fetch(
        &self,
        account_id: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.check_available()?;

        Ok(self
            .records
            .get(&InstanceKey::new(account_id, instance_id))
            .and_then(|entry| entry.value().last().cloned()))
    }

    async fn fetch_active_by_name(
        &self,
        account_id: &str,
        cluster_id: &str,
        instance_name: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.check_available()?;

        Ok(self.records.iter().find_map(|entry| {
            entry
                .value()
                .iter()
                .find(|r| {
                    r.account_id == account_id
                        && r.cluster_id == cluster_id
                        && r.instance_name == instance_name
                        && r.instance_state.is_active()
                })
                .cloned()
        }))
    }

    async fn update_state(
        &self,
        record: &InstanceRecord,
        timestamp: DateTime<Utc>,
        new_state: InstanceState,
    ) -> Result<InstanceRecord, StoreError> {
        self.check_available()?;

        let conflict = || StoreError::ConcurrentConflict {
            account_id: record.account_id.clone(),
            instance_id: record.instance_id.clone(),
            expected_state: record.instance_state,
            expected_version: record.version,
        };

        let key = InstanceKey::new(&record.account_id, &record.instance_id);
        let mut incarnations = match self.records.entry(key) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(_) => return Err(conflict()),
        };

        let stored = incarnations
            .iter_mut()
            .find(|r| r.record_id == record.record_id)
            .ok_or_else(conflict)?;

        if stored.instance_state != record.instance_state || stored.version != record.version {
            return Err(conflict());
        }

        match new_state {
            InstanceState::Running => stored.usage_start_time = Some(timestamp),
            InstanceState::Stopped => stored.usage_stop_time = Some(timestamp),
            InstanceState::Initializing => {}
        }
        stored.instance_state = new_state;
        stored.version += 1;

        Ok(stored.clone())
    }

    async fn fetch_active_at_time(
        &self,
        account_id: &str,
        setting_id: &str,
        cluster_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        self.check_available()?;

        let ids = self
            .records
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|r| {
                r.account_id == account_id
                    && r.setting_id == setting_id
                    && r.cluster_id == cluster_id
                    && r.instance_state.is_active()
                    && r.active_since() <= as_of
            })
            .map(|r| r.instance_id)
            .collect();

        Ok(ids)
    }
}
