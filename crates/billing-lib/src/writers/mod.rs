//! Resource-type writers
//!
//! Each writer turns an "instance observed" event for one resource kind into
//! an `INITIALIZING` instance record:
//! - node: Kubernetes nodes and EC2 hosts
//! - container instance: ECS container instances, enriched from their EC2 host
//! - task: ECS tasks, enriched from their container instance (EC2 launch type)
//! - pod: Kubernetes pods, enriched from the node they are scheduled on
//!
//! Writers are idempotent: an event for an instance that already has an
//! active record is a no-op.

mod container_instance;
mod node;
mod pod;
mod task;


pub use container_instance::{write_container_instance_info, ContainerInstanceInfo};
pub use node::{write_node_info, NodeInfo};
pub use pod::{write_pod_info, PodInfo};
pub use task::{write_task_info, LaunchType, TaskInfo};

use crate::error::{LookupError, StoreError};
use crate::models::{InstanceRecord, InstanceState, ServiceReference};
use crate::observability::StructuredLogger;
use crate::store::InstanceStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves a deployed service for a workload running in a cluster
#[async_trait]
pub trait ServiceLinkageLookup: Send + Sync {
    async fn resolve(
        &self,
        account_id: &str,
        cluster_id: &str,
        service_name: &str,
    ) -> Result<Option<ServiceReference>, LookupError>;
}

/// Lookup that never finds a service
#[derive(Debug, Clone, Copy, Default)]
pub struct NoServiceLinkage;

#[async_trait]
impl ServiceLinkageLookup for NoServiceLinkage {
    async fn resolve(
        &self,
        _account_id: &str,
        _cluster_id: &str,
        _service_name: &str,
    ) -> Result<Option<ServiceReference>, LookupError> {
        Ok(None)
    }
}

/// Lookup backed by a fixed deployment-key table
#[derive(Debug, Clone, Default)]
pub struct StaticServiceLinkage {
    services: HashMap<(String, String, String), ServiceReference>,
}

impl StaticServiceLinkage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its deployment key
    pub fn with_service(
        mut self,
        account_id: impl Into<String>,
        cluster_id: impl Into<String>,
        service: ServiceReference,
    ) -> Self {
        let key = (account_id.into(), cluster_id.into(), service.service_name.clone());
        self.services.insert(key, service);
        self
    }
}

#[async_trait]
impl ServiceLinkageLookup for StaticServiceLinkage {
    async fn resolve(
        &self,
        account_id: &str,
        cluster_id: &str,
        service_name: &str,
    ) -> Result<Option<ServiceReference>, LookupError> {
        let key = (
            account_id.to_string(),
            cluster_id.to_string(),
            service_name.to_string(),
        );
        Ok(self.services.get(&key).cloned())
    }
}

/// Result of a writer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// An active record already existed (duplicate sighting or lost create race)
    AlreadyActive,
}

/// Dependencies shared by all resource-type writers
#[derive(Clone)]
pub struct WriterContext {
    pub(crate) store: Arc<dyn InstanceStore>,
    service_lookup: Arc<dyn ServiceLinkageLookup>,
    pub(crate) logger: StructuredLogger,
}

impl WriterContext {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        service_lookup: Arc<dyn ServiceLinkageLookup>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            service_lookup,
            logger,
        }
    }

    /// Whether an active record already exists for the key
    pub(crate) async fn is_active(
        &self,
        account_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .store
            .fetch_active(account_id, instance_id, &InstanceState::ACTIVE)
            .await?
            .is_some())
    }

    /// Resolve service linkage; lookup failures are logged and treated as no match
    pub(crate) async fn resolve_service(
        &self,
        account_id: &str,
        cluster_id: &str,
        service_name: Option<&str>,
    ) -> Option<ServiceReference> {
        let service_name = service_name?;
        match self
            .service_lookup
            .resolve(account_id, cluster_id, service_name)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    cluster_id = %cluster_id,
                    service_name = %service_name,
                    error = %e,
                    "Service linkage lookup failed, continuing without linkage"
                );
                None
            }
        }
    }

    /// Insert the record unless another writer got there first
    pub(crate) async fn persist(&self, record: InstanceRecord) -> Result<WriteOutcome, StoreError> {
        let account_id = record.account_id.clone();
        let instance_id = record.instance_id.clone();
        let instance_type = record.instance_type;

        if self.store.create_if_absent(record).await? {
            debug!(
                account_id = %account_id,
                instance_id = %instance_id,
                instance_type = %instance_type,
                "Created instance record"
            );
            Ok(WriteOutcome::Created)
        } else {
            Ok(WriteOutcome::AlreadyActive)
        }
    }
}
