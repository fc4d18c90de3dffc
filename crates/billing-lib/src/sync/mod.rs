//! Sync reconciliation
//!
//! Periodic snapshots list the instances a collector currently sees as
//! active. Instances the store still believes active at the snapshot time but
//! that are missing from the snapshot lost their STOP somewhere upstream; the
//! reconciler synthesizes that STOP and feeds it through the lifecycle handler.

mod reconciler;
mod snapshot;

#[cfg(test)]
mod tests;

pub use reconciler::{ReconcileReport, SyncReconciler};
pub use snapshot::{EcsSyncSnapshot, K8sSyncSnapshot, SyncSnapshot};
