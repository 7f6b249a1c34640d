//! Per-host activity queue.
//!
//! Each host has an ordered list of pending activities. At most one is
//! activated (handed to the host) at a time; the rest wait in priority
//! order, FIFO within a priority.

pub mod payload;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::state::backend::StateBackend;
use crate::state::models::{
    Activity, ActivityFilter, CanceledActivity, CompletedActivity, HostId, NewActivity,
};

pub struct ActivityQueue {
    backend: Arc<dyn StateBackend>,
}

impl ActivityQueue {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Append an activity to the host's queue. It stays queued until
    /// [`ActivityQueue::activate_next`] picks it.
    pub async fn enqueue(&self, activity: NewActivity) -> Result<Activity> {
        let script = payload::validate(activity.activity_type, &activity.payload)?;
        self.backend
            .enqueue_activity(&activity, script.as_ref())
            .await
            .with_context(|| format!("enqueue {} for host {}", activity.activity_type, activity.host_id))
    }

    /// Activate the head of the host's queue if nothing is activated.
    pub async fn activate_next(&self, host_id: HostId) -> Result<Option<Activity>> {
        self.backend.activate_next(host_id).await
    }

    /// Activate across many hosts, each in its own transaction.
    pub async fn activate_next_for_hosts(&self, host_ids: &[HostId]) -> Result<usize> {
        self.backend.activate_next_for_hosts(host_ids).await
    }

    pub async fn cancel(&self, host_id: HostId, execution_id: &str) -> Result<CanceledActivity> {
        self.backend
            .cancel_activity(host_id, execution_id)
            .await
            .with_context(|| format!("cancel {} on host {}", execution_id, host_id))
    }

    /// Report that the host finished its activated install or MDM command.
    /// Repeated reports are no-ops.
    pub async fn complete(&self, host_id: HostId, execution_id: &str) -> Result<CompletedActivity> {
        self.backend
            .complete_activity(host_id, execution_id)
            .await
            .with_context(|| format!("complete {} on host {}", execution_id, host_id))
    }

    /// Everything pending for the host, activated first.
    pub async fn list_pending(&self, host_id: HostId) -> Result<Vec<Activity>> {
        self.backend
            .list_activities(host_id, &ActivityFilter::all_pending())
            .await
    }

    /// Only the activated activity, if any.
    pub async fn list_ready(&self, host_id: HostId) -> Result<Vec<Activity>> {
        self.backend
            .list_activities(host_id, &ActivityFilter::ready_to_execute())
            .await
    }

    pub async fn list(&self, host_id: HostId, filter: &ActivityFilter) -> Result<Vec<Activity>> {
        self.backend.list_activities(host_id, filter).await
    }
}
