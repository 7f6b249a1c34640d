//! Run one saved script on many hosts and track the aggregate outcome.

pub mod compat;

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::HostqError;
use crate::scripts::validation;
use crate::state::backend::StateBackend;
use crate::state::models::{BatchHostPlan, BatchHostResult, BatchSummary, HostId};

pub struct BatchCoordinator {
    backend: Arc<dyn StateBackend>,
}

impl BatchCoordinator {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Enqueue `script_id` on every compatible host. Incompatible hosts get
    /// a recorded error instead of an execution. Hosts outside the script's
    /// team reject the whole batch.
    pub async fn execute_on_hosts(
        &self,
        script_id: i64,
        host_ids: &[HostId],
        requester: Option<&str>,
    ) -> Result<String> {
        let unique: BTreeSet<HostId> = host_ids.iter().copied().collect();
        if unique.is_empty() {
            return Err(HostqError::validation("a batch needs at least one host").into());
        }

        let script = self.backend.get_script(script_id).await?;
        let kind = validation::validate_script_name(&script.name)?;

        let mut plans = Vec::with_capacity(unique.len());
        for host_id in unique {
            let host = self
                .backend
                .get_host(host_id)
                .await
                .with_context(|| format!("load batch target {}", host_id))?;
            if host.team_id != script.team_id {
                return Err(HostqError::validation(format!(
                    "host {} is not on the same team as script '{}'",
                    host_id, script.name
                ))
                .into());
            }
            let error = compat::preflight(&host, kind);
            if let Some(reason) = error {
                tracing::debug!(host_id, reason, "Host rejected by batch pre-flight");
            }
            plans.push(BatchHostPlan {
                host_id,
                error: error.map(String::from),
            });
        }

        let batch_id = self
            .backend
            .batch_execute_script(script.id, &plans, requester)
            .await
            .with_context(|| format!("batch run of script {}", script_id))?;
        tracing::info!(
            batch_id = %batch_id,
            script_id,
            targeted = plans.len(),
            rejected = plans.iter().filter(|p| p.error.is_some()).count(),
            "Started batch execution"
        );
        Ok(batch_id)
    }

    pub async fn summary(&self, batch_id: &str) -> Result<BatchSummary> {
        self.backend.batch_summary(batch_id).await
    }

    pub async fn host_results(&self, batch_id: &str) -> Result<Vec<BatchHostResult>> {
        self.backend.batch_host_results(batch_id).await
    }
}
