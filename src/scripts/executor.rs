use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::content::truncate_output;
use super::validation::{self, MAX_INLINE_SCRIPT_CHARS};
use crate::config::types::Settings;
use crate::error::{is_not_found, HostqError};
use crate::state::backend::StateBackend;
use crate::state::models::{
    Activity, ActivityFilter, CorrelatedAction, HostId, HostScriptResult, RecordedResult,
    ScriptExecutionRequest, ScriptResultPayload, ScriptSource,
};

/// Receives the outcome of software uninstalls, which run as scripts.
#[async_trait]
pub trait UninstallStatusSink: Send + Sync {
    async fn update_uninstall_status(
        &self,
        host_id: HostId,
        execution_id: &str,
        exit_code: i32,
    ) -> Result<()>;
}

/// Options shared by every way of starting a script run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub priority: i64,
    pub requester: Option<String>,
    /// The caller waits for the result; protects the run from cancellation
    /// for the grace window.
    pub sync_request: bool,
}

/// Creates script executions and records their results.
pub struct ScriptExecutor {
    backend: Arc<dyn StateBackend>,
    max_output_chars: usize,
    uninstall_sink: Option<Arc<dyn UninstallStatusSink>>,
}

impl ScriptExecutor {
    pub fn new(backend: Arc<dyn StateBackend>, settings: &Settings) -> Self {
        Self {
            backend,
            max_output_chars: settings.max_output_chars,
            uninstall_sink: None,
        }
    }

    pub fn with_uninstall_sink(mut self, sink: Arc<dyn UninstallStatusSink>) -> Self {
        self.uninstall_sink = Some(sink);
        self
    }

    /// Run an ad-hoc script body on a host.
    pub async fn new_execution_request(
        &self,
        host_id: HostId,
        body: &str,
        options: RunOptions,
    ) -> Result<HostScriptResult> {
        validation::validate_script_contents(body, MAX_INLINE_SCRIPT_CHARS)?;
        self.backend.get_host(host_id).await?;
        self.submit(ScriptExecutionRequest {
            host_id,
            source: ScriptSource::Inline(body.to_string()),
            priority: options.priority,
            requester: options.requester,
            sync_request: options.sync_request,
        })
        .await
    }

    /// Run a saved script on a host. The host must be able to run it.
    pub async fn run_saved_script(
        &self,
        host_id: HostId,
        script_id: i64,
        options: RunOptions,
    ) -> Result<HostScriptResult> {
        let script = self.backend.get_script(script_id).await?;
        let host = self.backend.get_host(host_id).await?;
        let kind = validation::validate_script_name(&script.name)?;
        if !kind.runs_on(host.platform) {
            return Err(HostqError::validation(format!(
                "script '{}' cannot run on {} host {}",
                script.name, host.platform, host_id
            ))
            .into());
        }
        if script.team_id != host.team_id {
            return Err(HostqError::validation(format!(
                "script '{}' and host {} belong to different teams",
                script.name, host_id
            ))
            .into());
        }
        self.submit(ScriptExecutionRequest {
            host_id,
            source: ScriptSource::Saved {
                script_id: script.id,
                script_content_id: script.script_content_id,
            },
            priority: options.priority,
            requester: options.requester,
            sync_request: options.sync_request,
        })
        .await
    }

    async fn submit(&self, request: ScriptExecutionRequest) -> Result<HostScriptResult> {
        let result = self
            .backend
            .new_script_execution(&request)
            .await
            .with_context(|| format!("create script execution for host {}", request.host_id))?;
        tracing::info!(
            host_id = request.host_id,
            execution_id = %result.execution_id,
            sync = request.sync_request,
            "Created script execution"
        );
        Ok(result)
    }

    /// Record a result reported by the agent.
    ///
    /// Duplicate deliveries succeed without changing anything. The host's
    /// next activity is activated whether or not recording succeeded.
    pub async fn record_result(&self, payload: ScriptResultPayload) -> Result<RecordedResult> {
        let host_id = payload.host_id;
        let output = truncate_output(&payload.output, self.max_output_chars);
        if output.len() < payload.output.len() {
            tracing::debug!(
                host_id,
                execution_id = %payload.execution_id,
                original_bytes = payload.output.len(),
                kept_bytes = output.len(),
                "Truncated script output"
            );
        }
        let payload = ScriptResultPayload {
            output: output.to_string(),
            ..payload
        };

        let recorded = match self.backend.set_script_result(&payload).await {
            Ok(recorded) => recorded,
            Err(e) => {
                // Unknown executions were already handled inside the store.
                if !is_not_found(&e) {
                    if let Err(activate_err) = self.backend.activate_next(host_id).await {
                        tracing::warn!(
                            host_id,
                            error = %activate_err,
                            "Activation after failed result recording also failed"
                        );
                    }
                }
                return Err(e.context(format!(
                    "record result {} for host {}",
                    payload.execution_id, host_id
                )));
            }
        };

        if recorded.duplicate {
            return Ok(recorded);
        }

        if let (Some(CorrelatedAction::Uninstall), Some(result)) = (recorded.action, &recorded.result) {
            self.push_uninstall_status(result).await;
        }
        Ok(recorded)
    }

    async fn push_uninstall_status(&self, result: &HostScriptResult) {
        let Some(sink) = &self.uninstall_sink else {
            tracing::debug!(
                execution_id = %result.execution_id,
                "No uninstall status sink configured"
            );
            return;
        };
        let exit_code = result.exit_code.unwrap_or(-1);
        if let Err(e) = sink
            .update_uninstall_status(result.host_id, &result.execution_id, exit_code)
            .await
        {
            tracing::warn!(
                host_id = result.host_id,
                execution_id = %result.execution_id,
                error = %e,
                "Failed to update uninstall status"
            );
        }
    }

    pub async fn get_result(&self, execution_id: &str) -> Result<HostScriptResult> {
        self.backend.get_script_result(execution_id).await
    }

    pub async fn is_execution_pending(&self, host_id: HostId, script_id: i64) -> Result<bool> {
        self.backend.is_execution_pending(host_id, script_id).await
    }

    /// Script-running activities waiting for the host, activated first.
    pub async fn list_pending(&self, host_id: HostId) -> Result<Vec<Activity>> {
        self.backend
            .list_activities(host_id, &ActivityFilter::all_pending().scripts())
            .await
    }

    /// The script activity the host should run now, if any.
    pub async fn list_ready_to_execute(&self, host_id: HostId) -> Result<Vec<Activity>> {
        self.backend
            .list_activities(host_id, &ActivityFilter::ready_to_execute().scripts())
            .await
    }
}
