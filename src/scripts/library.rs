use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::validation::{self, MAX_SAVED_SCRIPT_CHARS};
use crate::config::types::Settings;
use crate::error::HostqError;
use crate::state::backend::StateBackend;
use crate::state::models::{DesiredScript, HostId, NewScript, Script, ScriptChange, ScriptScope};

/// Saved scripts: creation, edits, deletion and reconciliation.
///
/// Mutations that cancel pending executions reactivate the affected hosts
/// afterwards, each host in its own transaction.
pub struct ScriptLibrary {
    backend: Arc<dyn StateBackend>,
    grace: Duration,
}

impl ScriptLibrary {
    pub fn new(backend: Arc<dyn StateBackend>, settings: &Settings) -> Self {
        Self {
            backend,
            grace: settings.max_server_wait(),
        }
    }

    pub async fn create(&self, scope: ScriptScope, name: &str, contents: &str) -> Result<Script> {
        validation::validate_script_name(name)?;
        validation::validate_script_contents(contents, MAX_SAVED_SCRIPT_CHARS)?;
        self.backend
            .create_script(&NewScript {
                scope,
                name: name.to_string(),
                contents: contents.to_string(),
            })
            .await
    }

    pub async fn get(&self, script_id: i64) -> Result<Script> {
        self.backend.get_script(script_id).await
    }

    pub async fn get_by_name(&self, scope: ScriptScope, name: &str) -> Result<Script> {
        self.backend.get_script_by_name(scope, name).await
    }

    pub async fn contents(&self, script_id: i64) -> Result<String> {
        let script = self.backend.get_script(script_id).await?;
        self.backend.get_script_contents(script.script_content_id).await
    }

    pub async fn list(&self, scope: ScriptScope) -> Result<Vec<Script>> {
        self.backend.list_scripts(scope).await
    }

    pub async fn update_contents(&self, script_id: i64, contents: &str) -> Result<ScriptChange<Script>> {
        validation::validate_script_contents(contents, MAX_SAVED_SCRIPT_CHARS)?;
        let change = self
            .backend
            .update_script_contents(script_id, contents, self.grace)
            .await
            .with_context(|| format!("update script {}", script_id))?;
        self.reactivate(&change.affected_hosts).await;
        Ok(change)
    }

    /// Delete a script. Returns the hosts that had executions canceled.
    pub async fn delete(&self, script_id: i64) -> Result<Vec<HostId>> {
        let change = self
            .backend
            .delete_script(script_id, self.grace)
            .await
            .with_context(|| format!("delete script {}", script_id))?;
        self.reactivate(&change.affected_hosts).await;
        Ok(change.affected_hosts)
    }

    /// Make the scope's scripts match `desired` exactly.
    pub async fn batch_set(
        &self,
        scope: ScriptScope,
        desired: &[DesiredScript],
    ) -> Result<ScriptChange<Vec<Script>>> {
        let mut names = HashSet::new();
        for entry in desired {
            validation::validate_script_name(&entry.name)?;
            validation::validate_script_contents(&entry.contents, MAX_SAVED_SCRIPT_CHARS)
                .with_context(|| format!("script '{}'", entry.name))?;
            if !names.insert(entry.name.as_str()) {
                return Err(HostqError::validation(format!(
                    "duplicate script name '{}'",
                    entry.name
                ))
                .into());
            }
        }

        let change = self
            .backend
            .batch_set_scripts(scope, desired, self.grace)
            .await
            .context("apply desired script set")?;
        self.reactivate(&change.affected_hosts).await;
        tracing::info!(
            scripts = change.value.len(),
            affected_hosts = change.affected_hosts.len(),
            "Applied desired script set"
        );
        Ok(change)
    }

    pub async fn link_automation(&self, name: &str, script_id: i64) -> Result<()> {
        if name.trim().is_empty() {
            return Err(HostqError::validation("automation name must not be empty").into());
        }
        self.backend.link_automation(name, script_id).await
    }

    pub async fn unlink_automation(&self, name: &str) -> Result<()> {
        if !self.backend.unlink_automation(name).await? {
            return Err(HostqError::not_found("Automation", name).into());
        }
        Ok(())
    }

    pub async fn cleanup_unused_contents(&self) -> Result<usize> {
        self.backend.cleanup_unused_script_contents().await
    }

    /// Separate pass after the canceling transaction has committed. A failure
    /// here heals on the host's next result or cancellation.
    async fn reactivate(&self, hosts: &[HostId]) {
        if hosts.is_empty() {
            return;
        }
        match self.backend.activate_next_for_hosts(hosts).await {
            Ok(activated) => tracing::debug!(
                hosts = hosts.len(),
                activated,
                "Reactivated hosts after cancellation"
            ),
            Err(e) => tracing::warn!(
                hosts = hosts.len(),
                error = %e,
                "Failed to reactivate hosts after cancellation"
            ),
        }
    }
}
