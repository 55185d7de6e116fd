use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use blockflow_core::config::ResultHandlerConfig;
use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::{MetadataStore, RunCommit};
use blockflow_core::types::RunLog;

use crate::result::{Executable, ExecutionResult};

/// Receives every finished node-run.
pub trait ResultHandler: Send + Sync + 'static {
    /// Called once the run log exists, before the function is invoked.
    fn begin(&self, _run_log: &RunLog) -> Result<()> {
        Ok(())
    }

    /// Called when a begun run turns out to have nothing to do.
    fn abandon(&self, _run_log: &RunLog) -> Result<()> {
        Ok(())
    }

    fn handle(
        &self,
        executable: &Executable,
        result: &ExecutionResult,
        commit: &RunCommit,
    ) -> Result<()>;
}

/// Build the handler named by `config`.
pub fn handler_for(
    config: &ResultHandlerConfig,
    metadata: Arc<dyn MetadataStore>,
) -> Result<Arc<dyn ResultHandler>> {
    Ok(match config {
        ResultHandlerConfig::Metadata => Arc::new(MetadataResultHandler::new(metadata)),
        ResultHandlerConfig::Debug => Arc::new(DebugResultHandler),
        ResultHandlerConfig::RemoteCallback { url, headers } => {
            Arc::new(RemoteCallbackResultHandler::new(url, headers.clone()))
        }
    })
}

// ── MetadataResultHandler ───────────────────────────────────────

/// Persists runs into the metadata store.
pub struct MetadataResultHandler {
    metadata: Arc<dyn MetadataStore>,
}

impl MetadataResultHandler {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

impl ResultHandler for MetadataResultHandler {
    fn begin(&self, run_log: &RunLog) -> Result<()> {
        self.metadata.begin_run(run_log)
    }

    fn abandon(&self, run_log: &RunLog) -> Result<()> {
        self.metadata.discard_run(run_log.id.as_str())
    }

    fn handle(&self, _: &Executable, result: &ExecutionResult, commit: &RunCommit) -> Result<()> {
        self.metadata.commit_run(commit)?;
        debug!(
            node = %result.node_key,
            run_id = %commit.run_log.id,
            blocks = commit.output_blocks.len(),
            consumed = commit.consumed.len(),
            "Run committed"
        );
        Ok(())
    }
}

// ── DebugResultHandler ──────────────────────────────────────────

/// Logs results without persisting anything.
pub struct DebugResultHandler;

impl ResultHandler for DebugResultHandler {
    fn handle(&self, executable: &Executable, result: &ExecutionResult, _: &RunCommit) -> Result<()> {
        let body = serde_json::to_string(&callback_body(executable, result))?;
        info!(node = %result.node_key, status = ?result.status, result = %body, "Run result");
        Ok(())
    }
}

// ── RemoteCallbackResultHandler ─────────────────────────────────

/// POSTs each result as JSON to a fixed url.
pub struct RemoteCallbackResultHandler {
    url: String,
    headers: HashMap<String, String>,
}

impl RemoteCallbackResultHandler {
    pub fn new(url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.to_string(),
            headers,
        }
    }
}

fn callback_body(executable: &Executable, result: &ExecutionResult) -> serde_json::Value {
    serde_json::json!({
        "executable": executable,
        "result": result,
    })
}

impl ResultHandler for RemoteCallbackResultHandler {
    fn handle(&self, executable: &Executable, result: &ExecutionResult, _: &RunCommit) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BlockflowError::ResultHandler(e.to_string()))?;

        let mut req = client.post(&self.url).json(&callback_body(executable, result));
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send()
            .map_err(|e| BlockflowError::ResultHandler(format!("{}: {}", self.url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BlockflowError::ResultHandler(format!(
                "{} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }
        debug!(url = %self.url, node = %result.node_key, "Result delivered");
        Ok(())
    }
}
