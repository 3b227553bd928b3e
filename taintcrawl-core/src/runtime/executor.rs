//! Subject execution seam.
//!
//! The crawler core does not drive a browser itself. A [`SubjectExecutor`]
//! runs one reserved subject and reports where the visit ended up and which
//! links it saw. [`CommandExecutor`] delegates to an external program.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taintcrawl_config::{ExecutorSettings, TimeoutSettings};
use taintcrawl_model::{Task, WorkerId};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{CrawlError, Result};

/// Result of a successful visit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionReport {
    /// Address the visit ended on after redirects.
    pub final_url: Option<String>,
    /// Hrefs found on the page, unfiltered.
    pub links: Vec<String>,
}

#[async_trait]
pub trait SubjectExecutor: Send + Sync {
    /// Run `task` on behalf of `worker`. Errors other than store failures
    /// are recorded on the subject, which is then skipped.
    async fn execute(
        &self,
        worker: WorkerId,
        task: &Task,
    ) -> Result<ExecutionReport>;
}

/// Runs the configured program once per subject. The task is written to its
/// stdin as JSON and an [`ExecutionReport`] is read back from stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    module: Option<String>,
    timeouts: TimeoutSettings,
}

impl CommandExecutor {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        module: Option<String>,
        timeouts: TimeoutSettings,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            module,
            timeouts,
        }
    }

    pub fn from_settings(
        settings: &ExecutorSettings,
        timeouts: &TimeoutSettings,
    ) -> Result<Self> {
        let program = settings.program.clone().ok_or_else(|| {
            CrawlError::Internal("executor.program is not configured".into())
        })?;
        Ok(Self::new(
            program,
            settings.args.clone(),
            settings.module.clone(),
            timeouts.clone(),
        ))
    }

    fn command(&self, worker: WorkerId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TAINTCRAWL_WORKER_ID", worker.to_string())
            .env(
                "TAINTCRAWL_NAVIGATION_MS",
                self.timeouts.navigation_ms.to_string(),
            )
            .env(
                "TAINTCRAWL_MODULE_EXEC_MS",
                self.timeouts.module_exec_ms.to_string(),
            )
            .env(
                "TAINTCRAWL_RESTART_SECS",
                self.timeouts.restart_secs.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The runtime bounds each visit by dropping this future.
            .kill_on_drop(true);
        if let Some(module) = &self.module {
            cmd.env("TAINTCRAWL_MODULE", module);
        }
        cmd
    }
}

#[async_trait]
impl SubjectExecutor for CommandExecutor {
    async fn execute(
        &self,
        worker: WorkerId,
        task: &Task,
    ) -> Result<ExecutionReport> {
        let payload = serde_json::to_vec(task)?;
        let mut child = self.command(worker).spawn().map_err(|e| {
            CrawlError::Execution(format!("failed to spawn {}: {e}", self.program))
        })?;
        debug!(worker = %worker, subject = %task.subject_id, pid = ?child.id(), "executor started");

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CrawlError::Execution(format!(
                "executor exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        trace!(subject = %task.subject_id, bytes = output.stdout.len(), "executor output");
        parse_report(&output.stdout)
    }
}

/// Parse executor stdout. Empty output is a visit without findings.
pub fn parse_report(stdout: &[u8]) -> Result<ExecutionReport> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(ExecutionReport::default());
    }
    serde_json::from_str(text).map_err(|e| {
        CrawlError::Execution(format!("unreadable executor report: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_fields_are_optional() {
        let report =
            parse_report(br#"{"links": ["/a", "/b"]}"#).unwrap();
        assert_eq!(report.final_url, None);
        assert_eq!(report.links, vec!["/a", "/b"]);
        assert_eq!(parse_report(b"  \n").unwrap(), ExecutionReport::default());
    }

    #[test]
    fn garbage_is_an_execution_failure() {
        let err = parse_report(b"Traceback (most recent call last)").unwrap_err();
        assert!(matches!(err, CrawlError::Execution(_)));
        assert!(!err.is_store_failure());
    }

    #[test]
    fn settings_need_a_program() {
        let err = CommandExecutor::from_settings(
            &ExecutorSettings::default(),
            &TimeoutSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CrawlError::Internal(_)));
    }
}
