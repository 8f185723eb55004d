//! External command as a job body.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use jobgate_core::JobIdentity;
use jobgate_infra::{JobBody, JobError};

/// Runs `program args..` once per acquired lease.
///
/// Exit code zero is success; the result reference is the fixed
/// `--result-ref` value when given, otherwise the last non-empty stdout line.
/// A non-zero exit fails the job with the command's stderr.
#[derive(Debug, Clone)]
pub struct CommandJob {
    program: String,
    args: Vec<String>,
    result_ref: Option<String>,
}

impl CommandJob {
    pub fn from_argv(argv: &[String]) -> anyhow::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("no command given after `--`"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            result_ref: None,
        })
    }

    /// Fixed result reference; `{identity}` is replaced with the job identity.
    pub fn with_result_ref(mut self, template: &str, identity: &JobIdentity) -> Self {
        self.result_ref = Some(template.replace("{identity}", identity.as_str()));
        self
    }
}

#[async_trait]
impl JobBody for CommandJob {
    async fn execute(&self) -> Result<Option<String>, JobError> {
        debug!(program = %self.program, args = ?self.args, "spawning command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(if stderr.is_empty() {
                JobError::new(format!("command failed ({})", output.status))
            } else {
                JobError::new(format!("command failed ({}): {stderr}", output.status))
            });
        }

        if let Some(reference) = &self.result_ref {
            return Ok(Some(reference.clone()));
        }
        Ok(last_line(&output.stdout))
    }
}

fn last_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}
