use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ElasticError, Result};
use crate::executor::{JobItemExecutor, JobType};
use crate::sharding::ShardingContext;

/// Result of one script run
#[derive(Debug)]
pub struct ScriptOutput {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Runs a shell command per item.
///
/// The item context is passed as a JSON argument and through environment
/// variables:
/// - `ELASTIC_JOB_NAME`
/// - `ELASTIC_SHARDING_ITEM`
/// - `ELASTIC_SHARDING_PARAMETER`
/// - `ELASTIC_SHARDING_TOTAL_COUNT`
#[derive(Debug, Clone)]
pub struct ScriptJobExecutor {
    command_line: String,
}

impl ScriptJobExecutor {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }

    pub async fn run(&self, context: &ShardingContext) -> Result<ScriptOutput> {
        let payload = serde_json::to_string(context)?;
        tracing::info!(
            job = %context.job_name,
            item = context.sharding_item,
            command = %self.command_line,
            "Executing script"
        );

        let result = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", self.command_line))
            .arg("elastic-lite")
            .arg(payload)
            .env("ELASTIC_JOB_NAME", &context.job_name)
            .env("ELASTIC_SHARDING_ITEM", context.sharding_item.to_string())
            .env("ELASTIC_SHARDING_PARAMETER", &context.sharding_parameter)
            .env(
                "ELASTIC_SHARDING_TOTAL_COUNT",
                context.sharding_total_count.to_string(),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        Self::process_output(context, result)
    }

    fn process_output(
        context: &ShardingContext,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> Result<ScriptOutput> {
        let output = result.map_err(|e| {
            tracing::error!(job = %context.job_name, item = context.sharding_item, error = %e, "Script could not be started");
            ElasticError::Execution(e.to_string())
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        if !output.status.success() {
            tracing::warn!(
                job = %context.job_name,
                item = context.sharding_item,
                exit_code = ?exit_code,
                "Script failed"
            );
            return Err(ElasticError::Execution(if stderr.is_empty() {
                format!("Exit code: {:?}", exit_code)
            } else {
                stderr
            }));
        }

        tracing::info!(
            job = %context.job_name,
            item = context.sharding_item,
            exit_code = ?exit_code,
            "Script completed"
        );

        Ok(ScriptOutput {
            exit_code,
            stdout: (!stdout.is_empty()).then_some(stdout),
            stderr: (!stderr.is_empty()).then_some(stderr),
        })
    }
}

#[async_trait]
impl JobItemExecutor for ScriptJobExecutor {
    fn job_type(&self) -> JobType {
        JobType::Script
    }

    async fn execute(&self, context: ShardingContext) -> Result<()> {
        self.run(&context).await.map(|_| ())
    }
}
