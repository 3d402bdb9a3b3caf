//! Out-of-process sandbox adapter
//!
//! Runs step code under a separate interpreter process with a cleared
//! environment and kill-on-timeout. This adapter enforces wall-clock and
//! process isolation; memory and package policy are expected from the
//! platform's container sandbox in production deployments, for which
//! this is a stand-in behind the same trait.
//!
//! Contract with the child process: the input environment arrives as one
//! JSON document on stdin, the result is whatever lands on stdout
//! (parsed as JSON when possible), and stderr lines come back as logs.

use std::io::Write as _;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use weft_core::error::SandboxError;
use weft_core::traits::{Sandbox, SandboxLimits, SandboxOutcome};

const STDERR_TAIL_LIMIT: usize = 2048;

pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        Self
    }

    fn interpreter(language: &str) -> Result<(&'static str, Vec<&'static str>), SandboxError> {
        match language {
            "python" => Ok(("python3", vec![])),
            "javascript" => Ok(("node", vec![])),
            "bash" => Ok(("bash", vec![])),
            other => Err(SandboxError::Policy(format!(
                "language '{other}' is not permitted"
            ))),
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        language: &str,
        code: &str,
        env: Value,
        limits: &SandboxLimits,
    ) -> Result<SandboxOutcome, SandboxError> {
        let (binary, args) = Self::interpreter(language)?;
        let binary = which::which(binary)
            .map_err(|_| SandboxError::Policy(format!("interpreter for '{language}' not found")))?;

        let mut script = tempfile::NamedTempFile::new()
            .map_err(|e| SandboxError::Exception(format!("sandbox setup failed: {e}")))?;
        script
            .as_file_mut()
            .write_all(code.as_bytes())
            .map_err(|e| SandboxError::Exception(format!("sandbox setup failed: {e}")))?;

        debug!("sandbox: running {language} code ({} bytes)", code.len());
        let mut child = Command::new(&binary)
            .args(&args)
            .arg(script.path())
            .env_clear()
            .env("PATH", "/usr/bin:/bin:/usr/local/bin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Exception(format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&env)
                .map_err(|e| SandboxError::Exception(format!("env serialization failed: {e}")))?;
            let _ = stdin.write_all(&payload).await;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let timeout = if limits.timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            limits.timeout
        };
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| SandboxError::Exception(format!("wait failed: {e}")))?
            }
            Err(_) => return Err(SandboxError::Timeout),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let mut start = stderr.len().saturating_sub(STDERR_TAIL_LIMIT);
            while !stderr.is_char_boundary(start) {
                start += 1;
            }
            return Err(SandboxError::Exception(format!(
                "exit code {:?}: {}",
                output.status.code(),
                stderr[start..].trim()
            )));
        }

        let trimmed = stdout.trim();
        let result = serde_json::from_str(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string()));
        let logs = stderr
            .lines()
            .map(str::to_string)
            .filter(|line| !line.is_empty())
            .collect();

        Ok(SandboxOutcome { result, logs, errors: Vec::new() })
    }
}
