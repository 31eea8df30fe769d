use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::schedule::types::{Platform, TaskResult};

const SENT_MARKERS: [&str; 2] = ["Successfully sent DM", "Message envoyé avec succès"];
const NEEDS_FOLLOW_MARKERS: [&str; 2] = [
    "recipient requires incoming messages to come from someone they follow",
    "recipient has disabled incoming messages",
];

/// Sends a direct message on a platform. `message` of `None` sends the
/// platform's default verification text.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    async fn send_dm(&self, platform: Platform, handle: &str, message: Option<&str>) -> Result<TaskResult>;
}

/// Runs `testDm_<platform>.py <handle> [message]` from `script_dir`.
pub struct ScriptMessenger {
    python: PathBuf,
    script_dir: PathBuf,
}

impl ScriptMessenger {
    pub fn new(python: impl Into<PathBuf>, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            script_dir: script_dir.into(),
        }
    }

    pub fn script_path(&self, platform: Platform) -> PathBuf {
        self.script_dir.join(format!("testDm_{}.py", platform.as_str()))
    }
}

#[async_trait]
impl Messenger for ScriptMessenger {
    async fn send_dm(&self, platform: Platform, handle: &str, message: Option<&str>) -> Result<TaskResult> {
        let script = self.script_path(platform);
        let mut command = Command::new(&self.python);
        command
            .arg(&script)
            .arg(handle)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(message) = message {
            command.arg(message);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {}", script.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(handle, %platform, status = %output.status, "DM script output: {}", stdout.trim());
        if !output.status.success() {
            warn!(handle, %platform, status = %output.status, "DM script exited unsuccessfully");
        }

        Ok(interpret_output(&stdout, &stderr))
    }
}

/// Maps the script's console output onto a task result.
pub fn interpret_output(stdout: &str, stderr: &str) -> TaskResult {
    if SENT_MARKERS.iter().any(|marker| stdout.contains(marker)) {
        return TaskResult::success();
    }

    if NEEDS_FOLLOW_MARKERS
        .iter()
        .any(|marker| stdout.contains(marker) || stderr.contains(marker))
    {
        return TaskResult::failure("DM failed: User needs to follow the platform")
            .with_field("needs_follow", Value::Bool(true));
    }

    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return TaskResult::failure(stderr);
    }

    TaskResult::failure("Unknown error sending DM")
}
