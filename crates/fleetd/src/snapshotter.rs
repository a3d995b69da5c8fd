//! Snapshot engine that shells out to a configured command.

use std::time::Duration;

use fleet_listen::{SnapshotFuture, Snapshotter};
use tokio::process::Command;
use tracing::debug;

/// Runs `program args.. <service_id>`. Trimmed stdout is the label; a
/// non-zero exit reports stderr as the error.
pub struct CommandSnapshotter {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSnapshotter {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    async fn run(&self, service_id: &str) -> Result<String, String> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err("no snapshot command configured".to_string());
        };

        debug!(%program, %service_id, "running snapshot command");
        let output = Command::new(program)
            .args(args)
            .arg(service_id)
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to run {program}: {e}")),
            Err(_) => return Err(format!("{program} timed out after {:?}", self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if stderr.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                stderr
            });
        }

        let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if label.is_empty() {
            return Err(format!("{program} printed no snapshot label"));
        }
        Ok(label)
    }
}

impl Snapshotter for CommandSnapshotter {
    fn snapshot<'a>(&'a self, service_id: &'a str) -> SnapshotFuture<'a> {
        Box::pin(self.run(service_id))
    }
}
