// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle control of the process hosting the document store.
//!
//! The native controller assumes the database is managed elsewhere. The
//! command controller runs operator-supplied shell commands, e.g. a
//! `docker start`/`docker stop` pair.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ControllerKind;
use crate::error::{RepoError, Result};

#[async_trait]
pub trait ContainerController: Send + Sync {
    fn name(&self) -> &str;

    /// Make sure the database is running. Called before the first connection.
    async fn start(&self) -> Result<()>;

    /// Stop the database. Only called when no other session is alive.
    async fn quit(&self) -> Result<()>;
}

/// Controller for databases managed outside the repository.
#[derive(Debug, Default)]
pub struct NativeController;

#[async_trait]
impl ContainerController for NativeController {
    fn name(&self) -> &str {
        "native"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        Ok(())
    }
}

/// Controller running shell commands to start and stop the database.
#[derive(Debug, Clone)]
pub struct CommandController {
    start: Option<String>,
    stop: Option<String>,
}

impl CommandController {
    pub fn new(start: Option<String>, stop: Option<String>) -> Self {
        Self { start, stop }
    }

    async fn run(&self, action: &str, command: Option<&str>) -> Result<()> {
        let Some(command) = command else {
            debug!(action, "No command configured");
            return Ok(());
        };
        info!(action, command, "Running database controller command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RepoError::Container {
                action: action.to_string(),
                details: format!("failed to spawn '{}': {}", command, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RepoError::Container {
                action: action.to_string(),
                details: format!("'{}' exited with {}: {}", command, output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerController for CommandController {
    fn name(&self) -> &str {
        "command"
    }

    async fn start(&self) -> Result<()> {
        self.run("start", self.start.as_deref()).await
    }

    async fn quit(&self) -> Result<()> {
        self.run("quit", self.stop.as_deref()).await
    }
}

/// Build the controller described by the configuration.
pub fn from_config(kind: &ControllerKind) -> Arc<dyn ContainerController> {
    match kind {
        ControllerKind::Native => Arc::new(NativeController),
        ControllerKind::Command { start, stop } => {
            Arc::new(CommandController::new(start.clone(), stop.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_command_controller_runs_commands() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("started");
        let controller = CommandController::new(
            Some(format!("touch {}", marker.display())),
            Some(format!("rm {}", marker.display())),
        );

        controller.start().await.unwrap();
        assert!(marker.exists());
        controller.quit().await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_container_error() {
        let controller = CommandController::new(Some("exit 3".to_string()), None);
        let err = controller.start().await.unwrap_err();
        assert_eq!(err.error_code(), "CONTAINER_ERROR");

        // No stop command configured: nothing to do.
        controller.quit().await.unwrap();
    }

    #[test]
    fn test_from_config() {
        assert_eq!(from_config(&ControllerKind::Native).name(), "native");
        let command = ControllerKind::Command {
            start: None,
            stop: None,
        };
        assert_eq!(from_config(&command).name(), "command");
    }
}
