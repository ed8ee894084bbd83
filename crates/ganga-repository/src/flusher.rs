// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that periodically flushes dirty objects.
//!
//! Each run flushes every dirty object in the repository's cache. Ids whose
//! lock is held elsewhere stay dirty and are retried on the next run.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::RepoError;
use crate::repository::Repository;

/// Background worker flushing one registry.
pub struct AutoFlusher {
    repository: Weak<Repository>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl AutoFlusher {
    pub fn new(repository: Weak<Repository>, interval: Duration) -> Self {
        Self {
            repository,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the flush loop until shutdown is signalled or the repository is dropped.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            "Auto-flusher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Auto-flusher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    let Some(repository) = self.repository.upgrade() else {
                        debug!("Repository dropped, stopping auto-flusher");
                        break;
                    };
                    match repository.flush_all().await {
                        Ok(report) if report.is_complete() => {
                            if !report.succeeded.is_empty() {
                                debug!(
                                    registry = %repository.registry(),
                                    flushed = report.succeeded.len(),
                                    "Auto-flush completed"
                                );
                            }
                        }
                        Ok(report) => {
                            warn!(
                                registry = %repository.registry(),
                                flushed = report.succeeded.len(),
                                failed = ?report.failed_ids(),
                                "Auto-flush left objects dirty"
                            );
                        }
                        Err(RepoError::Disabled { .. }) => {
                            warn!(
                                registry = %repository.registry(),
                                "Repository disabled, stopping auto-flusher"
                            );
                            break;
                        }
                        Err(e) => {
                            error!(
                                registry = %repository.registry(),
                                error = %e,
                                "Auto-flush failed"
                            );
                        }
                    }
                }
            }
        }

        info!("Auto-flusher stopped");
    }
}
