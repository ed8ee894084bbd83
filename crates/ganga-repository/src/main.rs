// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ganga repository operator CLI
//!
//! Inspects and maintains a repository configured through `GANGA_*`
//! environment variables (a `.env` file is honoured).
//!
//! Usage:
//!   ganga-repo list [--registry jobs] [--all]
//!   ganga-repo sessions [--registry jobs]
//!   ganga-repo reap-locks [--registry jobs]
//!   ganga-repo rebuild-index [--registry jobs]
//!   ganga-repo clean [--registry jobs] [--force]
//!   ganga-repo migrate --to-url sqlite:/path/ganga.sqlite [--registry jobs ...]

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use ganga_repository::migration;
use ganga_repository::{IndexScope, PluginRegistry, Repository, RepositoryConfig, RepositoryContext};

#[derive(Parser)]
#[command(author, version, about = "Inspect and maintain a Ganga job repository", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List indexed objects
    List {
        #[arg(long, default_value = "jobs")]
        registry: String,
        /// Include sub-objects
        #[arg(long)]
        all: bool,
    },
    /// Show the other sessions registered on the repository
    Sessions {
        #[arg(long, default_value = "jobs")]
        registry: String,
    },
    /// Clear the locks left by dead sessions
    ReapLocks {
        #[arg(long, default_value = "jobs")]
        registry: String,
    },
    /// Regenerate the index from object payloads
    RebuildIndex {
        #[arg(long, default_value = "jobs")]
        registry: String,
    },
    /// Delete every object of a registry and restart its ids at 0
    Clean {
        #[arg(long, default_value = "jobs")]
        registry: String,
        /// Clean even while other sessions are active
        #[arg(long)]
        force: bool,
    },
    /// Copy the file-tree repository into a document store
    Migrate {
        /// Destination database URL
        #[arg(long, env = "GANGA_MIGRATE_TO_URL")]
        to_url: String,
        /// Registries to migrate (default: jobs and the metadata registries)
        #[arg(long = "registry")]
        registries: Vec<String>,
    },
}

async fn open(ctx: &RepositoryContext, registry: &str) -> Result<Arc<Repository>> {
    let repository = Repository::open(ctx, registry).await?;
    repository.startup().await?;
    Ok(repository)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ganga_repository=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RepositoryConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    // Maintenance commands never rewrite jobs on their own.
    config.startup_check = false;
    config.autoflush_interval = None;

    info!(
        location = %config.location.display(),
        backend = ?config.backend,
        "Configuration loaded"
    );

    let ctx = RepositoryContext::new(config);

    match cli.command {
        Command::List { registry, all } => {
            let repository = open(&ctx, &registry).await?;
            let entries = if all {
                repository.backend().list_entries(IndexScope::All).await?
            } else {
                repository.list_index().await?
            };
            println!("{:>8}  {:<16} {:<12} {:<8} NAME", "ID", "CLASS", "STATUS", "MASTER");
            for (id, entry) in &entries {
                let master = entry
                    .master_id
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string());
                match &entry.error {
                    Some(reason) => println!("{:>8}  {:<16} {}", id, entry.class_name, reason),
                    None => println!(
                        "{:>8}  {:<16} {:<12} {:<8} {}",
                        id,
                        entry.class_name,
                        entry.get_str("status").unwrap_or("-"),
                        master,
                        entry.get_str("name").unwrap_or(""),
                    ),
                }
            }
            println!("{} object(s)", entries.len());
            repository.shutdown().await?;
        }
        Command::Sessions { registry } => {
            let repository = open(&ctx, &registry).await?;
            for status in repository.other_sessions().await? {
                println!(
                    "{}  {}  pid {}  heartbeat {}  {}  locks {:?}",
                    status.record.session_id,
                    status.record.host,
                    status.record.pid,
                    status.record.heartbeat.to_rfc3339(),
                    if status.alive { "alive" } else { "dead" },
                    status.held_object_ids,
                );
            }
            repository.shutdown().await?;
        }
        Command::ReapLocks { registry } => {
            let repository = open(&ctx, &registry).await?;
            let reaped = repository.reap_locks().await?;
            println!("Reaped {} dead session(s)", reaped.len());
            for session in reaped {
                println!("  {}", session);
            }
            repository.shutdown().await?;
        }
        Command::RebuildIndex { registry } => {
            let repository = open(&ctx, &registry).await?;
            let rebuilt = repository.rebuild_index().await?;
            println!("Rebuilt {} index entries in '{}'", rebuilt, registry);
            repository.shutdown().await?;
        }
        Command::Clean { registry, force } => {
            let repository = open(&ctx, &registry).await?;
            let cleaned = repository.clean(force).await;
            repository.shutdown().await?;
            cleaned?;
            println!("Registry '{}' cleaned", registry);
        }
        Command::Migrate { to_url, registries } => {
            let reports = migration::migrate_location(
                &ctx.config,
                &to_url,
                &registries,
                Arc::new(PluginRegistry::with_builtins()),
            )
            .await?;
            for report in &reports {
                println!(
                    "{}: {} object(s) written from {} master(s), {} failure(s)",
                    report.registry,
                    report.objects_written(),
                    report.migrated.len(),
                    report.failures.len(),
                );
                for failure in &report.failures {
                    println!("  #{}: {}", failure.old_id, failure.error);
                }
            }
        }
    }

    Ok(())
}
