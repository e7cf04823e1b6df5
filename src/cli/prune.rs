//! Prune CLI commands.
//!
//! Commands for managing deferred deletion:
//! - `beamflow prune schedule` - Schedule a prune by hand
//! - `beamflow prune run-due` - Execute every prune whose time has come
//! - `beamflow prune list` - Show the prune ledger
//! - `beamflow prune cancel` - Cancel a scheduled prune

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config::Settings;
use crate::core::PruneTaskState;
use crate::domain::PruneTaskHandle;
use crate::services::{Services, Timers};

/// Prune subcommands
#[derive(Subcommand, Debug)]
pub enum PruneCommands {
    /// Schedule deletion of a path on an endpoint
    Schedule {
        /// Endpoint holding the copy to delete
        endpoint: String,

        /// Path relative to the endpoint root
        path: String,

        /// Days from now until the copy may be deleted
        #[arg(long)]
        days: u32,

        /// Only delete once the file is confirmed at this endpoint
        #[arg(long)]
        verify_at: Option<String>,
    },

    /// Execute every scheduled prune that is now eligible
    RunDue,

    /// List prune tasks
    List {
        /// Include executed and cancelled tasks
        #[arg(long)]
        all: bool,
    },

    /// Cancel a scheduled prune
    Cancel {
        /// Task ID (as shown by `prune list`)
        task_id: String,
    },
}

/// Execute a prune command
pub async fn execute(settings: Settings, command: PruneCommands) -> Result<()> {
    let services = Services::build(settings, Timers::Manual)?;
    let prunes = &services.prunes;

    match command {
        PruneCommands::Schedule {
            endpoint,
            path,
            days,
            verify_at,
        } => {
            let registry = &services.settings.registry;
            let endpoint = registry.get(&endpoint)?;
            let verify = verify_at.map(|name| registry.get(&name)).transpose()?;

            let handle = prunes
                .schedule_prune(&endpoint, &path, days, verify.as_deref())
                .await
                .context("Failed to schedule prune")?;

            println!("Scheduled {}", handle.task_id);
            println!("  Eligible at: {}", handle.eligible_at);
        }

        PruneCommands::RunDue => {
            let reports = prunes.run_due().await?;
            if reports.is_empty() {
                println!("No prunes due");
                return Ok(());
            }

            let mut failed = 0;
            for report in &reports {
                if !report.is_success() {
                    failed += 1;
                }
                println!(
                    "{} {}:{} -> {}",
                    report.task_id, report.endpoint, report.path, report.outcome
                );
            }
            println!("\n{} executed, {} not deleted", reports.len() - failed, failed);

            if failed > 0 {
                std::process::exit(1);
            }
        }

        PruneCommands::List { all } => {
            let entries: Vec<_> = prunes
                .ledger()
                .entries()
                .await?
                .into_iter()
                .filter(|e| all || e.state == PruneTaskState::Scheduled)
                .collect();

            if entries.is_empty() {
                println!("No prune tasks");
                return Ok(());
            }

            println!(
                "{:<18} {:<10} {:<14} {:<26} {}",
                "TASK ID", "STATE", "ENDPOINT", "ELIGIBLE AT", "PATH"
            );
            println!("{}", "-".repeat(100));

            for entry in entries {
                let state = match entry.state {
                    PruneTaskState::Scheduled if entry.attempts > 0 => {
                        format!("retry({})", entry.attempts)
                    }
                    PruneTaskState::Scheduled => "scheduled".to_string(),
                    PruneTaskState::Executed => "executed".to_string(),
                    PruneTaskState::Cancelled => "cancelled".to_string(),
                };
                println!(
                    "{:<18} {:<10} {:<14} {:<26} {}",
                    entry.task.id,
                    state,
                    entry.task.endpoint.name,
                    entry.task.eligible_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    entry.task.path
                );
                if let Some(ref outcome) = entry.last_outcome {
                    println!("{:<18} last: {}", "", outcome);
                }
            }
        }

        PruneCommands::Cancel { task_id } => {
            let entry = prunes
                .ledger()
                .get(&task_id)
                .await?
                .with_context(|| format!("Prune task {} not found", task_id))?;

            let handle = PruneTaskHandle {
                task_id: entry.task.id.clone(),
                eligible_at: entry.task.eligible_at,
            };

            if prunes.cancel_prune(&handle).await? {
                println!("Cancelled {}", task_id);
            } else {
                eprintln!("Prune {} already {:?}", task_id, entry.state);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
