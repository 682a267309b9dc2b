use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use logger_redacted::{mask_name, LogFormat, LoggerConfig};
use rxsync::{
    ConnectivityMonitor, ConnectivityStatus, Medication, Prescription, PrescriptionChanges,
    RxSyncConfig, SyncEngine, SyncStatus,
};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// Offline-first prescription sync
#[derive(Parser, Debug)]
#[command(name = "rxsync")]
#[command(version, about = "Operator CLI for the rxsync offline sync engine")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "RXSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Start with connectivity marked offline
    #[arg(long)]
    offline: bool,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Show patient names unmasked
    #[arg(long, global = true)]
    reveal: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connectivity, sync status, queue size and cache statistics
    Status,
    /// Run one sync pass now
    Sync,
    /// List queued operations
    Pending,
    /// Run background sync until interrupted
    Run,
    /// Manage prescriptions
    Prescription {
        #[command(subcommand)]
        action: PrescriptionCommand,
    },
    /// Manage medications
    Medication {
        #[command(subcommand)]
        action: MedicationCommand,
    },
    /// Inspect or clear the read cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Show the conflict log
    Conflicts {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum PrescriptionCommand {
    Add {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        prescriber: String,
    },
    List,
    Rename {
        id: Uuid,
        #[arg(long)]
        patient: String,
    },
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum MedicationCommand {
    Add {
        #[arg(long)]
        prescription: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        dosage: String,
        #[arg(long, default_value = "")]
        instructions: String,
        /// Expiration date, YYYY-MM-DD
        #[arg(long)]
        expires: NaiveDate,
    },
    List {
        /// Only medications of this prescription
        #[arg(long)]
        prescription: Option<Uuid>,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Drop every cached entry
    Purge,
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let logger = LoggerConfig {
        format: if args.json_logs { LogFormat::Json } else { LogFormat::Pretty },
        ..Default::default()
    }
    .verbose(args.verbose);
    logger_redacted::init(&logger)?;

    let config =
        RxSyncConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let connectivity = ConnectivityMonitor::new(if args.offline {
        ConnectivityStatus::Offline
    } else {
        ConnectivityStatus::Online
    });

    let engine = SyncEngine::builder(config)
        .connectivity(connectivity)
        .build()
        .await
        .context("Failed to start sync engine")?;

    let result = run(&engine, &args).await;
    engine.shutdown();
    result
}

async fn run(engine: &SyncEngine, args: &Args) -> Result<()> {
    match &args.command {
        Command::Status => status(engine).await,
        Command::Sync => {
            let summary = engine.sync().sync_now().await.context("Sync failed")?;
            println!("{} {}", "✔".bright_green(), "Sync complete".bold());
            println!("  replayed   {}", summary.replay.succeeded);
            println!("  rejected   {}", summary.replay.failed);
            println!("  pulled     {}", summary.pull.pulled);
            println!("  conflicts  {}", summary.replay.conflicts + summary.pull.conflicts);
            println!("  pending    {}", summary.pending);
            Ok(())
        }
        Command::Pending => pending(engine, args.json).await,
        Command::Run => run_background(engine).await,
        Command::Prescription { action } => prescription(engine, action, args).await,
        Command::Medication { action } => medication(engine, action, args.json).await,
        Command::Cache { action } => {
            match action {
                CacheCommand::Purge => {
                    engine.cache().clear().await;
                    println!("{} Cache cleared", "✔".bright_green());
                }
                CacheCommand::Stats => {
                    let stats = engine.cache().stats();
                    println!(
                        "hits {}  misses {}  evictions {}  in memory {}",
                        stats.hits, stats.misses, stats.evictions, stats.memory_entries
                    );
                }
            }
            Ok(())
        }
        Command::Conflicts { limit } => conflicts(engine, *limit, args.json).await,
    }
}

async fn status(engine: &SyncEngine) -> Result<()> {
    let connectivity = match engine.connectivity().status() {
        ConnectivityStatus::Online => "online".bright_green(),
        ConnectivityStatus::Offline => "offline".bright_red(),
    };
    let pending = engine.sync().pending_count().await?;
    let stats = engine.cache().stats();

    println!("{}", "rxsync status".bold());
    println!("  connectivity  {}", connectivity);
    println!("  sync          {}", engine.sync().status());
    let pending = if pending > 0 { pending.to_string().yellow() } else { "0".normal() };
    println!("  pending ops   {}", pending);
    println!("  cache         {} entries in memory", stats.memory_entries);
    Ok(())
}

async fn pending(engine: &SyncEngine, as_json: bool) -> Result<()> {
    let ops = engine.local_db().pending_operations(None).await?;
    if as_json {
        let rows: Vec<_> = ops
            .iter()
            .map(|op| {
                json!({
                    "seq": op.seq,
                    "collection": op.collection,
                    "recordId": op.record_id,
                    "operation": op.operation,
                    "retryCount": op.retry_count,
                    "lastError": op.last_error,
                    "createdAt": op.created_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if ops.is_empty() {
        println!("No pending operations");
        return Ok(());
    }
    for op in ops {
        let error = op.last_error.as_deref().unwrap_or("");
        println!(
            "{:>5}  {:<13} {:<7} {}  retries={} {}",
            op.seq,
            op.collection,
            op.operation.as_str(),
            op.record_id,
            op.retry_count,
            error.red()
        );
    }
    Ok(())
}

async fn run_background(engine: &SyncEngine) -> Result<()> {
    let mut statuses = engine.sync().subscribe();
    engine.start();
    info!("Background sync running, press Ctrl-C to stop");

    loop {
        tokio::select! {
            status = statuses.recv() => match status {
                Ok(SyncStatus::Error { message }) => {
                    println!("{} {}", "sync error:".bright_red(), message)
                }
                Ok(status) => println!("{} {}", "sync".bright_cyan(), status),
                Err(_) => continue,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                println!("Stopping");
                return Ok(());
            }
        }
    }
}

fn display_name(name: &str, reveal: bool) -> String {
    if reveal {
        name.to_string()
    } else {
        mask_name(name)
    }
}

async fn prescription(
    engine: &SyncEngine,
    action: &PrescriptionCommand,
    args: &Args,
) -> Result<()> {
    let repo = engine.prescriptions();
    match action {
        PrescriptionCommand::Add { patient, prescriber } => {
            let rx = Prescription::new(patient.clone(), prescriber.clone(), Utc::now());
            let saved = repo.save(rx).await?;
            println!(
                "{} prescription {} ({})",
                "✔".bright_green(),
                saved.id,
                sync_label(saved.is_synced)
            );
        }
        PrescriptionCommand::List => {
            let mut records = repo.list().await?;
            records.sort_by_key(|r| r.created_at);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            for rx in records {
                println!(
                    "{}  {:<24} by {:<16} v{} {}",
                    rx.id,
                    display_name(&rx.patient_name, args.reveal),
                    rx.created_by,
                    rx.version,
                    sync_label(rx.is_synced)
                );
            }
        }
        PrescriptionCommand::Rename { id, patient } => {
            let patient = patient.clone();
            let saved = repo
                .update(*id, move |rx| {
                    rx.copy_with(PrescriptionChanges {
                        patient_name: Some(patient),
                        ..Default::default()
                    })
                })
                .await?;
            println!(
                "{} prescription {} now v{} ({})",
                "✔".bright_green(),
                saved.id,
                saved.version,
                sync_label(saved.is_synced)
            );
        }
        PrescriptionCommand::Delete { id } => {
            if !repo.delete(*id).await? {
                bail!("No prescription {}", id);
            }
            println!("{} deleted {}", "✔".bright_green(), id);
        }
    }
    Ok(())
}

async fn medication(engine: &SyncEngine, action: &MedicationCommand, as_json: bool) -> Result<()> {
    match action {
        MedicationCommand::Add { prescription, name, dosage, instructions, expires } => {
            if engine.prescriptions().get(*prescription).await?.is_none() {
                bail!("No prescription {}", prescription);
            }
            let med = Medication::new(
                *prescription,
                name.clone(),
                dosage.clone(),
                instructions.clone(),
                *expires,
                Utc::now(),
            );
            let saved = engine.medications().save(med).await?;
            println!(
                "{} medication {} ({})",
                "✔".bright_green(),
                saved.id,
                sync_label(saved.is_synced)
            );
        }
        MedicationCommand::List { prescription } => {
            let records = match prescription {
                Some(id) => engine.medications_for(*id).await?,
                None => engine.medications().list().await?,
            };
            if as_json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            let today = Utc::now().date_naive();
            for med in records {
                let expiry = if med.is_expired(today) {
                    format!("expired {}", med.expiration_date).red()
                } else {
                    format!("expires {}", med.expiration_date).normal()
                };
                println!(
                    "{}  {:<20} {:<10} {}  {}",
                    med.id,
                    med.name,
                    med.dosage,
                    expiry,
                    sync_label(med.is_synced)
                );
            }
        }
    }
    Ok(())
}

async fn conflicts(engine: &SyncEngine, limit: i64, as_json: bool) -> Result<()> {
    let entries = engine.conflicts(limit).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No conflicts recorded");
    }
    for entry in entries {
        println!(
            "{}  {:<13} {}  {} -> v{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.collection,
            entry.record_id,
            entry.strategy.yellow(),
            entry.resolved_version
        );
    }
    Ok(())
}

fn sync_label(synced: bool) -> ColoredString {
    if synced {
        "synced".green()
    } else {
        "pending".yellow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_medication_add() {
        let id = Uuid::new_v4();
        let args = Args::parse_from([
            "rxsync",
            "medication",
            "add",
            "--prescription",
            &id.to_string(),
            "--name",
            "Amoxicillin",
            "--dosage",
            "500mg",
            "--expires",
            "2027-01-31",
        ]);
        match args.command {
            Command::Medication {
                action: MedicationCommand::Add { prescription, expires, .. },
            } => {
                assert_eq!(prescription, id);
                assert_eq!(expires, NaiveDate::from_ymd_opt(2027, 1, 31).unwrap());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
