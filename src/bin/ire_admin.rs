//! `ire-admin`: operator CLI for the Lock Protection Layer and the
//! engine's read-only reporting views (spec.md §6).
//!
//! Grounded on `sbom-tool-sbom-tools/src/main.rs`'s `clap::Parser` +
//! `tracing_subscriber` init shape, with a `--format table|json` switch in
//! place of that tool's richer report-format enum.

use clap::{Parser, Subcommand, ValueEnum};
use patient_ire::admin;
use patient_ire::config::EngineConfig;
use patient_ire::engine::{self, EngineHandles, ReconcileEvent};
use patient_ire::model::RawPatientRecord;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ire-admin")]
#[command(about = "Operator CLI for the Identity Reconciliation Engine", long_about = None)]
struct Cli {
    /// Output format for report commands.
    #[arg(long, value_enum, global = true, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, ValueEnum)]
enum Format {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Set `matching_locked = true` on a canonical (LPL).
    Lock {
        canonical_id: Uuid,
        #[arg(long, default_value = "manual operator lock")]
        reason: String,
    },
    /// Clear `matching_locked` on a canonical.
    Unlock { canonical_id: Uuid },
    /// Replay one raw record through `reconcile` out-of-band, e.g. to
    /// re-process a record an adapter delivered while the pool was down.
    Reconcile {
        raw_id: Uuid,
        his_number: String,
        #[arg(long, value_enum)]
        source: SourceArg,
    },
    /// Counts of `match_log` entries grouped by match type.
    MatchingStats,
    /// Mobile pre-registration adoption counts.
    MobileAppStats,
    /// Backlog size and last-processed timestamp.
    EngineHealth,
}

#[derive(Copy, Clone, ValueEnum)]
enum SourceArg {
    Qms,
    Infoclinica,
}

impl From<SourceArg> for patient_ire::model::Source {
    fn from(s: SourceArg) -> Self {
        match s {
            SourceArg::Qms => patient_ire::model::Source::Qms,
            SourceArg::Infoclinica => patient_ire::model::Source::Infoclinica,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&config.database_url)
        .await?;
    let handles = EngineHandles::new(pool.clone(), config);

    match cli.command {
        Command::Lock { canonical_id, reason } => {
            admin::lock_canonical(&handles, canonical_id, &reason).await?;
            println!("locked {canonical_id}");
        }
        Command::Unlock { canonical_id } => {
            admin::unlock_canonical(&handles, canonical_id).await?;
            println!("unlocked {canonical_id}");
        }
        Command::Reconcile { raw_id, his_number, source } => {
            let raw = RawPatientRecord {
                raw_id,
                his_number,
                source: source.into(),
                business_unit: None,
                demographics: Default::default(),
                document: None,
                email: None,
                phone: None,
                his_password: None,
                login_email: None,
                canonical_id: None,
                processed_at: None,
            };
            let outcome = engine::reconcile(&handles, &ReconcileEvent { raw }).await?;
            println!(
                "resulting_canonical_id={} match_type={}",
                outcome.resulting_canonical_id,
                outcome.match_type.as_str()
            );
        }
        Command::MatchingStats => {
            let rows = admin::matching_stats(&pool).await?;
            print_matching_stats(&rows, cli.format);
        }
        Command::MobileAppStats => {
            let stats = admin::mobile_app_stats(&pool).await?;
            match cli.format {
                Format::Table => {
                    println!("mobile_app_new     {}", stats.new_count);
                    println!("mobile_app_update  {}", stats.update_count);
                }
                Format::Json => {
                    println!(
                        "{}",
                        serde_json::json!({"new": stats.new_count, "update": stats.update_count})
                    );
                }
            }
        }
        Command::EngineHealth => {
            let health = admin::engine_health(&handles).await?;
            match cli.format {
                Format::Table => {
                    println!("backlog_size       {}", health.backlog_size);
                    println!(
                        "last_processed_at {}",
                        health
                            .last_processed_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string())
                    );
                    println!("retry_count        {}", health.retry_count);
                }
                Format::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "backlog_size": health.backlog_size,
                            "last_processed_at": health.last_processed_at.map(|t| t.to_rfc3339()),
                            "retry_count": health.retry_count,
                        })
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_matching_stats(rows: &[admin::MatchingStatsRow], format: Format) {
    match format {
        Format::Table => {
            for row in rows {
                println!("{:<20} {}", row.match_type, row.count);
            }
        }
        Format::Json => {
            let payload: Vec<_> = rows
                .iter()
                .map(|r| serde_json::json!({"match_type": r.match_type, "count": r.count}))
                .collect();
            println!("{}", serde_json::Value::Array(payload));
        }
    }
}
