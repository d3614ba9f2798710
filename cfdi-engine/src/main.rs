use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use cfdi_engine::config::EngineConfig;
use cfdi_engine::sat::CredentialContext;
use cfdi_engine::sync::DirectionFilter;
use cfdi_engine::Engine;
use sync_core::observability::init_tracing;

#[derive(Parser)]
#[command(name = "cfdi-engine", about = "CFDI invoice synchronization and reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a company by RFC.
    Register {
        rfc: String,
        name: String,
    },
    /// Synchronize invoices from the authority over a date range.
    Sync {
        rfc: String,
        /// First day of the range; defaults to the day of the latest
        /// known invoice, or 90 days back for a fresh company.
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day of the range; defaults to today.
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Limit the run to one direction.
        #[arg(long, value_enum, default_value_t = DirectionArg::Both)]
        direction: DirectionArg,
        /// Path to the company certificate (DER).
        #[arg(long)]
        certificate: PathBuf,
        /// Path to the company private key (DER).
        #[arg(long)]
        private_key: PathBuf,
        /// Certificate validity start; omit to skip the local check.
        #[arg(long)]
        valid_from: Option<DateTime<Utc>>,
        /// Certificate validity end; omit to skip the local check.
        #[arg(long)]
        valid_to: Option<DateTime<Utc>>,
    },
    /// Rebuild the structured database from the stored documents.
    Rebuild { rfc: String },
    /// Re-parse stored documents and refresh invoice fields.
    Refresh { rfc: String },
    /// Report integrity anomalies without changing anything.
    Verify { rfc: String },
    /// Create movements for invoices that lost theirs.
    Repair { rfc: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Issued,
    Received,
    Both,
}

impl From<DirectionArg> for DirectionFilter {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Issued => DirectionFilter::Issued,
            DirectionArg::Received => DirectionFilter::Received,
            DirectionArg::Both => DirectionFilter::Both,
        }
    }
}

const PASSPHRASE_ENV: &str = "CFDI_KEY_PASSPHRASE";
const FRESH_COMPANY_LOOKBACK_DAYS: i64 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load().context("loading configuration")?;
    init_tracing(&config.common.log_level);

    let engine = Engine::build(config).await?;

    match cli.command {
        Command::Register { rfc, name } => {
            let company = engine.register_company(&rfc, &name).await?;
            println!("registered {} ({})", company.rfc, company.company_id);
        }
        Command::Sync {
            rfc,
            start,
            end,
            direction,
            certificate,
            private_key,
            valid_from,
            valid_to,
        } => {
            let company = engine.company(&rfc).await?;
            let credential = load_credential(&company.rfc, &certificate, &private_key, valid_from, valid_to).await?;

            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            let start = match start {
                Some(start) => start,
                None => {
                    engine
                        .default_sync_start(&company, FRESH_COMPANY_LOOKBACK_DAYS)
                        .await?
                }
            };

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight work");
                    signal_cancel.cancel();
                }
            });

            let summary = engine
                .sync(&company, &credential, start, end, direction.into(), &cancel)
                .await?;
            println!(
                "windows {}/{} ok, discovered {}, downloaded {}, reused {}, ingested {}, existing {}, malformed {}, failed {}",
                summary.windows_completed,
                summary.windows_total,
                summary.discovered,
                summary.downloaded,
                summary.reused_local,
                summary.ingested,
                summary.already_ingested,
                summary.malformed,
                summary.failed_documents,
            );
            for failure in &summary.window_failures {
                println!("window {} ({}): {}", failure.window, failure.direction.as_str(), failure.reason);
            }
            if summary.quota_exhausted {
                println!("stopped early: authority quota exhausted; re-run later to continue");
            }
            if summary.cancelled {
                println!("stopped early: interrupted; completed work is preserved");
            }
        }
        Command::Rebuild { rfc } => {
            let company = engine.company(&rfc).await?;
            let report = engine.rebuild(&company).await?;
            println!(
                "documents {}, ingested {}, existing {}, malformed {}, failed {}",
                report.documents, report.ingested, report.already_ingested, report.malformed, report.failed,
            );
        }
        Command::Refresh { rfc } => {
            let company = engine.company(&rfc).await?;
            let report = engine.refresh(&company).await?;
            println!(
                "documents {}, updated {}, no matching invoice {}, malformed {}",
                report.documents, report.updated, report.missing_invoice, report.malformed,
            );
        }
        Command::Verify { rfc } => {
            let company = engine.company(&rfc).await?;
            let anomalies = engine.verify(&company).await?;
            if anomalies.is_empty() {
                println!("no anomalies");
            } else {
                for anomaly in &anomalies {
                    println!("{:?}", anomaly);
                }
                std::process::exit(1);
            }
        }
        Command::Repair { rfc } => {
            let company = engine.company(&rfc).await?;
            let created = engine.repair(&company).await?;
            println!("movements created: {}", created);
        }
    }

    Ok(())
}

async fn load_credential(
    rfc: &str,
    certificate: &PathBuf,
    private_key: &PathBuf,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
) -> anyhow::Result<CredentialContext> {
    let certificate = tokio::fs::read(certificate)
        .await
        .with_context(|| format!("reading certificate {}", certificate.display()))?;
    let private_key = tokio::fs::read(private_key)
        .await
        .with_context(|| format!("reading private key {}", private_key.display()))?;
    let passphrase = std::env::var(PASSPHRASE_ENV)
        .with_context(|| format!("{} must hold the key passphrase", PASSPHRASE_ENV))?;

    Ok(CredentialContext {
        rfc: rfc.to_string(),
        certificate,
        private_key,
        passphrase: SecretString::new(passphrase),
        not_before: valid_from.unwrap_or(DateTime::<Utc>::MIN_UTC),
        not_after: valid_to.unwrap_or(DateTime::<Utc>::MAX_UTC),
    })
}
