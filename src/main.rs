use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use apiwatch::config::{AnalyzerConfig, LoggingConfig};
use apiwatch::detect::{IncidentStatus, IncidentType};
use apiwatch::storage::Transition;

#[derive(Parser)]
#[command(
    name = "apiwatch",
    about = "Anomaly detection and incident tracking for API telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file (falls back to $APIWATCH_CONFIG, then /etc/apiwatch/apiwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (intake API + scan loop + RCA workers)
    Serve {
        /// Bind address, overrides intake.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Replay an NDJSON telemetry capture, then run one scan cycle
    Replay {
        /// NDJSON file, one event per line
        #[arg(long)]
        file: PathBuf,
    },

    /// Inspect and manage incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List incidents, newest first
    List {
        /// Filter by status (OPEN, ACKNOWLEDGED, RESOLVED)
        #[arg(long)]
        status: Option<String>,

        /// Filter by type (ERROR_SPIKE, LATENCY_REGRESSION, TRAFFIC_DROP, CONTRACT_BREAK)
        #[arg(long = "type")]
        kind: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one incident with its evidence and RCA report
    Show { id: Uuid },

    /// Acknowledge an OPEN incident
    Ack { id: Uuid },

    /// Resolve an incident
    Resolve { id: Uuid },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AnalyzerConfig> {
    let config = match path {
        Some(path) => AnalyzerConfig::load(path)?,
        None => AnalyzerConfig::load_or_default(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.intake.bind = bind;
            }
            tracing::info!(bind = %config.intake.bind, "Starting apiwatch daemon");
            apiwatch::serve(config).await?;
        }
        Commands::Replay { file } => {
            let (report, summary) = apiwatch::replay(&config, &file).await?;
            println!("Events accepted:    {}", report.accepted);
            println!("Events rejected:    {}", report.rejected);
            println!("Endpoints scanned:  {}", summary.endpoints_scanned);
            println!("Endpoints skipped:  {}", summary.endpoints_skipped);
            println!("Endpoint failures:  {}", summary.endpoint_failures);
            println!("Incidents raised:   {}", summary.incidents_raised);
        }
        Commands::Incidents { action } => {
            let store = apiwatch::open_store(&config)?;

            match action {
                IncidentAction::List { status, kind, json } => {
                    let status = match status {
                        Some(s) => match IncidentStatus::parse(&s) {
                            Some(status) => Some(status),
                            None => bail!("unknown status '{s}'"),
                        },
                        None => None,
                    };
                    let kind = match kind {
                        Some(k) => match IncidentType::parse(&k) {
                            Some(kind) => Some(kind),
                            None => bail!("unknown incident type '{k}'"),
                        },
                        None => None,
                    };

                    let list = store.list_incidents(status, kind)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&list)?);
                    } else if list.is_empty() {
                        println!("No incidents found.");
                    } else {
                        println!(
                            "{:<36} | {:<18} | {:<8} | {:<12} | {:<24} | Endpoint",
                            "ID", "Type", "Severity", "Status", "Detected"
                        );
                        println!("{:-<36}-|-{:-<18}-|-{:-<8}-|-{:-<12}-|-{:-<24}-|-{:-<20}", "", "", "", "", "", "");
                        for i in list {
                            println!(
                                "{:<36} | {:<18} | {:<8} | {:<12} | {:<24} | {}",
                                i.id,
                                i.kind,
                                i.severity,
                                i.status,
                                apiwatch::storage::fmt_ts(i.detected_at),
                                i.endpoint
                            );
                        }
                    }
                }
                IncidentAction::Show { id } => {
                    let Some(incident) = store.get_incident(id)? else {
                        bail!("incident {id} not found");
                    };
                    let evidence = store.evidence_for(id)?;
                    let report = store.rca_report(id)?;
                    let out = serde_json::json!({
                        "incident": incident,
                        "evidence": evidence,
                        "rca_report": report,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                IncidentAction::Ack { id } => match store.acknowledge_incident(id, Utc::now())? {
                    Transition::Applied(_) => println!("Incident {id} acknowledged."),
                    Transition::NotFound => bail!("incident {id} not found"),
                    Transition::Conflict(i) => {
                        bail!("incident {id} is {}, only OPEN incidents can be acknowledged", i.status)
                    }
                },
                IncidentAction::Resolve { id } => match store.resolve_incident(id, Utc::now())? {
                    Transition::Applied(_) => println!("Incident {id} resolved."),
                    Transition::NotFound => bail!("incident {id} not found"),
                    Transition::Conflict(i) => bail!("incident {id} cannot be resolved from {}", i.status),
                },
            }
        }
    }

    Ok(())
}
