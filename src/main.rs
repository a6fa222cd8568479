use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use casebench::config::OrchestratorConfig;
use casebench::job::{ExecutionJob, JobRequest, JobStatus};
use casebench::scheduler::StopFlags;
use casebench::storage::Store;

#[derive(Parser)]
#[command(
    name = "casebench",
    about = "Data-driven test execution orchestrator with disposable browser environments",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = "CASEBENCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (intake API + event dispatcher)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run one job in the foreground and print its summary
    Run {
        /// Job description (JSON)
        #[arg(long)]
        job: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Request a cooperative stop of a job
    Stop {
        /// Execution id
        execution_id: String,
    },

    /// Show the ports recorded for a job's browser container
    Ports {
        /// Execution id
        execution_id: String,
    },
}

fn open_store(config: &OrchestratorConfig) -> Result<Store> {
    Store::open(&config.paths.database.to_string_lossy())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::load_or_default(cli.config.as_deref());

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting casebench daemon");
            casebench::serve(&bind, config).await?;
        }
        Commands::Run { job, json } => {
            let raw = std::fs::read_to_string(&job)
                .with_context(|| format!("failed to read job file {}", job.display()))?;
            let request: JobRequest = serde_json::from_str(&raw)
                .with_context(|| format!("invalid job file {}", job.display()))?;
            let job = ExecutionJob::from_request(request, config.credentials.resolve_secret())?;

            let summary = casebench::run_job(config, job).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\nExecution {}: {}", summary.job_id, summary.status);
                println!("{:<6} | {:<38} | {:<10} | Error", "Row", "Case", "Status");
                println!("{:-<6}-|-{:-<38}-|-{:-<10}-|-{:-<30}", "", "", "", "");
                for case in &summary.cases {
                    let error = case.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
                    println!(
                        "{:<6} | {:<38} | {:<10} | {}",
                        case.row_index, case.case_id, case.status, error
                    );
                }
                if summary.not_started > 0 {
                    println!("{} case(s) not started", summary.not_started);
                }
                for failure in &summary.failures {
                    println!(" - {failure}");
                }
                println!();
            }
            if summary.status == JobStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Stop { execution_id } => {
            let store = open_store(&config)?;
            StopFlags::request_stop(&store, &execution_id)?;
            println!("Stop requested for {execution_id}.");
        }
        Commands::Ports { execution_id } => {
            let store = open_store(&config)?;
            match store.ports_for(&execution_id)? {
                Some(ports) => println!(
                    "{}: selenium {} / display {}",
                    ports.execution_id, ports.selenium_port, ports.vnc_port
                ),
                None => println!("No ports recorded for {execution_id}."),
            }
        }
    }

    Ok(())
}
