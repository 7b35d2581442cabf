use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use phantom_scheduler::config::{LogFormat, LoggingConfig, SchedulerConfig};
use phantom_scheduler::proto::client::{self, SubmitMode};

#[derive(Parser)]
#[command(
    name = "phantom-scheduler",
    about = "TCP job scheduler for a pool of external worker processes",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler (inbound server + worker slots)
    Serve {
        /// Path to a TOML config file
        #[arg(long, env = "PHANTOM_SCHEDULER_CONFIG")]
        config: Option<PathBuf>,

        /// Number of worker slots
        #[arg(long)]
        slots: Option<usize>,

        /// First port for the inbound server; Nodes follow it
        #[arg(long)]
        base_port: Option<u16>,

        /// Queueing command used to start workers (e.g. "qsub")
        #[arg(long)]
        queue_cmd: Option<String>,

        /// Worker program started through the queueing command
        #[arg(long)]
        runner: Option<String>,

        /// Print a JSON summary of every slot on exit
        #[arg(long)]
        json: bool,
    },

    /// Submit a job to a running scheduler
    Submit {
        /// Inbound server address
        #[arg(long, default_value = "127.0.0.1:9000")]
        server: String,

        /// Wait for the job's completion code
        #[arg(long)]
        blocking: bool,

        /// Local port for the completion callback (0 picks a free port)
        #[arg(long, default_value = "0")]
        callback_port: u16,

        /// Seconds to wait for the completion callback
        #[arg(long, default_value = "3600")]
        timeout: u64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Job payload (use EXIT to drain and stop the scheduler)
        payload: String,
    },

    /// Run as a worker connected to a scheduler slot
    #[command(disable_help_flag = true)]
    Worker {
        /// Scheduler host
        #[arg(short = 'h', long = "host")]
        host: String,

        /// Slot port
        #[arg(short = 'p', long = "port")]
        port: u16,

        /// Print help
        #[arg(long, action = clap::ArgAction::Help)]
        help: Option<bool>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            slots,
            base_port,
            queue_cmd,
            runner,
            json,
        } => {
            let mut cfg = match &config {
                Some(path) => SchedulerConfig::load(path)?,
                None => SchedulerConfig::load_or_default(),
            };
            if let Some(slots) = slots {
                cfg.pool.slots = slots;
            }
            if let Some(port) = base_port {
                cfg.network.base_port = port;
            }
            if let Some(cmd) = queue_cmd {
                cfg.launch.queue_cmd = cmd;
            }
            if let Some(runner) = runner {
                cfg.launch.runner = runner;
            }

            init_tracing(&cfg.logging);
            if let Some(path) = &config {
                tracing::info!(path = %path.display(), "using configuration file");
            }
            let reports = phantom_scheduler::serve(cfg).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
        }
        Commands::Submit {
            server,
            blocking,
            callback_port,
            timeout,
            json,
            payload,
        } => {
            init_tracing(&LoggingConfig {
                level: "warn".to_string(),
                ..LoggingConfig::default()
            });

            let mode = if blocking {
                SubmitMode::Blocking {
                    port: callback_port,
                    wait: Duration::from_secs(timeout),
                }
            } else {
                SubmitMode::NonBlocking
            };
            let report = client::submit(&server, payload.as_bytes(), mode)
                .await
                .with_context(|| format!("failed to submit job to {}", server))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match &report.code {
                    Some(code) => println!("{}", code),
                    None => println!("submitted"),
                }
            }
        }
        Commands::Worker { host, port, .. } => {
            init_tracing(&LoggingConfig::default());
            tracing::info!(%host, %port, "Starting worker");
            let completed = phantom_scheduler::worker::run(&host, port)
                .await
                .with_context(|| format!("worker for {}:{} failed", host, port))?;
            tracing::info!(completed, "worker finished");
        }
    }

    Ok(())
}
