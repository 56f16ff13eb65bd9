use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hdcp_agent::config::AgentConfig;
use hdcp_agent::service::{ServiceHost, SimulatedOutputs};
use hdcp_core::ksv;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hdcp-agent")]
#[command(about = "HDCP link authentication agent")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate every configured output against simulated receivers
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Check that a key-selection vector has twenty bits set
    CheckKsv {
        /// 40-bit value in hex, e.g. 0x5a5a5a5a5a
        ksv: String,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

fn init_tracing(config: &AgentConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(format!(
        "hdcp_agent={level},hdcp_core={level},hdcp_transport={level}",
        level = config.log_level
    ))
    .context("invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let guard = match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("log_file must name a file")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            if config.log_json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_ansi(false).with_writer(writer).init();
            }
            Some(guard)
        }
        None => {
            if config.log_json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    };
    Ok(guard)
}

fn parse_ksv(text: &str) -> anyhow::Result<u64> {
    let digits = text.trim().trim_start_matches("0x");
    let value = u64::from_str_radix(digits, 16).with_context(|| format!("not hex: {text}"))?;
    anyhow::ensure!(value >> 40 == 0, "{text} is wider than 40 bits");
    Ok(value)
}

async fn run(config: AgentConfig, duration: Option<Duration>) -> anyhow::Result<()> {
    let mut service = SimulatedOutputs::new(config.clone());
    service.start().await?;
    info!(outputs = config.outputs.len(), "hdcp-agent started");

    if !service.settle(Duration::from_secs(config.settle_timeout_secs)).await {
        warn!("outputs still authenticating after settle timeout");
    }

    let stop = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::pin!(stop);

    let mut ticker = tokio::time::interval(Duration::from_secs(config.status_interval_secs));
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                for (output, status) in service.report() {
                    info!(
                        %output,
                        state = ?status.state,
                        verifications = status.verifications,
                        failures = status.failures,
                        "output status"
                    );
                }
            }
        }
    }
    info!("shutdown requested");

    let report: Vec<_> = service.report().into_iter().map(|(_, s)| s).collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    service.stop().await;
    info!("hdcp-agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load_from_file(path)?,
        None => {
            let config = AgentConfig::load_from_env();
            config.validate()?;
            config
        }
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    match args.command.unwrap_or(Command::Run {
        duration_secs: None,
    }) {
        Command::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::CheckKsv { ksv: text } => {
            let value = parse_ksv(&text)?;
            let ones = value.count_ones();
            if ksv::is_well_formed(value) {
                println!("{}: well formed", ksv::to_hex(value));
                Ok(())
            } else {
                anyhow::bail!("{}: {ones} bits set, expected 20", ksv::to_hex(value))
            }
        }
        Command::Run { duration_secs } => {
            let _guard = init_tracing(&config)?;
            run(config, duration_secs.map(Duration::from_secs)).await
        }
    }
}
