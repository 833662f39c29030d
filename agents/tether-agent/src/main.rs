//! Tether Agent CLI Entry Point
//!
//! This is the main entry point for the Tether Agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_agent::cli::config::{Config, LoggingConfig};
use tether_agent::connection::certificate::CertificateAuthenticator;
use tether_agent::connection::client::ResilientClient;
use tether_agent::shipping::record::{ExecutionContext, LogLevel, LogRecord, WorkflowContext};
use tether_agent::shipping::shipper::BatchShipper;

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(author, version, about = "Tether Agent - Resilient log delivery to a remote collector")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Base64-encoded client certificate, overrides the config file
    #[arg(long, env = "TETHER_CLIENT_CERTIFICATE", hide_env_values = true)]
    certificate: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read log lines from stdin and ship them to the collector
    Ship {
        /// Workflow the records belong to
        #[arg(long)]
        workflow_id: Option<String>,

        /// Workflow type name
        #[arg(long, requires = "workflow_id")]
        workflow_type: Option<String>,

        /// Agent emitting the records
        #[arg(long, requires = "workflow_id")]
        agent: Option<String>,

        /// Level for plain-text lines
        #[arg(short, long, default_value = "information")]
        level: LogLevel,
    },
    /// Check collector connectivity and certificate
    Check,
    /// Validate the configuration and certificate without connecting
    Validate,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        show_version();
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;
    if let Some(certificate) = cli.certificate {
        config.collector.certificate = Some(certificate);
    }

    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Ship {
            workflow_id,
            workflow_type,
            agent,
            level,
        } => {
            let context = match workflow_id {
                Some(id) => {
                    let mut workflow = WorkflowContext::new(id);
                    workflow.workflow_type = workflow_type;
                    workflow.agent = agent;
                    ExecutionContext::WorkflowScoped(workflow)
                }
                None => ExecutionContext::Ambient,
            };
            ship(&config, context, level).await?;
        }
        Commands::Check => {
            check(&config).await?;
        }
        Commands::Validate => {
            validate(&config)?;
        }
        Commands::Version => show_version(),
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        eprintln!(
            "Config file {} not found, using defaults",
            path.display()
        );
        Ok(Config::default_config())
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn ship(config: &Config, context: ExecutionContext, level: LogLevel) -> Result<()> {
    config.validate()?;
    info!(source_id = %config.source_id, collector = %config.collector.base_url, "Starting log shipping");

    let client = Arc::new(
        ResilientClient::from_config(&config.collector)
            .context("Failed to create collector client")?,
    );
    let shipper = BatchShipper::from_config(Arc::clone(&client), &config.collector, &config.shipping)?;

    if config.shipping.enabled {
        shipper.initialize()?;
    } else {
        warn!("Shipping disabled in configuration, records will be discarded");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let record = parse_line(&line, level)
                    .with_property("source", config.source_id.as_str());
                shipper.enqueue_in(&context, record);
            }
            _ = &mut interrupt => {
                info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    shipper.shutdown().await;
    client.dispose();

    let stats = shipper.stats();
    println!("Delivered: {}", stats.delivered_count);
    println!("Dropped:   {}", stats.dropped_count);
    println!("Queued:    {}", stats.queued_count);
    Ok(())
}

/// JSON lines are taken as full records, anything else becomes the message
fn parse_line(line: &str, level: LogLevel) -> LogRecord {
    match serde_json::from_str::<LogRecord>(line) {
        Ok(mut record) => {
            if !record.has_id() {
                record.id = uuid::Uuid::new_v4().to_string();
            }
            record
        }
        Err(_) => LogRecord::new(level, line),
    }
}

async fn check(config: &Config) -> Result<()> {
    let client = ResilientClient::from_config(&config.collector)
        .context("Failed to create collector client")?;

    println!("Collector: {}", config.collector.base_url);
    match client.check_health().await {
        Ok(healthy) => println!("  Health: {}", if healthy { "healthy" } else { "unhealthy" }),
        Err(e) => println!("  Health: error - {}", e),
    }
    println!("  State: {}", client.state());

    if let Some(certificate) = client.certificate() {
        println!("  Certificate: {}", certificate.subject());
        println!("  Thumbprint: {}", certificate.thumbprint());
        println!("  Expires: {}", certificate.not_after());
    }

    client.dispose();
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    config.validate()?;
    println!("Configuration: ok");

    let encoded = config.collector.load_certificate()?;
    let certificate = CertificateAuthenticator::new()
        .authenticate(&encoded)
        .context("Client certificate rejected")?;

    println!("Certificate: {}", certificate.subject());
    println!("  Valid: {} to {}", certificate.not_before(), certificate.not_after());
    println!("  Thumbprint: {}", certificate.thumbprint());
    Ok(())
}

fn show_version() {
    println!("tether-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Resilient structured log delivery");
    println!();
    println!("Features:");
    println!("  - Certificate-authenticated collector connections");
    println!("  - Health-checked connection pooling with single-flight reconnect");
    println!("  - Batched background shipping with bounded per-record retries");
}
