//! Tunnel Relay - CONNECT proxy built on the relay engine

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tunnel_relay::app::{metrics, Runtime};
use tunnel_relay::config::Config;
use tunnel_relay::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let sample = serde_json::to_string_pretty(&Config::sample())
            .map_err(|e| Error::Config(format!("Failed to render sample config: {}", e)))?;
        println!("{}", sample);
        return Ok(());
    }

    // Load configuration before logging so its level can apply
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if args.config.is_none() {
        info!("No config file specified, using defaults");
    }
    info!("Tunnel Relay v{} starting...", env!("CARGO_PKG_VERSION"));
    metrics::init_metrics();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Tunnel Relay - CONNECT proxy with peer failover

USAGE:
    tunnel-relay [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print a sample configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tunnel-relay -c relay.json
    tunnel-relay --gen-config > relay.json
    RUST_LOG=debug tunnel-relay -c relay.json

SIGNALS:
    SIGUSR1                 Log relay statistics
"#
    );
}

fn print_version() {
    println!("Tunnel Relay v{}", env!("CARGO_PKG_VERSION"));
}
