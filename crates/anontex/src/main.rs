//! AnonTex command-line interface

use anontex_core::{build_router, spawn_expiry_sweeper, AppContext, Config};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the anonymizing proxy
    Run(RunArgs),
    /// Print the version
    Version,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    #[arg(long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Port to listen on (overrides config and ANONTEX_PORT)")]
    pub port: Option<u16>,

    #[arg(long, help = "Address to bind (overrides config and ANONTEX_HOST)")]
    pub host: Option<String>,

    #[arg(long, default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,

    #[arg(
        long,
        help = "Keep existing mappings (by default, the mapping store is cleared on each run)"
    )]
    pub keep_database: bool,
}

fn version_string() -> String {
    format!("AnonTex v{}", env!("CARGO_PKG_VERSION"))
}

fn init_logging(log_level: &str) {
    let level = log_level.parse::<tracing::Level>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        tracing::Level::INFO
    });

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = match args.config.as_ref() {
        Some(config_path) => {
            info!("Loading configuration from: {}", config_path.display());
            Config::from_file(config_path)?
        }
        None => match Config::get_default_config_path() {
            Ok(default_path) if default_path.exists() => {
                info!("Loading configuration from default location: {}", default_path.display());
                Config::from_file(&default_path)?
            }
            Ok(default_path) => {
                info!("Creating default configuration at: {}", default_path.display());
                let mut config = Config::default();
                config.resolve_paths()?;
                config.to_file(&default_path)?;
                config
            }
            Err(_) => {
                info!("Using default configuration (could not determine config directory)");
                let mut config = Config::default();
                config.resolve_paths()?;
                config
            }
        },
    };

    config.apply_env_overrides()?;
    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    if let Some(host) = args.host.as_ref() {
        config.proxy.host = host.clone();
    }
    config.resolve_paths()?;
    config.validate()?;
    info!("Configuration validated successfully");

    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let addr = format!("{}:{}", config.proxy.host, config.proxy.port);

    let ctx = Arc::new(AppContext::from_config(config).context("Failed to start service")?);

    if args.keep_database {
        info!("Keeping existing mappings");
    } else {
        let removed = ctx.store.clear_all().await?;
        if removed > 0 {
            info!("Cleared {} stale mappings (use --keep-database to preserve them)", removed);
        }
    }

    let sweeper = spawn_expiry_sweeper(ctx.store.clone(), ctx.store.sweep_interval());
    let app = build_router(Arc::clone(&ctx));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("AnonTex listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    match ctx.store.statistics().await {
        Ok(stats) => info!(
            "Shutting down: {} live mappings, {} expired awaiting sweep",
            stats.live_records, stats.expired_records
        ),
        Err(e) => warn!("Could not read mapping statistics: {}", e),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("{}", version_string());
            Ok(())
        }
        Command::Run(args) => {
            init_logging(&args.log_level);
            info!("Starting {}", version_string());
            run(args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["anontex", "run"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };

        assert!(args.config.is_none());
        assert!(args.port.is_none());
        assert!(args.host.is_none());
        assert_eq!(args.log_level, "info");
        assert!(!args.keep_database);
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "anontex",
            "run",
            "--config",
            "/etc/anontex.toml",
            "--port",
            "9000",
            "--host",
            "127.0.0.1",
            "--keep-database",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };

        assert_eq!(args.config, Some(PathBuf::from("/etc/anontex.toml")));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
        assert!(args.keep_database);
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(Cli::try_parse_from(["anontex", "run", "--port", "not-a-port"]).is_err());
        assert!(Cli::try_parse_from(["anontex"]).is_err());
    }

    #[test]
    fn test_version_subcommand() {
        let cli = Cli::try_parse_from(["anontex", "version"]).unwrap();
        assert!(matches!(cli.command, Command::Version));
        assert!(version_string().starts_with("AnonTex v"));
    }

    #[test]
    fn test_load_config_from_file_with_flag_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("anontex.toml");
        std::fs::write(
            &config_path,
            format!(
                "[proxy]\nupstream_url = \"http://localhost:4000/\"\nport = 8100\n\n\
                 [mapping]\ndatabase_path = \"{}\"\n",
                dir.path().join("m.db").display()
            ),
        )
        .unwrap();

        let args = RunArgs {
            config: Some(config_path),
            port: Some(8200),
            host: Some("127.0.0.1".to_string()),
            log_level: "info".to_string(),
            keep_database: false,
        };
        let config = load_config(&args).unwrap();

        assert_eq!(config.proxy.port, 8200);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.upstream_base(), "http://localhost:4000");
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("anontex.toml");
        std::fs::write(
            &config_path,
            "[proxy]\nupstream_url = \"ftp://nope\"\n\n[mapping]\ndatabase_path = \":memory:\"\n",
        )
        .unwrap();

        let args = RunArgs {
            config: Some(config_path),
            port: None,
            host: None,
            log_level: "info".to_string(),
            keep_database: false,
        };
        assert!(load_config(&args).is_err());
    }
}
