//! CodeSync relay server.
//!
//! Loads `ServerConfig` from an optional TOML file, applies command-line
//! overrides, and serves until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use codesync_collab::{ServerConfig, SyncServer};
use log::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Real-time document sync relay", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "CODESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "CODESYNC_BIND")]
    bind: Option<String>,

    /// Redis URL for cross-instance fan-out
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// RocksDB directory for documents (in-memory when absent)
    #[arg(long, value_name = "DIR", env = "CODESYNC_STORAGE")]
    storage: Option<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig, codesync_collab::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(url) = &self.redis_url {
            config.redis_url = Some(url.clone());
        }
        if let Some(path) = &self.storage {
            config.storage_path = Some(path.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting CodeSync server...");
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let running = server.clone();
    let mut serve = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut serve => {
            return match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!("Failed to bind {}: {e}", server.config().bind_addr);
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!("Server task failed: {e}");
                    ExitCode::FAILURE
                }
            };
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {e}");
            }
        }
    }

    server.shutdown();
    let _ = serve.await;
    info!("Bye");
    ExitCode::SUCCESS
}
