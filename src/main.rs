use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobworker::config::ServerConfig;
use jobworker::grpc::GrpcServer;
use jobworker::manager::JobManager;
use jobworker::tls::TlsMaterial;

#[derive(Parser, Debug)]
#[command(name = "jobworker")]
#[command(about = "Remote job execution service with cgroup-v2 limits and live log streaming")]
struct Args {
    /// Port to listen on (overrides JOBWORKER_SERVER_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding server.crt, server.key and ca.crt
    /// (overrides JOBWORKER_SERVER_CERT_DIR)
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Run jobs without cgroups or namespace isolation
    /// (overrides JOBWORKER_SERVER_TEST)
    #[arg(long)]
    test_mode: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cert_dir) = self.cert_dir {
            config.cert_dir = cert_dir;
        }
        if self.test_mode {
            config.test_mode = true;
        }
        config
    }
}

/// Returns a token that fires on SIGTERM or SIGINT.
fn install_shutdown_handler() -> Result<CancellationToken, std::io::Error> {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        handler_token.cancel();
    });

    Ok(token)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();

    tracing::info!(
        port = config.port,
        cert_dir = %config.cert_dir.display(),
        test_mode = config.test_mode,
        "starting jobworker"
    );

    let shutdown = install_shutdown_handler()?;
    let tls = TlsMaterial::load_server(&config.cert_dir).await?;
    let manager = Arc::new(JobManager::new()?);

    let server = GrpcServer::new(config, tls, manager.clone());
    server.run(shutdown).await?;

    manager.close();

    Ok(())
}
