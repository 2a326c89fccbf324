use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use docq_core::{DocqConfig, RocksDbStore};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "docq-server", about = "Serve a docq store over HTTP")]
struct Args {
    /// Config file (default: docq.toml, then /etc/docq/docq.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    docq_core::telemetry::init_tracing();

    let args = Args::parse();
    let config = DocqConfig::discover(args.config.as_deref())?;
    let store = Arc::new(RocksDbStore::open(&config.storage.data_dir)?);

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        data_dir = %config.storage.data_dir,
        "starting docq server"
    );

    docq_server::serve(listener, store, shutdown_signal()).await?;

    info!("docq server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    info!("received shutdown signal");
}
