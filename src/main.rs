use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info};

use stashproxy::{
    run_console, CertificateHint, CommandCertificateHint, Config, NoopCertificateHint,
    ProxyServer, ProxyState, VERSION,
};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run());

    // A pending stdin read would otherwise hold the runtime open until the next line
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_format);

    info!("Starting StashProxy {}...", VERSION);

    let certs: Arc<dyn CertificateHint> = match &config.cert_tool {
        Some(tool) => {
            let hint = CommandCertificateHint::new(tool.clone(), config.cert_dir.clone());
            hint.install().await;
            Arc::new(hint)
        }
        None => {
            info!("[CERT] CERT_TOOL not set, certificate hints disabled");
            Arc::new(NoopCertificateHint)
        }
    };

    let console_enabled = config.console_enabled;
    let state = ProxyState::load(config, certs).await?;
    info!(
        "Loaded {} cached sites and {} blocked sites",
        state.cache.len().await,
        state.blocklist.len().await
    );

    let server = ProxyServer::bind(state).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Shutdown signal received");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        }
    });

    if console_enabled {
        let state = server.state();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_console(stdin, tokio::io::stdout(), &state, shutdown).await {
                error!("Console error: {}", e);
            }
        });
    }

    server.run().await;
    info!("StashProxy stopped");
    Ok(())
}

fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
