use openminerd_core::{ContainerConfig, ServiceContainer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let container = ServiceContainer::new(ContainerConfig::default());
    if let Err(e) = container.initialize().await {
        error!("initialization failed: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = container.start().await {
        error!("startup failed: {}", e);
        container.shutdown().await;
        std::process::exit(1);
    }

    info!("openminerd running, waiting for shutdown signal");
    wait_for_signal().await;

    info!("shutting down");
    container.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
