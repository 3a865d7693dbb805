use std::sync::Arc;

use afk_keeper::bridge::BridgeConnector;
use afk_keeper::config::Config;
use afk_keeper::engine::supervisor::{RunOutcome, Supervisor};
use afk_keeper::lifecycle::{panic_message, ShutdownManager, ShutdownReason};
use afk_keeper::{liveness, metrics};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    metrics::register_metrics();

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    shutdown.install_panic_hook();

    tracing::info!(
        "Keeping {} online on {}:{} (versions: {}, reconnect mode: {:?})",
        config.username,
        config.host,
        config.port,
        config.versions.join(", "),
        config.reconnect_mode
    );

    let http = tokio::spawn(liveness::serve(config.http_port, shutdown.token()));

    // The engine runs in its own task so a panic there still lets us report and exit
    let connector = Arc::new(BridgeConnector::new(config.bridge_addr.clone()));
    let mut supervisor = Supervisor::new(&config, connector);
    let token = shutdown.token();
    let engine = tokio::spawn(async move { supervisor.run(token).await });

    let exit_code = match engine.await {
        Ok(RunOutcome::Stopped) => shutdown.reason().map_or(0, |reason| reason.exit_code()),
        Ok(outcome @ RunOutcome::ConnectionFailed(_)) => {
            shutdown.shutdown(ShutdownReason::Fatal("connection failed".to_string()));
            outcome.exit_code()
        }
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic().as_ref());
            shutdown.shutdown(ShutdownReason::Fatal(message));
            1
        }
        Err(e) => {
            tracing::error!("Session engine task failed: {}", e);
            shutdown.shutdown(ShutdownReason::Fatal(e.to_string()));
            1
        }
    };

    let _ = http.await;
    tracing::info!("Exiting with status {}", exit_code);
    std::process::exit(exit_code);
}
