//! # PPE Frame Relay Server
//!
//! Accepts browser WebSocket connections that stream encoded camera frames,
//! relays them one at a time to a long-running detection worker, pushes the
//! detections back to the originating browser, and raises debounced
//! safety-equipment violation alerts.
//!
//! ## Endpoints
//! - `GET /ws`: the frame/result WebSocket.
//! - `GET /health`: liveness, always `{"ok":true}`.
//! - `GET /proxy?url=...`: range-capable relay for remote video sources.
//!
//! Alerts are also handed to the optional PostgreSQL store (`DATABASE_URL`)
//! and webhook notifier (`RELAY_NOTIFY_WEBHOOK_URL`).

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

use lib_common::connections::PostgresViolationStore;
use lib_common::core::{AlertSinks, RelayController};
use lib_common::inference::spawn_worker;
use lib_common::retrieve::{StreamProxy, WebhookNotifier};

mod relay_logic;
use relay_logic::config::Settings;
use relay_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config()?;
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!(
        "Starting relay on port {} with worker '{} {}'",
        settings.port,
        settings.worker_program,
        settings.worker_args.join(" ")
    );

    let sinks = build_sinks(&settings).await;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (channel, worker) = spawn_worker(&settings.worker_program, &settings.worker_args, events_tx)?;
    let (controller, relay) = RelayController::new(settings.controller.clone(), channel, events_rx, sinks);
    let controller_task = controller.spawn();

    let proxy = StreamProxy::new(settings.proxy_timeout)?;
    let app_state = state::AppState::new(relay.clone(), proxy, settings.outbound_buffer);

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut server = tokio::spawn(downstream::run(settings.clone(), app_state, shutdown_tx.subscribe()));

    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };
    match early_exit {
        None => {
            log::info!("Shutdown signal received, closing server gracefully.");
            let _ = shutdown_tx.send(());
            let _ = relay.shutdown();
            report_server_exit(server.await);
        }
        Some(result) => {
            report_server_exit(result);
            let _ = relay.shutdown();
        }
    }

    match controller_task.await {
        Ok(channel) => channel.close(),
        Err(e) => log::error!("Relay controller task failed: {}", e),
    }
    worker.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}

fn report_server_exit(result: Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => log::info!("Downstream server stopped."),
        Ok(Err(e)) => log::error!("Downstream server failed: {:#}", e),
        Err(e) => log::error!("Downstream server task failed: {}", e),
    }
}

async fn build_sinks(settings: &Settings) -> AlertSinks {
    let mut sinks = AlertSinks::new();

    match &settings.database_url {
        Some(url) => match PostgresViolationStore::new(url) {
            Ok(store) => {
                if let Err(e) = store.ensure_schema().await {
                    log::warn!("Could not prepare violation table yet: {}", e);
                }
                sinks.push(Arc::new(store));
            }
            Err(e) => log::warn!("Violation persistence disabled: {}", e),
        },
        None => log::info!("DATABASE_URL not set, violations are not persisted."),
    }

    match &settings.notify_webhook_url {
        Some(url) => match WebhookNotifier::new(url) {
            Ok(notifier) => sinks.push(Arc::new(notifier)),
            Err(e) => log::warn!("Notifications disabled: {:#}", e),
        },
        None => log::info!("No notification webhook configured."),
    }

    sinks
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
