use crate::relay_logic::config::Settings;
use crate::relay_logic::model::ClientMessage;
use crate::relay_logic::proxy::proxy_handler;
use crate::relay_logic::state::AppState;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::header,
    response::IntoResponse,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use lib_common::core::{RelayError, SessionId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_RANGE, header::ACCEPT_RANGES]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/proxy", get(proxy_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(settings: Settings, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some((cert_path, key_path)) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("Failed to load TLS configuration")?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        log::info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        log::info!("Downstream server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                log::info!("Downstream server shutting down.");
            })
            .await?;
    }
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.outbound_buffer);
    let session_id = match state.relay.connect(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Rejecting connection: {}", e);
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = outbound_rx.recv() => match event {
                Some(event) => match event.to_json() {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to encode event for session {}: {}", session_id, e),
                },
                // The controller dropped the session.
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(&state, session_id, text.as_str()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(frame))) => {
                    if state.relay.frame_data(session_id, frame).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error for session {}: {}", session_id, e);
                    break;
                }
            },
        }
    }

    let _ = state.relay.disconnect(session_id);
}

/// Unreadable client messages are logged and skipped; only a stopped
/// controller is an error.
fn handle_text(state: &AppState, session_id: SessionId, text: &str) -> Result<(), RelayError> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => match msg.frame_meta() {
            Some(meta) => return state.relay.frame_meta(session_id, meta),
            None => log::debug!("Ignoring message from session {}: {}", session_id, text),
        },
        Err(e) => log::warn!("Malformed message from session {}: {}", session_id, e),
    }
    Ok(())
}
