use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use strata_core::settings::ServerSettings;
use strata_engine::ContextService;
use strata_telemetry::TelemetryGuard;

use crate::client::{self, ClientId, ClientRegistry};
use crate::handlers::HandlerState;
use crate::rpc::{RpcRequest, RpcResponse};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.max_send_queue,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn start(config: ServerConfig, service: Arc<ContextService>) -> Result<ServerHandle, std::io::Error> {
    start_with_telemetry(config, service, None).await
}

/// Bind and start serving. Returns a handle that keeps the background tasks alive.
pub async fn start_with_telemetry(
    config: ServerConfig,
    service: Arc<ContextService>,
    telemetry: Option<Arc<TelemetryGuard>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), std::time::Duration::from_secs(60));

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let mut handler_state = HandlerState::new(service, Arc::clone(&client_registry));
    if let Some(telemetry) = telemetry {
        handler_state = handler_state.with_telemetry(telemetry);
    }
    let handler_state = Arc::new(handler_state);

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
    };
    let rpc = tokio::spawn(process_rpc_messages(msg_rx, handler_state, Arc::clone(&client_registry)));

    let router = build_router(app_state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "strata server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
        rpc,
        cleanup,
    })
}

pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and end the background tasks.
    pub fn shutdown(self) {
        self.server.abort();
        self.rpc.abort();
        self.cleanup.abort();
        tracing::info!(port = self.port, "strata server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    client::handle_ws_connection(
        socket,
        client_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        state.message_tx,
    )
    .await;

    let subscriptions = state.client_registry.unregister(&client_id).await;
    for sub in &subscriptions {
        state.handler_state.service.unsubscribe(sub);
    }
    tracing::info!(client_id = %client_id, closed = subscriptions.len(), "websocket client disconnected");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(&state.handler_state, None, "health", &serde_json::json!({}), None).await;

    let healthy = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        == Some("healthy");
    let http_status = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(resp.result.unwrap_or_default()))
}

async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    registry.send_to(&client_id, json).await;
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));
        let response =
            crate::handlers::dispatch(&state, Some(&client_id), &request.method, &params, request.id).await;

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::StrataSettings;
    use strata_store::Database;

    fn service() -> Arc<ContextService> {
        Arc::new(ContextService::init(&StrataSettings::default(), Database::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, service()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn rpc_messages_are_answered_on_the_client_queue() {
        let registry = Arc::new(ClientRegistry::new(32));
        let state = Arc::new(HandlerState::new(service(), Arc::clone(&registry)));
        let (client_id, mut out) = registry.register();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(process_rpc_messages(rx, state, Arc::clone(&registry)));

        tx.send((client_id.clone(), "not json".into())).await.unwrap();
        tx.send((
            client_id.clone(),
            r#"{"method":"context.get","params":{"level":"global","id":"global"},"id":5}"#.into(),
        ))
        .await
        .unwrap();

        let first: serde_json::Value = serde_json::from_str(&out.recv().await.unwrap()).unwrap();
        assert_eq!(first["error"]["code"], "PARSE_ERROR");
        let second: serde_json::Value = serde_json::from_str(&out.recv().await.unwrap()).unwrap();
        assert_eq!(second["id"], 5);
        assert_eq!(second["error"]["code"], "not_found");

        drop(tx);
        task.await.unwrap();
    }

    #[test]
    fn config_follows_settings() {
        let mut settings = ServerSettings::default();
        settings.port = 7000;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "127.0.0.1");
    }
}
