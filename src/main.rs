//! DocSync Server - Real-Time Collaborative Text Editing
//!
//! A collaboration server built on:
//! - A replicated sequence CRDT with a formatting overlay, so concurrent
//!   edits converge without server arbitration
//! - Sled embedded database for update logs and document metadata
//! - Axum with WebSocket for the sync and presence protocol

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use docsync_server::config::ServerConfig;
use docsync_server::storage::{DocumentMetadata, DocumentStore, StorageStats};
use docsync_server::sync::{
    protocol::{
        ClientMessage, ErrorCode, ProtocolError, ServerMessage, SyncProtocol, PROTOCOL_VERSION,
    },
    server::{DocumentSnapshot, SessionHello},
    ApplyOutcome, SyncError, SyncServer,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Document rooms, sessions and persistence
    sync_server: Arc<SyncServer>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(sync_server: Arc<SyncServer>) -> Self {
        Self {
            sync_server,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_documents: usize,
    active_sessions: usize,
    storage: StorageStats,
}

#[derive(Debug, Default, Deserialize)]
struct CreateDocumentRequest {
    title: Option<String>,
    /// Initial plain text
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateDocumentResponse {
    document_id: String,
    title: String,
    ws_url: String,
}

#[derive(Debug, Deserialize)]
struct RenameDocumentRequest {
    title: String,
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentMetadata>,
    total: usize,
}

type ApiError = (StatusCode, String);

fn api_error(err: SyncError) -> ApiError {
    match err {
        SyncError::DocumentNotFound(id) => {
            (StatusCode::NOT_FOUND, format!("Document not found: {}", id))
        }
        other => {
            error!("Request failed: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_documents: stats.active_documents,
        active_sessions: stats.active_sessions,
        storage: state.sync_server.storage().stats(),
    })
}

/// Create a new document
async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<CreateDocumentResponse>), ApiError> {
    let metadata = state
        .sync_server
        .create_document(payload.title, payload.content.as_deref())
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateDocumentResponse {
            ws_url: format!("/ws/{}", metadata.document_id),
            document_id: metadata.document_id,
            title: metadata.title,
        }),
    ))
}

/// List all documents
async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let documents = state.sync_server.list_documents().map_err(api_error)?;
    let total = documents.len();
    Ok(Json(DocumentListResponse { documents, total }))
}

/// Get document details: metadata, current content and presence
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentSnapshot>, ApiError> {
    state
        .sync_server
        .document_snapshot(&document_id)
        .map(Json)
        .map_err(api_error)
}

async fn rename_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(payload): Json<RenameDocumentRequest>,
) -> Result<Json<DocumentMetadata>, ApiError> {
    state
        .sync_server
        .rename_document(&document_id, payload.title)
        .map(Json)
        .map_err(api_error)
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .sync_server
        .delete_document(&document_id)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for document: {}", document_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, document_id, state))
}

/// Frame encoding a client speaks; replies use the same one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Binary,
    Json,
}

fn decode_frame(msg: &Message) -> Option<(Encoding, Result<ClientMessage, ProtocolError>)> {
    match msg {
        Message::Binary(data) => Some((Encoding::Binary, SyncProtocol::decode_client(data))),
        Message::Text(text) => Some((Encoding::Json, SyncProtocol::decode_client_json(text))),
        _ => None,
    }
}

fn encode_frame(encoding: Encoding, msg: &ServerMessage) -> Result<Message, ProtocolError> {
    match encoding {
        Encoding::Binary => Ok(Message::Binary(SyncProtocol::encode_server(msg)?.to_vec())),
        Encoding::Json => Ok(Message::Text(serde_json::to_string(msg)?)),
    }
}

fn protocol_error_response(err: &ProtocolError) -> ServerMessage {
    let code = match err {
        ProtocolError::VersionMismatch(..) => ErrorCode::VersionMismatch,
        _ => ErrorCode::InvalidMessage,
    };
    SyncProtocol::error_response(code, err.to_string())
}

/// Read frames until the client says `Hello`.
async fn await_hello(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<(Encoding, SessionHello)> {
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if let Message::Close(_) = msg {
            return None;
        }
        let Some((encoding, decoded)) = decode_frame(&msg) else {
            continue;
        };
        match decoded {
            Ok(ClientMessage::Hello {
                protocol_version,
                replica_id,
                name,
                color,
                session_token,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    let _ = tx.send(SyncProtocol::error_response(
                        ErrorCode::VersionMismatch,
                        format!(
                            "Protocol version {} not supported (expected {})",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    ));
                    return None;
                }
                let hello = SessionHello {
                    replica_id,
                    name,
                    color,
                    session_token,
                };
                return Some((encoding, hello));
            }
            Ok(other) => {
                debug!("{:?} before Hello", other.message_type());
                let _ = tx.send(SyncProtocol::error_response(
                    ErrorCode::NotJoined,
                    "Send Hello first",
                ));
            }
            Err(e) => {
                warn!("Failed to decode message: {}", e);
                let _ = tx.send(protocol_error_response(&e));
            }
        }
    }
    None
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, document_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this session
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (encoding_tx, encoding_rx) = tokio::sync::oneshot::channel::<Encoding>();

    // Task to forward messages from channel to WebSocket. Anything queued
    // before the handshake completes goes out in binary.
    let send_task = tokio::spawn(async move {
        let mut encoding = Encoding::Binary;
        let mut encoding_rx = Some(encoding_rx);
        while let Some(msg) = rx.recv().await {
            if let Some(pending) = encoding_rx.as_mut() {
                if let Ok(chosen) = pending.try_recv() {
                    encoding = chosen;
                    encoding_rx = None;
                }
            }
            match encode_frame(encoding, &msg) {
                Ok(frame) => {
                    if ws_sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode message: {}", e),
            }
        }
        let _ = ws_sender.close().await;
    });

    let Some((encoding, hello)) = await_hello(&mut ws_receiver, &tx).await else {
        debug!("Connection closed before Hello for document {}", document_id);
        drop(tx);
        let _ = send_task.await;
        return;
    };
    let _ = encoding_tx.send(encoding);

    let session_id = match state.sync_server.hello(&document_id, hello, tx.clone()) {
        Ok((session_id, welcome)) => {
            let _ = tx.send(welcome);
            session_id
        }
        Err(e) => {
            error!("Failed to register session: {}", e);
            let _ = tx.send(SyncProtocol::error_response(e.error_code(), e.to_string()));
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    match state.sync_server.join_document(&session_id).await {
        Ok(messages) => {
            for msg in messages {
                let _ = tx.send(msg);
            }
        }
        Err(e) => {
            warn!("Session {} could not join {}: {}", session_id, document_id, e);
            let _ = tx.send(SyncProtocol::error_response(e.error_code(), e.to_string()));
            state.sync_server.unregister_session(&session_id);
            drop(tx);
            let _ = send_task.await;
            return;
        }
    }

    // Task to handle incoming WebSocket messages
    let session_id_recv = session_id.clone();
    let state_recv = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Close(_) = msg {
                info!("WebSocket closed by client: {}", session_id_recv);
                break;
            }
            let Some((_, decoded)) = decode_frame(&msg) else {
                continue;
            };
            match decoded {
                Ok(client_msg) => {
                    if !handle_client_message(client_msg, &session_id_recv, &state_recv, &tx) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to decode message from {}: {}", session_id_recv, e);
                    let _ = tx.send(protocol_error_response(&e));
                }
            }
        }
        debug!("Receive task ended for session {}", session_id_recv);
    });

    let send_abort = send_task.abort_handle();
    let recv_abort = recv_task.abort_handle();

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => recv_abort.abort(),
        _ = recv_task => send_abort.abort(),
    }

    // Cleanup
    state.sync_server.unregister_session(&session_id);
    info!("Session {} disconnected from document {}", session_id, document_id);
}

/// Handle a decoded client message. Returns false when the client said goodbye.
fn handle_client_message(
    msg: ClientMessage,
    session_id: &str,
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> bool {
    let server = &state.sync_server;
    let result = match msg {
        ClientMessage::Hello { .. } => {
            let _ = tx.send(SyncProtocol::error_response(
                ErrorCode::InvalidMessage,
                "Session already established",
            ));
            Ok(())
        }

        ClientMessage::SyncStep1 { state_vector } => server
            .handle_sync_step1(session_id, &state_vector)
            .map(|replies| {
                for reply in replies {
                    let _ = tx.send(reply);
                }
            }),

        ClientMessage::SyncStep2 { delta } => server
            .handle_sync_step2(session_id, &delta)
            .map(|outcome| warn_rejected(session_id, outcome)),

        ClientMessage::Update { delta } => server
            .handle_update(session_id, delta)
            .map(|outcome| warn_rejected(session_id, outcome)),

        ClientMessage::Awareness { payload } => {
            server.handle_awareness(session_id, &payload).map(|_| ())
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(server.handle_ping(session_id, timestamp));
            Ok(())
        }

        ClientMessage::Goodbye { reason } => {
            info!(
                "Session {} saying goodbye: {}",
                session_id,
                reason.unwrap_or_default()
            );
            return false;
        }
    };

    // Errors are reported to the client; the connection stays open.
    if let Err(e) = result {
        warn!("Message from {} failed: {}", session_id, e);
        let _ = tx.send(SyncProtocol::error_response(e.error_code(), e.to_string()));
    }
    true
}

fn warn_rejected(session_id: &str, outcome: ApplyOutcome) {
    if outcome.rejected > 0 {
        warn!("Session {} sent {} malformed operations", session_id, outcome.rejected);
    }
}

// ============================================================================
// ROUTER
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/documents", get(list_documents).post(create_document))
        .route(
            "/api/documents/:document_id",
            get(get_document).patch(rename_document).delete(delete_document),
        )
        .route("/ws/:document_id", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    info!("Initializing storage at: {}", config.storage_path);
    let storage = DocumentStore::open(config.storage_config()).context("Failed to open storage")?;
    info!("Storage initialized successfully");

    let sync_server = Arc::new(SyncServer::new(storage, config.sync_config()));
    let background = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState::new(sync_server.clone()));
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("DocSync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:document_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sync_server.shutdown();
    background.wait().await;
    info!("Server stopped");
    Ok(())
}
