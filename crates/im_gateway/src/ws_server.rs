//! WebSocket gateway using Axum.
//!
//! Each connection runs three tasks: a writer that owns the socket sink, a
//! forwarder that moves packets from the identity's fanout subscription
//! onto the outbound queue, and the read loop. Every exit path converges on
//! the same teardown.

use crate::api;
use crate::client::{ConnectionHandle, ConnectionRegistry, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::presence::PresenceDirectory;
use crate::error::Result;
use crate::protocol::Packet;
use crate::router::RoutingService;
use crate::subscription::Subscription;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long teardown waits for the writer to flush its Close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    /// Outbound queue depth; frames beyond it are dropped.
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            buffer_size: CLIENT_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<dyn PresenceDirectory>,
    pub router: Arc<RoutingService>,
    pub session: SessionConfig,
    /// Cancelled on process shutdown; every connection token is a child of it.
    pub shutdown: CancellationToken,
}

/// Create the HTTP router: WebSocket upgrade, health and the admin API.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api/ws", api::routes())
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
        "endpoints": state.presence.endpoints().active_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// WebSocket upgrade handler. The `token` query parameter is the identity.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = match params.token {
        Some(token) if !token.is_empty() => token,
        _ => {
            debug!("Rejecting upgrade without token");
            counter!("im_connections_rejected_total").increment(1);
            return (StatusCode::UNAUTHORIZED, "missing token").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

/// Run one connection from registration to teardown.
async fn handle_socket(socket: WebSocket, identity: String, state: Arc<AppState>) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.session.buffer_size);

    let handle = Arc::new(ConnectionHandle::new(
        identity.clone(),
        tx,
        state.shutdown.child_token(),
    ));

    if let Some(previous) = state.registry.register(handle.clone()) {
        counter!("im_connections_replaced_total").increment(1);
        previous.close();
    }

    counter!("im_connections_total").increment(1);
    gauge!("im_active_connections").set(state.registry.connection_count() as f64);
    info!("Client {} connected ({})", identity, handle.id);

    // Single writer: the only task that touches the socket sink.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // Teardown sends Offline for this connection id regardless of how Online
    // went, since a timed-out Online may still land.
    if let Err(e) = state.presence.online(&identity, handle.id).await {
        warn!("Online not confirmed for {}: {}", identity, e);
    }
    if let Err(e) = state
        .presence
        .advertise(&identity, handle.cancel_token().clone())
        .await
    {
        warn!("Presence advertisement failed for {}: {}", identity, e);
    }
    let counted = match state.router.record_online().await {
        Ok(_) => true,
        Err(e) => {
            warn!("Online counter not incremented for {}: {}", identity, e);
            false
        }
    };

    let forward_task = match state.router.bus().subscribe(&identity).await {
        Ok(subscription) => Some(tokio::spawn(forward_packets(subscription, handle.clone()))),
        Err(e) => {
            warn!("Fanout subscribe failed for {}: {}", identity, e);
            handle.close();
            None
        }
    };

    let reader = tokio::spawn(read_loop(ws_rx, state.clone(), handle.clone()));
    if let Err(e) = reader.await {
        if e.is_panic() {
            error!("Read loop for {} panicked", identity);
        }
    }

    // Teardown
    handle.close();
    if let Some(task) = forward_task {
        let _ = task.await;
    }
    if let Err(e) = state.presence.offline(&identity, handle.id).await {
        warn!("Offline not recorded for {}: {}", identity, e);
    }
    if counted {
        if let Err(e) = state.router.record_offline().await {
            warn!("Online counter not decremented for {}: {}", identity, e);
        }
    }
    state.registry.remove(&handle);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    handle.mark_closed();

    counter!("im_disconnections_total").increment(1);
    gauge!("im_active_connections").set(state.registry.connection_count() as f64);
    info!("Client {} disconnected ({})", identity, handle.id);
}

/// Move packets from the fanout subscription onto the connection's queue.
async fn forward_packets(mut subscription: Subscription, handle: Arc<ConnectionHandle>) {
    let cancel = handle.cancel_token().clone();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            packet = subscription.next() => {
                let Some(packet) = packet else {
                    warn!("Fanout subscription for {} ended", handle.identity);
                    handle.close();
                    break;
                };
                match handle.deliver(&packet) {
                    Ok(()) => counter!("im_packets_delivered_total").increment(1),
                    Err(e) => {
                        debug!("Dropping packet for {}: {}", handle.identity, e);
                        counter!("im_packets_dropped_total").increment(1);
                    }
                }
            }
        }
    }

    subscription.unsubscribe();
}

/// Drain inbound frames until the socket closes or the handle is cancelled.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    state: Arc<AppState>,
    handle: Arc<ConnectionHandle>,
) {
    let cancel = handle.cancel_token().clone();
    let period = state.session.ping_interval;
    let mut ping_interval = interval_at(Instant::now() + period, period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            // Replacement, send failure or process shutdown
            _ = cancel.cancelled() => break,

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if handle_message(&state, &handle, msg).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", handle.identity, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                let _ = handle.send_frame(Message::Ping(Bytes::new()));
            }
        }
    }
}

/// Handle a single inbound frame.
async fn handle_message(
    state: &AppState,
    handle: &ConnectionHandle,
    msg: Message,
) -> ControlFlow<()> {
    let routed = match msg {
        Message::Text(text) => route_inbound(state, handle, text.as_str().as_bytes()).await,
        Message::Binary(data) => route_inbound(state, handle, &data).await,
        Message::Ping(data) => {
            let _ = handle.send_frame(Message::Pong(data));
            return ControlFlow::Continue(());
        }
        Message::Pong(_) => return ControlFlow::Continue(()),
        Message::Close(_) => return ControlFlow::Break(()),
    };

    if let Err(e) = routed {
        debug!("Inbound frame from {} not routed: {}", handle.identity, e);
    }
    ControlFlow::Continue(())
}

/// Route a packet sent over the socket. The sender is always the connection's identity.
async fn route_inbound(state: &AppState, handle: &ConnectionHandle, payload: &[u8]) -> Result<()> {
    let mut packet: Packet = serde_json::from_slice(payload)?;
    packet.sender_id = handle.identity.clone();

    let recipients = state.router.send(&packet).await?;
    debug!(
        "Routed packet from {} to {} recipients",
        handle.identity, recipients
    );
    Ok(())
}
