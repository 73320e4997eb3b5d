//! Connection handlers for the Sandesh coordinator.
//!
//! Each live connection gets exactly one frame loop; registration binds
//! the connection to a user by replacing the registry's live handle
//! atomically, so a reconnect never leaves two loops serving one user.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use sandesh_core::{
    Dispatcher, LiveHandle, MemoryStore, MessageChannel, PresenceRegistry, SessionState,
    SessionStore, SignalError, WakeChannel,
};
use sandesh_protocol::{codec, frames::codes, version, Frame};
use sandesh_transport::NoopWake;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Presence registry.
    pub registry: Arc<PresenceRegistry>,
    /// Session store.
    pub sessions: Arc<SessionStore>,
    /// Invite dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// In-session message channel.
    pub channel: MessageChannel,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state with the default (no-op) wake channel.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_wake(config, Arc::new(NoopWake::new()))
    }

    /// Create app state with an explicit wake channel.
    #[must_use]
    pub fn with_wake(config: Config, wake: Arc<dyn WakeChannel>) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        let sessions = Arc::new(SessionStore::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            sessions.clone(),
            wake,
            config.dispatch_config(),
        );
        let channel = MessageChannel::new(
            sessions.clone(),
            registry.clone(),
            Arc::new(MemoryStore::new()),
        );

        Self {
            registry,
            sessions,
            dispatcher,
            channel,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    spawn_terminal_sweep(state.clone());

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Sandesh coordinator listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically drop terminal sessions past the retention window.
fn spawn_terminal_sweep(state: Arc<AppState>) {
    let retention = state.dispatcher.config().terminal_retention;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(retention.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let swept = state.sessions.sweep_terminal(retention);
            if swept > 0 {
                debug!(swept, "Swept terminal sessions");
            }
            metrics::set_active_sessions(state.sessions.count());
        }
    });
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a live WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!(
        "conn_{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let welcome = Frame::welcome(
        &connection_id,
        version::WIRE_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &welcome).await.is_err() {
        error!(connection = %connection_id, "Failed to send Welcome frame");
        return;
    }

    // Outbox drained here; the dispatcher and message channel push into it
    // through the registered live handle.
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Frame>();

    // User bound by the Register frame
    let mut user_id: Option<String> = None;

    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(frame) = outbox_rx.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);
                        metrics::record_message(data.len(), "inbound");

                        // A decode error is fatal: framing cannot
                        // resynchronize past bad bytes, so the connection
                        // would stay open but permanently deaf.
                        let frames = match drain_frames(&mut read_buffer) {
                            Ok(frames) => frames,
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Undecodable frame, dropping connection");
                                metrics::record_error("decode");
                                break;
                            }
                        };

                        for frame in frames {
                            if let Err(e) = handle_frame(
                                frame,
                                &connection_id,
                                &state,
                                &mut sender,
                                &outbox_tx,
                                &mut user_id,
                            ).await {
                                error!(connection = %connection_id, error = %e, "Frame handling error");
                                break;
                            }
                        }

                        if let Some(user) = &user_id {
                            state.registry.touch(user);
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(_))) => {
                        // The wire protocol is binary only
                        debug!(connection = %connection_id, "Ignoring text message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        if let Some(user) = &user_id {
                            state.registry.touch(user);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Hard disconnect is a signaling event: clear the live handle (wake
    // token stays) and end any session this user is engaged in.
    if let Some(user) = &user_id {
        state.dispatcher.on_disconnect(user, &connection_id).await;
    }
    metrics::set_active_sessions(state.sessions.count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    connection_id: &str,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    outbox_tx: &mpsc::UnboundedSender<Frame>,
    user_id: &mut Option<String>,
) -> Result<()> {
    match frame {
        Frame::Hello { version: client_version, .. } => {
            debug!(connection = %connection_id, client_version, "Hello frame");
            if !version::supported(client_version) {
                send_frame(
                    sender,
                    &Frame::error(
                        0,
                        codes::BAD_REQUEST,
                        format!("Unsupported protocol version {}", client_version),
                    ),
                )
                .await?;
            }
        }

        Frame::Register {
            id,
            user_id: uid,
            wake_token,
        } => {
            debug!(connection = %connection_id, user = %uid, "Register request");

            let handle = LiveHandle::new(connection_id, outbox_tx.clone());
            match state.registry.register(uid.as_str(), Some(handle), wake_token) {
                Ok(()) => {
                    *user_id = Some(uid.clone());
                    send_frame(sender, &Frame::ack(id)).await?;

                    // Reconnect resync: confirm any pending session so a
                    // wake-roused client converges with coordinator state
                    if let Some(snapshot) = state.dispatcher.resync(&uid).await {
                        if snapshot.state == SessionState::Ringing && snapshot.target_id == uid {
                            send_frame(
                                sender,
                                &Frame::invite(
                                    0,
                                    snapshot.session_id.clone(),
                                    snapshot.kind,
                                    snapshot.initiator_id.clone(),
                                    snapshot.payload.clone(),
                                ),
                            )
                            .await?;
                        } else if let Some(phase) = snapshot.state.phase() {
                            send_frame(
                                sender,
                                &Frame::session_event(snapshot.session_id.clone(), phase, None),
                            )
                            .await?;
                        }
                    }
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Register failed");
                    metrics::record_error("register");
                    send_frame(
                        sender,
                        &Frame::error(id, codes::INVALID_REGISTRATION, e.to_string()),
                    )
                    .await?;
                }
            }
        }

        Frame::CallRequest {
            id,
            to_user_id,
            kind,
            payload,
        } => {
            let Some(from) = user_id.clone() else {
                send_frame(
                    sender,
                    &Frame::error(id, codes::BAD_REQUEST, "Not registered"),
                )
                .await?;
                return Ok(());
            };

            debug!(connection = %connection_id, from = %from, to = %to_user_id, ?kind, "Call request");

            // Routing can block on the target's ack for up to the ack
            // timeout; run it off this loop so the caller's connection
            // stays responsive. The outcome comes back via the outbox.
            let state = state.clone();
            let outbox = outbox_tx.clone();
            tokio::spawn(async move {
                let response = route_call(&state, id, &from, &to_user_id, kind, payload).await;
                metrics::set_active_sessions(state.sessions.count());
                let _ = outbox.send(response);
            });
        }

        Frame::Ack { id } => {
            // Application-level invite ack from the callee
            state.dispatcher.resolve_ack(id);
        }

        Frame::Answer {
            session_id,
            accepted,
        } => {
            let Some(user) = user_id.as_deref() else {
                return Ok(());
            };
            if let Err(e) = state.dispatcher.answer(&session_id, user, accepted).await {
                send_frame(sender, &Frame::error(0, error_code(&e), e.to_string())).await?;
            }
        }

        Frame::SessionConnect { session_id } => {
            let Some(user) = user_id.as_deref() else {
                return Ok(());
            };
            if let Err(e) = state.dispatcher.join_connected(&session_id, user).await {
                send_frame(sender, &Frame::error(0, error_code(&e), e.to_string())).await?;
            }
        }

        Frame::End { session_id, reason } => {
            let Some(user) = user_id.as_deref() else {
                return Ok(());
            };
            if let Err(e) = state.dispatcher.end(&session_id, user, reason).await {
                send_frame(sender, &Frame::error(0, error_code(&e), e.to_string())).await?;
            }
            metrics::set_active_sessions(state.sessions.count());
        }

        Frame::Chat {
            session_id,
            message_id,
            text,
            sent_at,
            ..
        } => {
            let Some(user) = user_id.as_deref() else {
                return Ok(());
            };
            match state
                .channel
                .send(&session_id, user, &message_id, &text, sent_at)
                .await
            {
                Ok(()) => {
                    // Server-side confirmation the message was taken in
                    send_frame(
                        sender,
                        &Frame::receipt(
                            session_id,
                            message_id,
                            sandesh_protocol::DeliveryStatus::Sent,
                        ),
                    )
                    .await?;
                }
                Err(e) => {
                    metrics::record_error("chat");
                    send_frame(sender, &Frame::error(0, error_code(&e), e.to_string())).await?;
                }
            }
        }

        Frame::Receipt {
            session_id,
            message_id,
            status,
        } => {
            let Some(user) = user_id.as_deref() else {
                return Ok(());
            };
            if let Err(e) = state
                .channel
                .receipt(&session_id, user, &message_id, status)
                .await
            {
                debug!(connection = %connection_id, error = %e, "Receipt dropped");
            }
        }

        Frame::Typing { session_id, active } => {
            if let Some(user) = user_id.as_deref() {
                state.channel.typing(&session_id, user, active).await;
            }
        }

        Frame::HistoryRequest {
            id,
            session_id,
            limit,
            before,
        } => {
            let Some(user) = user_id.as_deref() else {
                send_frame(
                    sender,
                    &Frame::error(id, codes::BAD_REQUEST, "Not registered"),
                )
                .await?;
                return Ok(());
            };

            let limit = limit.min(state.config.limits.history_page_limit) as usize;
            match state
                .channel
                .fetch_history(&session_id, user, limit, before)
                .await
            {
                Ok(mut entries) => {
                    // Channel pages newest-first for pagination; the wire
                    // page is oldest-first for rendering
                    entries.reverse();
                    send_frame(sender, &Frame::HistoryPage { id, entries }).await?;
                }
                Err(e) => {
                    send_frame(sender, &Frame::error(id, error_code(&e), e.to_string())).await?;
                }
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {
            // last-seen refresh happens in the read loop
        }

        other => {
            warn!(
                connection = %connection_id,
                frame_type = ?other.frame_type(),
                "Unexpected frame type"
            );
        }
    }

    Ok(())
}

/// Drain every complete frame from the read buffer.
///
/// An error poisons the stream: the length-prefixed framing has no way to
/// resynchronize past bad bytes, so the caller must drop the connection.
fn drain_frames(buffer: &mut BytesMut) -> Result<Vec<Frame>, sandesh_protocol::ProtocolError> {
    let mut frames = Vec::new();
    while let Some(frame) = codec::decode_from(buffer)? {
        frames.push(frame);
    }
    Ok(frames)
}

/// Route a call request and build the reply frame for the caller.
///
/// The session counter moves only for requests that actually routed;
/// busy and unreachable targets count as errors instead.
async fn route_call(
    state: &AppState,
    id: u64,
    from: &str,
    to_user_id: &str,
    kind: sandesh_protocol::SessionKind,
    payload: Option<serde_json::Value>,
) -> Frame {
    match state
        .dispatcher
        .create_and_route(from, to_user_id, kind, payload)
        .await
    {
        Ok(session_id) => {
            metrics::record_session(kind_label(kind));
            Frame::SessionCreated { id, session_id }
        }
        Err(e) => {
            metrics::record_error("route");
            Frame::error(id, error_code(&e), e.to_string())
        }
    }
}

/// Map a core error to its wire code.
fn error_code(e: &SignalError) -> u16 {
    match e {
        SignalError::InvalidRegistration => codes::INVALID_REGISTRATION,
        SignalError::TargetUnreachable(_) => codes::TARGET_UNREACHABLE,
        SignalError::SessionNotFound(_) => codes::SESSION_NOT_FOUND,
        SignalError::SessionNotConnected(_) => codes::SESSION_NOT_CONNECTED,
        SignalError::ResourceBusy(_) => codes::RESOURCE_BUSY,
        SignalError::TransportAckTimeout(_) | SignalError::HandshakeTimeout(_) => codes::INTERNAL,
    }
}

fn kind_label(kind: sandesh_protocol::SessionKind) -> &'static str {
    match kind {
        sandesh_protocol::SessionKind::Chat => "chat",
        sandesh_protocol::SessionKind::AudioCall => "audio",
        sandesh_protocol::SessionKind::VideoCall => "video",
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
