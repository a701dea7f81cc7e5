//! WebSocket handling

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use campusdock_protocol::{new_id, ClientMessage, ServerMessage};

use crate::registry::{SessionInfo, SessionTransport};
use crate::state::AppState;

const OUTBOUND_CAPACITY: usize = 100;
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
    /// Close frame, then stop writing
    Close,
}

/// Registry-facing side of one socket. Delivery never blocks: a full
/// outbound queue drops the message.
pub struct WsTransport {
    session_id: String,
    outbound: mpsc::Sender<OutboundMessage>,
    hangup: Notify,
    hung_up: AtomicBool,
}

impl WsTransport {
    fn new(session_id: String, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            session_id,
            outbound,
            hangup: Notify::new(),
            hung_up: AtomicBool::new(false),
        }
    }

    fn pong(&self, data: Bytes) {
        let _ = self.outbound.try_send(OutboundMessage::Pong(data));
    }
}

impl SessionTransport for WsTransport {
    fn deliver(&self, msg: ServerMessage) -> bool {
        if self.hung_up.load(Ordering::Acquire) {
            return false;
        }
        match self.outbound.try_send(OutboundMessage::Json(msg)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    component = "websocket",
                    event = "ws.send.queue_full",
                    session_id = %self.session_id,
                    "Outbound queue full, message dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn force_disconnect(&self) {
        if self.hung_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.try_send(OutboundMessage::Close);
        // notify_one keeps a permit if the read loop isn't waiting yet
        self.hangup.notify_one();
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let client_descriptor = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, peer, client_descriptor, state))
}

/// Handle a WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    client_descriptor: String,
    state: AppState,
) {
    let (ws_tx, ws_rx) = socket.split();
    run_session(ws_tx, ws_rx, peer, client_descriptor, state).await;
}

/// Session loop over any frame sink/stream pair: register, read frames until
/// the client leaves or the server hangs up, then release the session.
async fn run_session<W, R>(
    mut ws_tx: W,
    mut ws_rx: R,
    peer: SocketAddr,
    client_descriptor: String,
    state: AppState,
) where
    W: Sink<Message> + Send + Unpin + 'static,
    W::Error: Send,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let session_id = new_id();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let writer_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            session_id = %writer_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    session_id = %writer_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let transport = Arc::new(WsTransport::new(session_id.clone(), outbound_tx));
    state.registry.register(
        SessionInfo {
            id: session_id.clone(),
            peer_address: peer,
            client_descriptor: client_descriptor.clone(),
        },
        transport.clone(),
    );
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        session_id = %session_id,
        peer = %peer,
        client = %client_descriptor,
        "WebSocket connection opened"
    );

    // Open the store ahead of the first record request.
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.acquire().await {
            warn!(
                component = "websocket",
                event = "ws.store_warmup_failed",
                error = %e,
                "Could not open store for new session"
            );
        }
    });

    transport.deliver(ServerMessage::Hello {
        session_id: session_id.clone(),
    });

    loop {
        let frame = tokio::select! {
            _ = transport.hangup.notified() => {
                info!(
                    component = "websocket",
                    event = "ws.connection.forced_close",
                    session_id = %session_id,
                    "Session disconnected by server"
                );
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let Some(result) = frame else {
            break;
        };

        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                state.registry.touch(&session_id);
                transport.pong(data);
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    session_id = %session_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => {
                state.registry.touch(&session_id);
                continue;
            }
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    session_id = %session_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        if !state.registry.touch(&session_id) {
            // Evicted between frames; the hangup notification is on its way.
            break;
        }

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    session_id = %session_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(&text, 240),
                    "Failed to parse client message"
                );
                transport.deliver(ServerMessage::Error {
                    code: "parse_error".into(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        handle_client_message(client_msg, &session_id, &state, transport.as_ref());
    }

    state.registry.remove(&session_id);
    state.relay.on_disconnect(&session_id);
    drop(transport);

    // The writer exits once the last sender is gone.
    let writer = send_task.abort_handle();
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, send_task).await.is_err() {
        writer.abort();
        debug!(
            component = "websocket",
            event = "ws.send.drain_timeout",
            session_id = %session_id,
            "Writer did not drain in time"
        );
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        session_id = %session_id,
        "WebSocket connection closed"
    );
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Dispatch one parsed client message to the relay.
fn handle_client_message(
    msg: ClientMessage,
    session_id: &str,
    state: &AppState,
    reply: &dyn SessionTransport,
) {
    match msg {
        ClientMessage::AnnounceAgent { name } => {
            if let Err(e) = state.relay.announce_agent(session_id, &name) {
                reply.deliver(ServerMessage::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }
        ClientMessage::RequestAgent { preferred_name } => {
            state
                .relay
                .request_agent(session_id, preferred_name.as_deref());
        }
        ClientMessage::MessageFromRequester { text } => {
            state.relay.relay_from_requester(session_id, &text);
        }
        ClientMessage::MessageFromAgent {
            to_session_id,
            text,
        } => {
            state.relay.relay_from_agent(&to_session_id, &text);
        }
        ClientMessage::Ping => {
            reply.deliver(ServerMessage::Pong);
        }
    }
}
