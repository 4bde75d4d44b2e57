//! WebSocket transport - upgrades, connection loops and liveness
//!
//! The upgrade URL carries `token` and `sessionId` query parameters; token
//! verification and session lookup happen before the protocol switch, so a
//! bad credential is an HTTP failure, not a doomed socket. After the upgrade
//! each connection runs two halves: a writer task draining the member's
//! outbound channel into the socket, and a reader loop that validates frames
//! and dispatches them into the session core. The reader never gives up on a
//! connection because of a bad frame; malformed input is logged and dropped.
//!
//! Liveness is a two-sweep protocol: every sweep marks all members suspect
//! and pings them; a member still suspect at the next sweep did not pong in
//! time and is removed exactly as if it had closed its socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::Principal;
use crate::handlers::ApiError;
use crate::protocol::{self, DecodeError};
use crate::session::{self, ConnectError};
use crate::AppState;

/// Cadence of the liveness sweep; a silent member survives at most two
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Process-unique connection ids, so a replaced socket's reader cannot
/// tear down its successor's membership
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Query parameters of the upgrade URL
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeParams {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// Handler transferring communication from HTTP to WebSockets
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<UpgradeParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let Some(token) = params.token else {
        return Err(ApiError::PermissionDenied);
    };
    let principal = state.tokens.verify(&token).map_err(|err| {
        tracing::debug!("websocket upgrade from {addr} with bad token: {err}");
        ApiError::PermissionDenied
    })?;
    let Some(session_id) = params.session_id else {
        return Err(ApiError::NotFound);
    };
    if state.registry.session(&session_id).is_none() {
        return Err(ApiError::NotFound);
    }

    tracing::info!(
        "websocket connect: addr={addr}, user={user}, session={session_id}",
        user = principal.user_id
    );
    Ok(ws.on_upgrade(move |socket| connection_loop(socket, state, session_id, principal)))
}

/// Life of one connection: attach to the session, pump frames both ways,
/// detach on the way out.
async fn connection_loop(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    principal: Principal,
) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();

    let Some(session) = state.registry.session(&session_id) else {
        // Vanished between upgrade and attach
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: protocol::CLOSE_NOT_FOUND,
                reason: Utf8Bytes::from_static("session not found"),
            })))
            .await;
        return;
    };

    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();
    // Watch handle: resolves once the member record (and with it the receiving
    // half) is dropped, which is how a replaced or reaped connection learns
    // its reader should stop.
    let detached = sender.clone();
    let attached = session::connect(
        &mut session.lock().unwrap(),
        &principal.user_id,
        &principal.display_name,
        conn_id,
        sender,
    );
    if let Err(err) = attached {
        let (code, reason) = match err {
            ConnectError::Full => (protocol::CLOSE_FULL, "session-full"),
            ConnectError::SessionClosed => (protocol::CLOSE_NOT_FOUND, "session not found"),
        };
        tracing::info!(
            "turning away {user} from session {session_id}: {reason}",
            user = principal.user_id
        );
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from_static(reason),
            })))
            .await;
        return;
    }

    // Writer half: ends when the member is removed (channel closes) or after
    // it has delivered a close frame.
    let _writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader half: dispatch until the peer goes away or the membership does
    loop {
        let message = tokio::select! {
            message = stream.next() => match message {
                Some(Ok(message)) => message,
                // Peer closed the TCP side or sent garbage at the protocol level
                _ => break,
            },
            // Member record dropped (replaced, reaped or session destroyed):
            // the writer has wound down, stop reading on its behalf
            _ = detached.closed() => break,
        };
        match message {
            Message::Text(text) => {
                if text.len() > protocol::MAX_MESSAGE_BYTES {
                    tracing::warn!(
                        "dropping oversized frame ({len} bytes) from {user}",
                        len = text.len(),
                        user = principal.user_id
                    );
                    continue;
                }
                match protocol::decode(text.as_str()) {
                    Ok(command) => {
                        session::apply_command(&state, &session, &principal.user_id, command)
                    }
                    Err(DecodeError::UnknownType(kind)) => {
                        tracing::debug!(
                            "ignoring unknown message type {kind:?} from {user}",
                            user = principal.user_id
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            "dropping frame from {user}: {err}; payload: {payload}",
                            user = principal.user_id,
                            payload = text.as_str()
                        );
                    }
                }
            }
            Message::Pong(_) => {
                session.lock().unwrap().mark_alive(&principal.user_id);
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; client-initiated
            // pings are answered by the websocket layer itself
            _ => {}
        }
    }

    session::disconnect(&state, &session_id, &principal.user_id, conn_id);
    tracing::info!(
        "websocket closed: user={user}, session={session_id}",
        user = principal.user_id
    );
}

/// Every [PING_INTERVAL], reap members that never answered the previous ping
/// and mark the rest suspect
pub async fn liveness_sweep_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    loop {
        interval.tick().await;
        for session in state.registry.sessions_snapshot() {
            let (session_id, dead) = {
                let mut session = session.lock().unwrap();
                (session.id.clone(), session.sweep_liveness())
            };
            for (user_id, conn_id) in dead {
                tracing::info!("member {user_id} failed liveness check in session {session_id}");
                session::disconnect(&state, &session_id, &user_id, conn_id);
            }
        }
    }
}
