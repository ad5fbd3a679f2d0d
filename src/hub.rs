//! Per-identity WebSocket registry for passengers and drivers: authenticated
//! sessions, keepalive, single-writer push.
//!
//! Two [`Hub`] instances exist at runtime — one keyed by passenger id, one by
//! driver id — sharing this one mechanism. Each identity may hold at most one
//! live session; a second connection attempt for the same id is rejected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Claims, TokenVerifier};
use crate::error::EngineError;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const PING_PERIOD: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth { token: String },
}

/// A single identity's outbound queue. `push` is non-blocking: if the
/// session's writer task has already exited, the send is dropped silently.
#[derive(Clone)]
struct Session {
    send_tx: mpsc::Sender<serde_json::Value>,
}

/// Which hub a connecting socket belongs to — used to check `claims.role`
/// against the path it connected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubKind {
    Passenger,
    Driver,
}

impl HubKind {
    fn claim_role_ok(self, claims: &Claims) -> bool {
        match self {
            HubKind::Passenger => claims.role == "PASSENGER",
            HubKind::Driver => claims.role == "DRIVER",
        }
    }
}

/// Registry of live sessions for one hub kind. Cloning shares the underlying
/// map; cheap, meant to be handed to every accepted connection and to the
/// orchestrator for fan-out.
#[derive(Clone)]
pub struct Hub {
    kind: HubKind,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    verifier: Arc<TokenVerifier>,
}

impl Hub {
    pub fn new(kind: HubKind, verifier: Arc<TokenVerifier>) -> Self {
        Self {
            kind,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            verifier,
        }
    }

    /// Drops `payload` silently if `identity` has no live session. Never
    /// blocks on a slow reader: the bounded channel applies backpressure to
    /// the writer task, not to the caller, up to its capacity, after which
    /// the frame is dropped rather than stalling the orchestrator.
    pub async fn push(&self, identity: Uuid, payload: serde_json::Value) {
        let session = self.sessions.read().await.get(&identity).cloned();
        if let Some(session) = session {
            if session.send_tx.try_send(payload).is_err() {
                warn!(%identity, "dropping push: session send queue full or closed");
            }
        } else {
            debug!(%identity, "dropping push: no live session");
        }
    }

    async fn install(&self, identity: Uuid, session: Session) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&identity) {
            return Err(EngineError::Conflict("already connected in other ws".into()));
        }
        sessions.insert(identity, session);
        Ok(())
    }

    async fn evict(&self, identity: Uuid) {
        self.sessions.write().await.remove(&identity);
    }

    /// Drives one accepted WebSocket connection end to end: auth handshake,
    /// installation in the map, reader/writer/ping tasks, and eviction on
    /// close. `path_id` is the identity segment of the URL the client
    /// connected to.
    pub async fn handle_socket(&self, socket: WebSocket, path_id: Uuid) {
        let (mut sink, mut stream) = socket.split();

        let claims = match timeout(AUTH_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Auth { token }) => match self.verifier.verify(&token) {
                    Ok(claims) => claims,
                    Err(e) => {
                        send_error_and_close(&mut sink, &e.to_string()).await;
                        return;
                    }
                },
                Err(_) => {
                    send_error_and_close(&mut sink, "expected auth frame").await;
                    return;
                }
            },
            _ => {
                send_error_and_close(&mut sink, "auth frame timed out").await;
                return;
            }
        };

        if claims.user_id != path_id || !self.kind.claim_role_ok(&claims) {
            send_error_and_close(&mut sink, "claims do not match connection").await;
            return;
        }

        let (send_tx, mut send_rx) = mpsc::channel::<serde_json::Value>(SEND_QUEUE_DEPTH);
        if let Err(e) = self.install(path_id, Session { send_tx }).await {
            send_error_and_close(&mut sink, &e.to_string()).await;
            return;
        }

        if sink
            .send(Message::Text(
                serde_json::json!({ "msg": "please wait" }).to_string().into(),
            ))
            .await
            .is_err()
        {
            self.evict(path_id).await;
            return;
        }

        info!(identity = %path_id, kind = ?self.kind, "websocket session established");

        let writer = tokio::spawn(async move {
            let mut ping_ticker = interval(PING_PERIOD);
            loop {
                tokio::select! {
                    _ = ping_ticker.tick() => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    frame = send_rx.recv() => {
                        match frame {
                            Some(payload) => {
                                if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Only a Pong rearms the deadline; any other frame (or a gap with no
        // frames at all) just keeps counting down from the last pong.
        let mut last_pong = tokio::time::Instant::now();
        loop {
            let remaining = PONG_TIMEOUT.saturating_sub(last_pong.elapsed());
            if remaining.is_zero() {
                warn!(identity = %path_id, "missed pong deadline, closing session");
                break;
            }
            match timeout(remaining, stream.next()).await {
                Ok(Some(Ok(Message::Pong(_)))) => {
                    last_pong = tokio::time::Instant::now();
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => break,
                Err(_) => {
                    warn!(identity = %path_id, "missed pong deadline, closing session");
                    break;
                }
            }
        }

        writer.abort();
        self.evict(path_id).await;
        info!(identity = %path_id, kind = ?self.kind, "websocket session closed");
    }
}

async fn send_error_and_close(
    sink: &mut (impl futures::Sink<Message> + Unpin),
    message: &str,
) {
    let frame = serde_json::json!({ "error": message }).to_string();
    let _ = sink.send(Message::Text(frame.into())).await;
    let _ = sink.close().await;
}
