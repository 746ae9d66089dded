//! WebSocket Broadcaster — one connection per `account_id`, registered in a
//! shared registry that the `portfolio_updates` subscriber fans out to.

use crate::api::ApiState;
use crate::services::broker::BrokerClient;
use crate::core::PortfolioSnapshot;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

pub type ConnectionId = u64;

/// WebSocket close codes per SPEC_FULL.md §6.
mod close_code {
    pub const POLICY: u16 = 1008;
    #[allow(dead_code)]
    pub const ERROR: u16 = 1011;
    #[allow(dead_code)]
    pub const NORMAL: u16 = 1000;
}

/// Registry of live sockets keyed by the `account_id` they are subscribed
/// to, so the pub/sub fan-out task can dispatch without a broadcast-to-all.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<String>>>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, account_id: &str, tx: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        inner.entry(account_id.to_string()).or_default().insert(id, tx);
        id
    }

    async fn unregister(&self, account_id: &str, id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(conns) = inner.get_mut(account_id) {
            conns.remove(&id);
            if conns.is_empty() {
                inner.remove(account_id);
            }
        }
    }

    /// Dispatches `payload` to every socket registered for `account_id`.
    /// Delivery is at-most-once and non-blocking: an unbounded channel
    /// means a slow consumer never back-pressures this call.
    pub async fn dispatch(&self, account_id: &str, payload: String) {
        let inner = self.inner.read().await;
        if let Some(conns) = inner.get(account_id) {
            for tx in conns.values() {
                let _ = tx.send(payload.clone());
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.values().map(|c| c.len()).sum()
    }

    pub async fn distinct_account_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

pub async fn websocket_handler<B: BrokerClient + 'static>(
    Path(account_id): Path<String>,
    headers: HeaderMap,
    State(state): State<ApiState<B>>,
    ws: WebSocketUpgrade,
) -> Response {
    let auth_result = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(crate::api::auth::extract_bearer)
        .ok_or_else(|| "missing authorization header".to_string())
        .and_then(|token| state.token_verifier.verify(token).map_err(|e| e.to_string()));

    let user_id = match auth_result {
        Ok(user_id) => user_id,
        Err(reason) => {
            warn!("websocket auth failed for account {account_id}: {reason}");
            return ws.on_upgrade(|socket| close_immediately(socket, close_code::POLICY, "authentication failed"));
        }
    };

    if let Err(e) = state.portfolio_mode.authorize_account_access(&user_id, &account_id).await {
        warn!("websocket authorization failed for user {user_id}/account {account_id}: {e}");
        return ws.on_upgrade(|socket| close_immediately(socket, close_code::POLICY, "not authorized for this account"));
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, account_id))
}

async fn close_immediately(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: Cow::Borrowed(reason) })))
        .await;
}

async fn handle_socket<B: BrokerClient + 'static>(socket: WebSocket, state: ApiState<B>, account_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let pong_tx = tx.clone();
    let connection_id = state.connections.register(&account_id, tx).await;
    info!(account_id, connection_id, "websocket connected");

    if let Ok(Some(snapshot)) = state.db.redis.get_last_portfolio::<PortfolioSnapshot>(&account_id).await {
        if let Ok(payload) = serde_json::to_string(&snapshot) {
            let _ = sender.send(Message::Text(payload)).await;
        }
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) if text == "ping" => {
                    let _ = pong_tx.send("pong".to_string());
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    state.connections.unregister(&account_id, connection_id).await;
    info!(account_id, connection_id, "websocket disconnected");
}

/// Process-wide task: one subscriber to `portfolio_updates`, dispatching
/// each message to every socket registered for its `account_id`.
pub async fn run_portfolio_updates_fanout<B: BrokerClient + 'static>(state: ApiState<B>) {
    loop {
        match state.db.redis.subscribe_portfolio_updates().await {
            Ok(mut pubsub) => {
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("portfolio_updates payload decode failed: {e}");
                            continue;
                        }
                    };
                    match serde_json::from_str::<PortfolioSnapshot>(&payload) {
                        Ok(snapshot) => state.connections.dispatch(&snapshot.account_id, payload).await,
                        Err(e) => warn!("portfolio_updates message did not parse: {e}"),
                    }
                }
                warn!("portfolio_updates subscription ended, reconnecting");
            }
            Err(e) => {
                warn!("failed to subscribe to portfolio_updates: {e}, retrying in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }
}
