//! WebSocket JSON-RPC client with automatic reconnect.
//!
//! A background task owns the socket. Request/response calls survive
//! reconnects transparently (they queue while the connection is down), but
//! subscriptions intentionally do not: when the connection drops, every
//! subscription channel ends, because the consumer must not assume the live
//! stream resumes where it left off — it has to re-read the chain head,
//! backfill anything missed over RPC, and only then subscribe again.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use crate::retry::{RetryConfig, RetryPolicy};

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Connect + handshake timeout.
    pub handshake_timeout: Duration,
    /// Reconnect backoff policy.
    pub reconnect: RetryConfig,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            reconnect: RetryConfig::default(),
        }
    }
}

/// A subscription ID as issued by the node (decimal or hex, normalized to
/// its string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type CallReply = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type SubscribeReply =
    oneshot::Sender<Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError>>;

enum WsCommand {
    Call {
        req: JsonRpcRequest,
        tx: CallReply,
    },
    Subscribe {
        method: String,
        params: Vec<Value>,
        tx: SubscribeReply,
    },
    Close,
}

/// WebSocket JSON-RPC client.
pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    next_id: std::sync::atomic::AtomicU64,
}

impl WsRpcClient {
    /// Start the background connection task. Returns immediately; the first
    /// connect happens lazily when the task spins up.
    pub fn connect(url: impl Into<String>, config: WsClientConfig) -> Self {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(ws_task(url.clone(), cmd_rx, config));
        Self {
            url,
            cmd_tx,
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a single request over the socket and await its response.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Call {
                req: JsonRpcRequest::new(id, method, params),
                tx,
            })
            .map_err(|_| TransportError::WebSocket("connection task closed".into()))?;
        rx.await
            .map_err(|_| TransportError::WebSocket("connection task dropped the call".into()))?
    }

    /// Open a subscription. The returned receiver yields notification
    /// payloads until the connection drops, then ends.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Subscribe {
                method: method.to_string(),
                params,
                tx,
            })
            .map_err(|_| TransportError::WebSocket("connection task closed".into()))?;
        rx.await
            .map_err(|_| TransportError::WebSocket("connection task dropped the call".into()))?
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

// ─── Background task ──────────────────────────────────────────────────────────

/// Per-connection state, discarded on every disconnect.
#[derive(Default)]
struct ConnState {
    pending_calls: HashMap<u64, CallReply>,
    pending_subs: HashMap<u64, SubscribeReply>,
    active_subs: HashMap<SubscriptionId, mpsc::UnboundedSender<Value>>,
    /// Request ids for subscribe calls, disjoint from the caller-assigned
    /// call ids.
    next_sub_req_id: u64,
}

impl ConnState {
    fn fail_pending(&mut self, reason: &str) {
        for (_, tx) in self.pending_calls.drain() {
            let _ = tx.send(Err(TransportError::WebSocket(reason.into())));
        }
        for (_, tx) in self.pending_subs.drain() {
            let _ = tx.send(Err(TransportError::WebSocket(reason.into())));
        }
        // Dropping the senders ends every subscription stream.
        self.active_subs.clear();
    }
}

async fn ws_task(url: String, mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>, config: WsClientConfig) {
    let policy = RetryPolicy::new(config.reconnect);
    let mut queued: VecDeque<WsCommand> = VecDeque::new();
    let mut attempt = 0u32;

    'reconnect: loop {
        attempt += 1;
        tracing::debug!(url = %url, attempt, "connecting websocket");

        let conn =
            time::timeout(config.handshake_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await;
        let ws_stream = match conn {
            Err(_) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(url = %url, "websocket handshake timed out, retrying in {delay:?}");
                if backoff_sleep(delay, &mut cmd_rx, &mut queued).await.is_break() {
                    return;
                }
                continue;
            }
            Ok(Err(e)) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(url = %url, error = %e, "websocket connect failed, retrying in {delay:?}");
                if backoff_sleep(delay, &mut cmd_rx, &mut queued).await.is_break() {
                    return;
                }
                continue;
            }
            Ok(Ok((stream, _))) => stream,
        };

        attempt = 0;
        let (mut sink, mut stream) = ws_stream.split();
        let mut state = ConnState::default();

        // Flush commands that arrived while disconnected.
        while let Some(cmd) = queued.pop_front() {
            match apply_command(cmd, &mut sink, &mut state).await {
                CommandOutcome::Ok => {}
                CommandOutcome::Close => return,
                CommandOutcome::ConnectionLost => {
                    state.fail_pending("connection lost");
                    continue 'reconnect;
                }
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    match apply_command(cmd, &mut sink, &mut state).await {
                        CommandOutcome::Ok => {}
                        CommandOutcome::Close => return,
                        CommandOutcome::ConnectionLost => break,
                    }
                }
                msg = stream.next() => {
                    match msg {
                        None => break,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "websocket receive error");
                            break;
                        }
                        Some(Ok(Message::Text(text))) => handle_message(text.as_str(), &mut state),
                        Some(Ok(Message::Close(_))) => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        state.fail_pending("connection lost");
        tracing::warn!(url = %url, "websocket disconnected, reconnecting");
    }
}

enum CommandOutcome {
    Ok,
    Close,
    ConnectionLost,
}

async fn apply_command<S>(cmd: WsCommand, sink: &mut S, state: &mut ConnState) -> CommandOutcome
where
    S: futures::Sink<Message> + Unpin,
{
    let req = match cmd {
        WsCommand::Close => return CommandOutcome::Close,
        WsCommand::Call { req, tx } => {
            let id = match req.id {
                RpcId::Number(n) => n,
                _ => 0,
            };
            state.pending_calls.insert(id, tx);
            req
        }
        WsCommand::Subscribe { method, params, tx } => {
            // Subscribe requests get ids in a range the call path never uses
            // so responses can be told apart per connection.
            state.next_sub_req_id += 1;
            let id = 1_000_000_000 + state.next_sub_req_id;
            state.pending_subs.insert(id, tx);
            JsonRpcRequest::new(id, method, params)
        }
    };

    let Ok(text) = serde_json::to_string(&req) else {
        return CommandOutcome::Ok;
    };
    if sink.send(Message::Text(text.into())).await.is_err() {
        return CommandOutcome::ConnectionLost;
    }
    CommandOutcome::Ok
}

fn handle_message(text: &str, state: &mut ConnState) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("unparseable websocket message");
        return;
    };

    // Subscription notification: method carries the subscription kind,
    // params carry the subscription id and the payload.
    if let Some(method) = val.get("method").and_then(Value::as_str) {
        if method.starts_with("starknet_subscription") {
            let Some(params) = val.get("params") else { return };
            let Some(id) = params.get("subscription_id").map(subscription_key) else {
                return;
            };
            if let Some(sender) = state.active_subs.get(&id) {
                let payload = params.get("result").cloned().unwrap_or(Value::Null);
                let _ = sender.send(payload);
            }
            return;
        }
    }

    // Regular response.
    let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(text) else {
        return;
    };
    let RpcId::Number(id) = resp.id else { return };

    if let Some(tx) = state.pending_subs.remove(&id) {
        let reply = if let Some(err) = resp.error {
            Err(TransportError::Rpc(err))
        } else {
            match resp.result {
                Some(result) => {
                    let sub_id = subscription_key(&result);
                    let (sender, receiver) = mpsc::unbounded_channel();
                    state.active_subs.insert(sub_id.clone(), sender);
                    Ok((sub_id, receiver))
                }
                None => Err(TransportError::MalformedResponse(
                    "subscribe response carries no subscription id".into(),
                )),
            }
        };
        let _ = tx.send(reply);
        return;
    }

    if let Some(tx) = state.pending_calls.remove(&id) {
        let _ = tx.send(Ok(JsonRpcResponse {
            jsonrpc: resp.jsonrpc,
            id: RpcId::Number(id),
            result: resp.result,
            error: resp.error,
        }));
    }
}

/// Nodes issue subscription ids as integers or strings; normalize both.
fn subscription_key(value: &Value) -> SubscriptionId {
    match value {
        Value::String(s) => SubscriptionId(s.clone()),
        other => SubscriptionId(other.to_string()),
    }
}

enum SleepOutcome {
    Elapsed,
    Closed,
}

impl SleepOutcome {
    fn is_break(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Sleep out a reconnect delay while still reacting to `Close` and buffering
/// any other commands for the next connection.
async fn backoff_sleep(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    queued: &mut VecDeque<WsCommand>,
) -> SleepOutcome {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => return SleepOutcome::Elapsed,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Close) => return SleepOutcome::Closed,
                Some(other) => queued.push_back(other),
            }
        }
    }
}
