//! Multiplexed WebSocket JSON-RPC connection.
//!
//! One background task owns the socket. Callers hand it requests over a
//! command channel and wait on a oneshot keyed by the wire id, so any number
//! of calls share the connection and replies may arrive in any order.
//! Server-pushed notifications (frames with a `method` and no `id`) are
//! forwarded to a separate channel that the event source consumes.
//!
//! A connection does not reconnect itself: once the socket drops every
//! pending call fails with a transport error and [`Connection::is_open`]
//! turns false, so the core transport retires it and opens a fresh one.
//!
//! The bearer credential travels on the upgrade request. A socket is bound to
//! the credential it connected with and [`Connection::accepts`] reports any
//! other, so a rotated token makes the transport open a new socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use ledgerrpc_core::endpoint::{BearerToken, Endpoint};
use ledgerrpc_core::error::RpcError;
use ledgerrpc_core::request::{JsonRpcRequest, JsonRpcResponse};
use ledgerrpc_core::transport::{Connection, Connector};

type Reply = oneshot::Sender<Result<JsonRpcResponse, RpcError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

/// Configuration for [`WsConnector`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Sent as `Authorization: Bearer ...` on the upgrade request when the
    /// caller supplies no credential of its own.
    pub credential: Option<BearerToken>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            credential: None,
        }
    }
}

/// Opens [`WsConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsConfig,
}

impl WsConnector {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Perform the handshake and start the connection task.
    ///
    /// `auth` authenticates the socket; without one the configured
    /// credential, if any, is used.
    pub async fn open(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Result<WsConnection, RpcError> {
        let url = endpoint.url().to_string();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RpcError::Config(format!("invalid websocket url {url}: {e}")))?;
        let credential = auth.or(self.config.credential.as_ref()).cloned();
        if let Some(token) = &credential {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|e| RpcError::Config(format!("invalid credential: {e}")))?;
            request.headers_mut().insert("authorization", value);
        }

        let handshake = tokio_tungstenite::connect_async(request);
        let (socket, _) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| RpcError::ConnectTimeout {
                endpoint: url.clone(),
                ms: self.config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| RpcError::Transport(format!("websocket handshake failed: {e}")))?;

        tracing::debug!(url = %url, "websocket connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(ws_task(
            url.clone(),
            socket,
            cmd_rx,
            notify_tx,
            Arc::clone(&open),
        ));

        Ok(WsConnection {
            url,
            cmd_tx,
            open,
            credential,
            fallback: self.config.credential.clone(),
            notifications: Mutex::new(Some(notify_rx)),
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: Option<&BearerToken>,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        Ok(Arc::new(self.open(endpoint, auth).await?))
    }
}

/// Command sent from callers to the background task.
enum WsCommand {
    Send { req: JsonRpcRequest, tx: Reply },
    Close,
}

/// One live WebSocket session.
pub struct WsConnection {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    open: Arc<AtomicBool>,
    /// Credential presented at the handshake.
    credential: Option<BearerToken>,
    fallback: Option<BearerToken>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl WsConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Take the notification channel. Only the first caller gets it; the
    /// channel ends when the socket closes.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.notifications.lock().take()
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("url", &self.url)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(
        &self,
        req: &JsonRpcRequest,
        _auth: Option<&BearerToken>,
    ) -> Result<JsonRpcResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send {
                req: req.clone(),
                tx,
            })
            .map_err(|_| RpcError::Transport("websocket task closed".into()))?;
        rx.await
            .map_err(|_| RpcError::Transport("websocket reply dropped".into()))?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.cmd_tx.send(WsCommand::Close);
    }

    fn accepts(&self, auth: Option<&BearerToken>) -> bool {
        auth.or(self.fallback.as_ref()) == self.credential.as_ref()
    }
}

/// Background task that owns the socket.
async fn ws_task<S>(
    url: String,
    socket: S,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    notify_tx: mpsc::UnboundedSender<Value>,
    open: Arc<AtomicBool>,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin
        + Send
        + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break "closed locally".to_string();
                }
                Some(WsCommand::Send { req, tx }) => {
                    let Some(id) = req.id.as_number() else {
                        let _ = tx.send(Err(RpcError::Transport(
                            "websocket calls need a numeric id".into(),
                        )));
                        continue;
                    };
                    let frame = match serde_json::to_string(&req) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let _ = tx.send(Err(e.into()));
                            continue;
                        }
                    };
                    {
                        let mut pending = pending.lock();
                        // Callers that gave up (attempt timeout) leave closed senders behind.
                        pending.retain(|_, waiting| !waiting.is_closed());
                        pending.insert(id, tx);
                    }
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        break format!("send failed: {e}");
                    }
                }
            },
            msg = stream.next() => match msg {
                None => break "stream ended".to_string(),
                Some(Err(e)) => break format!("receive failed: {e}"),
                Some(Ok(Message::Text(text))) => handle_message(&text, &pending, &notify_tx),
                Some(Ok(Message::Close(_))) => break "closed by peer".to_string(),
                Some(Ok(_)) => {}
            },
        }
    };

    open.store(false, Ordering::Release);
    let orphaned: Vec<Reply> = pending.lock().drain().map(|(_, tx)| tx).collect();
    tracing::debug!(url = %url, reason = %reason, orphaned = orphaned.len(), "websocket closed");
    for tx in orphaned {
        let _ = tx.send(Err(RpcError::Transport(format!("websocket {reason}"))));
    }
}

/// Route one inbound frame: replies by wire id, notifications to the
/// notification channel.
fn handle_message(text: &str, pending: &PendingMap, notify_tx: &mpsc::UnboundedSender<Value>) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("dropping non-JSON websocket frame");
        return;
    };

    if val.get("method").is_some() && val.get("id").map_or(true, Value::is_null) {
        let _ = notify_tx.send(val);
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(resp) => {
            let Some(id) = resp.id.as_number() else {
                return;
            };
            match pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(resp));
                }
                None => tracing::debug!(id, "reply for unknown or abandoned call"),
            }
        }
        Err(e) => tracing::debug!(error = %e, "unrecognised websocket frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerrpc_core::request::methods;
    use ledgerrpc_core::{CallPolicy, CircuitBreakerConfig, DirectTransport, Dispatcher, Transport};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn channels() -> (PendingMap, mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Mutex::new(HashMap::new())), tx, rx)
    }

    #[test]
    fn replies_are_routed_by_wire_id() {
        let (pending, notify_tx, _notify_rx) = channels();
        let (tx3, mut rx3) = oneshot::channel();
        let (tx4, mut rx4) = oneshot::channel();
        pending.lock().insert(3, tx3);
        pending.lock().insert(4, tx4);

        handle_message(r#"{"jsonrpc":"2.0","id":4,"result":"four"}"#, &pending, &notify_tx);
        assert!(rx3.try_recv().is_err());
        let four = rx4.try_recv().unwrap().unwrap();
        assert_eq!(four.result, Some(json!("four")));
        assert_eq!(pending.lock().len(), 1);
    }

    #[test]
    fn notifications_bypass_pending_calls() {
        let (pending, notify_tx, mut notify_rx) = channels();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert(1, tx);

        handle_message(
            r#"{"jsonrpc":"2.0","method":"eventNotification","params":{"subscription":"s1","result":{}}}"#,
            &pending,
            &notify_tx,
        );
        let note = notify_rx.try_recv().unwrap();
        assert_eq!(note["params"]["subscription"], "s1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn garbage_and_unknown_ids_are_ignored() {
        let (pending, notify_tx, mut notify_rx) = channels();
        handle_message("not json", &pending, &notify_tx);
        handle_message(r#"{"jsonrpc":"2.0","id":99,"result":1}"#, &pending, &notify_tx);
        assert!(notify_rx.try_recv().is_err());
    }

    /// Reads `batch` requests, then answers them in reverse order echoing
    /// `params` as the result, then closes.
    async fn reversing_server(batch: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut seen = Vec::new();
            while seen.len() < batch {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        seen.push(serde_json::from_str::<Value>(&text).unwrap())
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                }
            }
            for req in seen.into_iter().rev() {
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": req["params"]});
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        url
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_socket() {
        let url = reversing_server(2).await;
        let conn = WsConnector::default().open(&Endpoint::new(url), None).await.unwrap();

        let a = JsonRpcRequest::new(10, methods::GET_HEALTH, json!({"n": "a"}));
        let b = JsonRpcRequest::new(11, methods::GET_HEALTH, json!({"n": "b"}));
        let (ra, rb) = tokio::join!(conn.send(&a, None), conn.send(&b, None));

        assert_eq!(ra.unwrap().result.unwrap()["n"], "a");
        assert_eq!(rb.unwrap().result.unwrap()["n"], "b");
    }

    #[tokio::test]
    async fn closed_connection_rejects_further_calls() {
        let url = reversing_server(2).await;
        let conn = WsConnector::default().open(&Endpoint::new(url), None).await.unwrap();

        // The server holds replies until it has seen two requests.
        let only = JsonRpcRequest::new(1, methods::GET_HEALTH, Value::Null);
        let stalled = tokio::time::timeout(Duration::from_millis(200), conn.send(&only, None)).await;
        assert!(stalled.is_err());
        assert!(conn.is_open());

        conn.close();
        assert!(!conn.is_open());
        let err = conn.send(&only, None).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = WsConnector::default().open(&Endpoint::new(url), None).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    const STALL: &str = "stall";

    /// Reports the `Authorization` header of every handshake and answers
    /// each call after `delay`, echoing `params`. Calls to `stall` never get
    /// a reply.
    async fn recording_node(delay: Duration) -> (String, mpsc::UnboundedReceiver<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let auth_tx = auth_tx.clone();
                tokio::spawn(async move {
                    let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let _ = auth_tx.send(auth);
                        Ok(resp)
                    };
                    let ws = tokio_tungstenite::accept_hdr_async(tcp, record).await.unwrap();
                    let (mut sink, mut stream) = ws.split();
                    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
                    tokio::spawn(async move {
                        while let Some(reply) = out_rx.recv().await {
                            if sink.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                    });
                    while let Some(Ok(msg)) = stream.next().await {
                        let Message::Text(text) = msg else { continue };
                        let req: Value = serde_json::from_str(&text).unwrap();
                        if req["method"] == STALL {
                            continue;
                        }
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": req["params"]});
                            let _ = out_tx.send(reply);
                        });
                    }
                });
            }
        });
        (url, auth_rx)
    }

    fn shared_socket_dispatcher(endpoint: &Endpoint) -> (Arc<DirectTransport>, Dispatcher) {
        let transport = Arc::new(DirectTransport::new(
            Arc::new(WsConnector::default()),
            Duration::from_secs(2),
        ));
        let dispatcher = Dispatcher::new(
            vec![endpoint.clone()],
            transport.clone(),
            &CircuitBreakerConfig::default(),
            CallPolicy::default().no_retry(),
        )
        .unwrap();
        (transport, dispatcher)
    }

    #[tokio::test]
    async fn timed_out_call_leaves_sibling_calls_on_the_socket() {
        let (url, _auth) = recording_node(Duration::from_millis(300)).await;
        let endpoint = Endpoint::new(url);
        let (transport, dispatcher) = shared_socket_dispatcher(&endpoint);

        let short = CallPolicy::default()
            .no_retry()
            .with_attempt_timeout(Duration::from_millis(100));
        let long = CallPolicy::default()
            .no_retry()
            .with_attempt_timeout(Duration::from_secs(2));
        let stalled = dispatcher.request(STALL, Value::Null);
        let sibling = dispatcher.request(methods::GET_HEALTH, json!({"n": 1}));
        let (stalled, sibling) = tokio::join!(
            dispatcher.send(stalled, &short),
            dispatcher.send(sibling, &long)
        );

        assert!(matches!(stalled, Err(RpcError::Timeout { .. })), "{stalled:?}");
        assert_eq!(sibling.unwrap().result["n"], 1);
        assert_eq!(transport.open_connections(&endpoint), 1);
    }

    #[tokio::test]
    async fn dispatcher_credential_reaches_the_handshake() {
        let (url, mut auth) = recording_node(Duration::ZERO).await;
        let endpoint = Endpoint::new(url);
        let (transport, dispatcher) = shared_socket_dispatcher(&endpoint);
        let dispatcher = dispatcher.with_credential(BearerToken::new("secret-token"));

        let _: Value = dispatcher.call(methods::GET_HEALTH, json!({})).await.unwrap();
        assert_eq!(auth.recv().await.unwrap().as_deref(), Some("Bearer secret-token"));

        // Same token: the socket is reused, no new handshake.
        let _: Value = dispatcher.call(methods::GET_HEALTH, json!({})).await.unwrap();
        assert!(auth.try_recv().is_err());

        dispatcher.set_credential(Some(BearerToken::new("rotated")));
        let _: Value = dispatcher.call(methods::GET_HEALTH, json!({})).await.unwrap();
        assert_eq!(auth.recv().await.unwrap().as_deref(), Some("Bearer rotated"));
        assert_eq!(transport.open_connections(&endpoint), 1);
    }

    #[tokio::test]
    async fn configured_credential_is_the_fallback() {
        let (url, mut auth) = recording_node(Duration::ZERO).await;
        let connector = WsConnector::new(WsConfig {
            credential: Some(BearerToken::new("configured")),
            ..WsConfig::default()
        });
        let conn = connector.open(&Endpoint::new(url), None).await.unwrap();
        assert_eq!(auth.recv().await.unwrap().as_deref(), Some("Bearer configured"));

        assert!(conn.accepts(None));
        assert!(conn.accepts(Some(&BearerToken::new("configured"))));
        assert!(!conn.accepts(Some(&BearerToken::new("other"))));
    }
}
