//! Event subscriptions over WebSocket.
//!
//! [`WsEventSource`] implements [`EventSource`] for the core
//! [`EventStreamManager`](ledgerrpc_core::EventStreamManager). Every opened
//! stream gets its own socket:
//!
//! ```text
//! -> {"method":"subscribeEvents","params":{"filter":{..},"startAfter":41}}
//! <- {"result":"sub-9f2c"}
//! <- {"method":"eventNotification","params":{"subscription":"sub-9f2c","result":{"cursor":42,..}}}
//! ```
//!
//! Gaps are closed with a one-shot `replayEvents` call that returns the
//! missed events and the cursor the replay covers. Reconnects, ordering and
//! deduplication are the manager's job; this module only speaks the wire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use ledgerrpc_core::endpoint::Endpoint;
use ledgerrpc_core::error::{RpcError, ServerError};
use ledgerrpc_core::request::{IdGenerator, JsonRpcRequest, JsonRpcResponse};
use ledgerrpc_core::stream::{EventFilter, EventSource, EventStream, LedgerEvent, ResyncSnapshot};
use ledgerrpc_core::transport::Connection;

use crate::client::{WsConnection, WsConnector};

/// Wire method names of the subscription protocol.
pub mod wire {
    pub const SUBSCRIBE: &str = "subscribeEvents";
    pub const REPLAY: &str = "replayEvents";
    pub const NOTIFICATION: &str = "eventNotification";
}

/// Streams ledger events from one WebSocket endpoint.
#[derive(Debug)]
pub struct WsEventSource {
    connector: WsConnector,
    endpoint: Endpoint,
    request_timeout: Duration,
    ids: Arc<IdGenerator>,
}

impl WsEventSource {
    pub fn new(connector: WsConnector, endpoint: Endpoint) -> Self {
        Self {
            connector,
            endpoint,
            request_timeout: Duration::from_secs(10),
            ids: Arc::new(IdGenerator::new()),
        }
    }

    /// Bound on the subscribe and replay calls.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(&self, conn: &WsConnection, method: &str, params: Value) -> Result<Value, RpcError> {
        let req = JsonRpcRequest::new(self.ids.next(), method, params);
        let resp = tokio::time::timeout(self.request_timeout, conn.send(&req, None))
            .await
            .map_err(|_| RpcError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            })??;
        unwrap_reply(resp)
    }
}

fn unwrap_reply(resp: JsonRpcResponse) -> Result<Value, RpcError> {
    resp.into_result()
        .map_err(|e| RpcError::Server(ServerError::from(e)))
}

#[derive(Deserialize)]
struct ReplayReply {
    #[serde(default)]
    events: Vec<LedgerEvent>,
    cursor: u64,
}

/// Extract the event carried by a notification for `subscription`.
///
/// Returns `None` for frames that belong to someone else.
fn parse_notification(frame: &Value, subscription: &str) -> Option<Result<LedgerEvent, RpcError>> {
    if frame.get("method").and_then(Value::as_str) != Some(wire::NOTIFICATION) {
        return None;
    }
    let params = frame.get("params")?;
    if params.get("subscription").and_then(Value::as_str) != Some(subscription) {
        return None;
    }
    let result = params.get("result").cloned().unwrap_or(Value::Null);
    Some(serde_json::from_value(result).map_err(RpcError::from))
}

#[async_trait]
impl EventSource for WsEventSource {
    async fn open(
        &self,
        filter: &EventFilter,
        resume_after: Option<u64>,
    ) -> Result<EventStream, RpcError> {
        let conn = self.connector.open(&self.endpoint, None).await?;
        let notifications = conn
            .take_notifications()
            .ok_or_else(|| RpcError::Transport("notification channel already taken".into()))?;

        let reply = self
            .call(
                &conn,
                wire::SUBSCRIBE,
                json!({ "filter": filter, "startAfter": resume_after }),
            )
            .await?;
        let subscription = match reply {
            Value::String(s) => s,
            other => other.to_string(),
        };
        tracing::info!(
            url = %self.endpoint.url(),
            subscription = %subscription,
            resume_after = ?resume_after,
            "event subscription opened"
        );

        // The connection rides along with the stream; dropping the stream
        // closes the socket.
        let state = (notifications, Arc::new(conn), subscription);
        let stream = futures::stream::unfold(state, |(mut rx, conn, sub)| async move {
            loop {
                let frame = rx.recv().await?;
                if let Some(item) = parse_notification(&frame, &sub) {
                    return Some((item, (rx, conn, sub)));
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn resync(&self, filter: &EventFilter, after: u64) -> Result<ResyncSnapshot, RpcError> {
        let conn = self.connector.open(&self.endpoint, None).await?;
        let reply = self
            .call(&conn, wire::REPLAY, json!({ "filter": filter, "after": after }))
            .await;
        conn.close();

        let replay: ReplayReply = serde_json::from_value(reply?)?;
        tracing::debug!(
            after,
            replayed = replay.events.len(),
            cursor = replay.cursor,
            "event replay received"
        );
        Ok(ResyncSnapshot {
            events: replay.events,
            cursor: replay.cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use ledgerrpc_core::cache::StateKey;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn event_json(cursor: u64) -> Value {
        json!({
            "cursor": cursor,
            "key": {"kind": "contract", "id": "CCW67TSZV3SSS2HXMBQ5JFGCKJNXKZM7UQUWUZPUTHXSTZLEO7SJMI75"},
            "version": 1000 + cursor,
            "payload": {"topic": "transfer"}
        })
    }

    #[test]
    fn notifications_are_matched_to_their_subscription() {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": wire::NOTIFICATION,
            "params": {"subscription": "sub-1", "result": event_json(5)}
        });
        let event = parse_notification(&frame, "sub-1").unwrap().unwrap();
        assert_eq!(event.cursor, 5);
        assert_eq!(event.version, 1005);
        assert!(matches!(event.key, StateKey::Contract(_)));

        assert!(parse_notification(&frame, "sub-2").is_none());
        assert!(parse_notification(&json!({"method": "other"}), "sub-1").is_none());
    }

    #[test]
    fn malformed_event_is_an_error() {
        let frame = json!({
            "method": wire::NOTIFICATION,
            "params": {"subscription": "sub-1", "result": {"cursor": "nope"}}
        });
        let err = parse_notification(&frame, "sub-1").unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Deserialization(_)));
    }

    /// A node that answers `subscribeEvents` and pushes events after
    /// `startAfter`, and answers `replayEvents` with a fixed snapshot.
    async fn event_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let req: Value = serde_json::from_str(&text).unwrap();
                        match req["method"].as_str().unwrap() {
                            wire::SUBSCRIBE => {
                                let start = req["params"]["startAfter"].as_u64().unwrap_or(0);
                                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": "sub-7"});
                                ws.send(Message::Text(reply.to_string())).await.unwrap();
                                for cursor in start + 1..=start + 3 {
                                    let note = json!({
                                        "jsonrpc": "2.0",
                                        "method": wire::NOTIFICATION,
                                        "params": {"subscription": "sub-7", "result": event_json(cursor)}
                                    });
                                    ws.send(Message::Text(note.to_string())).await.unwrap();
                                }
                            }
                            wire::REPLAY => {
                                let after = req["params"]["after"].as_u64().unwrap();
                                let reply = json!({
                                    "jsonrpc": "2.0",
                                    "id": req["id"],
                                    "result": {"events": [event_json(after + 1)], "cursor": after + 2}
                                });
                                ws.send(Message::Text(reply.to_string())).await.unwrap();
                            }
                            _ => {
                                let reply = json!({
                                    "jsonrpc": "2.0",
                                    "id": req["id"],
                                    "error": {"code": -32601, "message": "method not found"}
                                });
                                ws.send(Message::Text(reply.to_string())).await.unwrap();
                            }
                        }
                    }
                });
            }
        });
        url
    }

    #[tokio::test]
    async fn open_streams_events_after_resume_cursor() {
        let url = event_node().await;
        let source = WsEventSource::new(WsConnector::default(), Endpoint::new(url));

        let stream = source.open(&EventFilter::default(), Some(40)).await.unwrap();
        let cursors: Vec<u64> = stream
            .take(3)
            .map(|e| e.unwrap().cursor)
            .collect()
            .await;
        assert_eq!(cursors, vec![41, 42, 43]);
    }

    #[tokio::test]
    async fn resync_returns_replayed_events_and_cursor() {
        let url = event_node().await;
        let source = WsEventSource::new(WsConnector::default(), Endpoint::new(url));

        let snapshot = source.resync(&EventFilter::contract("C1"), 10).await.unwrap();
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.events[0].cursor, 11);
        assert_eq!(snapshot.cursor, 12);
    }

    #[test]
    fn server_rejection_keeps_its_code() {
        let resp = JsonRpcResponse::failure(1, -32601, "method not found");
        let err = unwrap_reply(resp).unwrap_err();
        assert_eq!(err.server_code(), Some(-32601));
    }
}
