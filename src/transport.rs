//! Relay transport: WebSocket clients speaking NIP-01 plus the OK acks
//! used to confirm publishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::event::{Event, EventDraft, Keys};

/// How long a publish waits for the relay's OK frame.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `get_event_by_id` waits for a match.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-subscription channel depth; slow consumers drop, folds are idempotent.
const SUB_CHANNEL_DEPTH: usize = 256;

pub type SubscriptionId = String;

/// Nostr filter limited to the fields the governance engine queries by.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub e: Option<Vec<String>>,
    pub p: Option<Vec<String>>,
    pub a: Option<Vec<String>>,
    pub t: Option<Vec<String>>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn kinds(kinds: Vec<u32>) -> Self {
        Self {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    /// Serialize to a Nostr filter object (`#e`/`#p`/`#a`/`#t` tag keys).
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        let strings = |v: &Vec<String>| Value::Array(v.iter().cloned().map(Value::String).collect());
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (key, vals) in [("#e", &self.e), ("#p", &self.p), ("#a", &self.a), ("#t", &self.t)] {
            if let Some(vals) = vals {
                obj.insert(key.into(), strings(vals));
            }
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        Value::Object(obj)
    }
}

/// Publish failures surfaced synchronously to callers; the transport never
/// retries on its own.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("relay rejected event: {0}")]
    Rejected(String),
    #[error("publish timed out waiting for relay ack")]
    Timeout,
    #[error("relay connection closed")]
    Closed,
    #[error("no relays configured")]
    NoRelays,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Collaborator contract consumed by the engine. Implemented by real relay
/// clients in production and by in-memory fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a live subscription; events flow until `unsubscribe`.
    async fn subscribe(&self, filter: Filter) -> Result<(SubscriptionId, mpsc::Receiver<Event>)>;

    /// Stop routing events for a subscription; in-flight folds stay applied.
    async fn unsubscribe(&self, sub_id: &str);

    /// Sign and publish a draft, returning the event id once a relay accepts.
    async fn publish(&self, draft: EventDraft) -> Result<String, PublishError>;

    /// Fetch one event by id, if any connected relay has it.
    async fn get_event_by_id(&self, id: &str) -> Result<Option<Event>>;
}

enum Command {
    Subscribe {
        sub_id: String,
        filter: Filter,
        tx: mpsc::Sender<Event>,
    },
    Unsubscribe {
        sub_id: String,
    },
    Publish {
        event: Event,
        ack: oneshot::Sender<Result<(), PublishError>>,
    },
}

/// Client for a single relay. One background task owns the socket; commands
/// and acks travel over channels so callers never block on the connection.
pub struct RelayClient {
    url: String,
    keys: Keys,
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_sub: AtomicU64,
}

impl RelayClient {
    /// Connect, optionally through a SOCKS5 proxy, and spawn the socket task.
    pub async fn connect(url: &str, keys: Keys, tor_socks: Option<&str>) -> Result<Self> {
        let ws = connect_ws(url, tor_socks).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let relay = url.to_string();
        tokio::spawn(async move {
            run_connection(ws, cmd_rx).await;
            debug!(relay = %relay, "relay connection task finished");
        });
        Ok(Self {
            url: url.to_string(),
            keys,
            cmd_tx,
            next_sub: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn fresh_sub_id(&self) -> String {
        format!("agora-{}", self.next_sub.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Transport for RelayClient {
    async fn subscribe(&self, filter: Filter) -> Result<(SubscriptionId, mpsc::Receiver<Event>)> {
        let sub_id = self.fresh_sub_id();
        let (tx, rx) = mpsc::channel(SUB_CHANNEL_DEPTH);
        self.cmd_tx
            .send(Command::Subscribe {
                sub_id: sub_id.clone(),
                filter,
                tx,
            })
            .map_err(|_| anyhow!("relay connection closed"))?;
        Ok((sub_id, rx))
    }

    async fn unsubscribe(&self, sub_id: &str) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            sub_id: sub_id.to_string(),
        });
    }

    async fn publish(&self, draft: EventDraft) -> Result<String, PublishError> {
        let event = self
            .keys
            .sign(draft)
            .map_err(|e| PublishError::Signing(e.to_string()))?;
        let id = event.id.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { event, ack: ack_tx })
            .map_err(|_| PublishError::Closed)?;
        match tokio::time::timeout(PUBLISH_TIMEOUT, ack_rx).await {
            Err(_) => Err(PublishError::Timeout),
            Ok(Err(_)) => Err(PublishError::Closed),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(()))) => Ok(id),
        }
    }

    async fn get_event_by_id(&self, id: &str) -> Result<Option<Event>> {
        let filter = Filter {
            ids: Some(vec![id.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        let (sub_id, mut rx) = self.subscribe(filter).await?;
        let found = match tokio::time::timeout(FETCH_TIMEOUT, rx.recv()).await {
            Ok(Some(ev)) if ev.id == id => Some(ev),
            _ => None,
        };
        self.unsubscribe(&sub_id).await;
        Ok(found)
    }
}

/// Socket loop: multiplex outgoing commands and incoming relay frames.
async fn run_connection<S>(ws: WebSocketStream<S>, mut cmd_rx: mpsc::UnboundedReceiver<Command>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut subs: HashMap<String, mpsc::Sender<Event>> = HashMap::new();
    let mut pending: HashMap<String, oneshot::Sender<Result<(), PublishError>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Subscribe { sub_id, filter, tx } => {
                        let req = json!(["REQ", sub_id, filter.to_json()]);
                        subs.insert(sub_id, tx);
                        if sink.send(Message::Text(req.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Command::Unsubscribe { sub_id } => {
                        subs.remove(&sub_id);
                        let close = json!(["CLOSE", sub_id]);
                        let _ = sink.send(Message::Text(close.to_string())).await;
                    }
                    Command::Publish { event, ack } => {
                        let frame = json!(["EVENT", event]);
                        pending.insert(event.id.clone(), ack);
                        if sink.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(txt))) => {
                        handle_frame(&txt, &mut subs, &mut pending);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    for (_, ack) in pending {
        let _ = ack.send(Err(PublishError::Closed));
    }
}

/// Dispatch one relay frame: EVENT to its subscription, OK to its publisher.
fn handle_frame(
    txt: &str,
    subs: &mut HashMap<String, mpsc::Sender<Event>>,
    pending: &mut HashMap<String, oneshot::Sender<Result<(), PublishError>>>,
) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return;
    };
    let Some(arr) = val.as_array() else { return };
    match arr.first().and_then(Value::as_str) {
        Some("EVENT") if arr.len() >= 3 => {
            let Some(sub_id) = arr[1].as_str() else { return };
            let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) else {
                return;
            };
            if let Some(tx) = subs.get(sub_id) {
                if tx.try_send(ev).is_err() {
                    warn!(sub = sub_id, "subscription channel full, dropping event");
                }
            }
        }
        Some("OK") if arr.len() >= 3 => {
            let Some(id) = arr[1].as_str() else { return };
            let accepted = arr[2].as_bool().unwrap_or(false);
            if let Some(ack) = pending.remove(id) {
                let result = if accepted {
                    Ok(())
                } else {
                    let reason = arr
                        .get(3)
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified")
                        .to_string();
                    Err(PublishError::Rejected(reason))
                };
                let _ = ack.send(result);
            }
        }
        Some("CLOSED") if arr.len() >= 2 => {
            if let Some(sub_id) = arr[1].as_str() {
                subs.remove(sub_id);
            }
        }
        // EOSE marks end of stored events; live subscriptions stay open.
        _ => {}
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Fan-out over several relays: subscriptions merge into one channel,
/// publishes succeed when any relay accepts. Duplicate deliveries are fine
/// because every fold is idempotent.
pub struct RelayPool {
    relays: Vec<Arc<RelayClient>>,
    /// pool sub id -> per-relay sub ids.
    subs: DashMap<String, Vec<(Arc<RelayClient>, SubscriptionId)>>,
    next_sub: AtomicU64,
}

impl RelayPool {
    /// Connect to every reachable relay; errors on individual relays are
    /// logged and skipped, but at least one connection must succeed.
    pub async fn connect(urls: &[String], keys: Keys, tor_socks: Option<&str>) -> Result<Self> {
        let mut relays = Vec::new();
        for url in urls {
            match RelayClient::connect(url, keys.clone(), tor_socks).await {
                Ok(client) => relays.push(Arc::new(client)),
                Err(e) => warn!(relay = %url, error = %e, "relay connection failed"),
            }
        }
        if relays.is_empty() {
            return Err(anyhow!("no relays reachable"));
        }
        Ok(Self {
            relays,
            subs: DashMap::new(),
            next_sub: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Transport for RelayPool {
    async fn subscribe(&self, filter: Filter) -> Result<(SubscriptionId, mpsc::Receiver<Event>)> {
        let pool_sub = format!("pool-{}", self.next_sub.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUB_CHANNEL_DEPTH);
        let mut handles = Vec::new();
        for relay in &self.relays {
            let (sub_id, mut relay_rx) = relay.subscribe(filter.clone()).await?;
            handles.push((relay.clone(), sub_id));
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(ev) = relay_rx.recv().await {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
            });
        }
        self.subs.insert(pool_sub.clone(), handles);
        Ok((pool_sub, rx))
    }

    async fn unsubscribe(&self, sub_id: &str) {
        if let Some((_, handles)) = self.subs.remove(sub_id) {
            for (relay, relay_sub) in handles {
                relay.unsubscribe(&relay_sub).await;
            }
        }
    }

    async fn publish(&self, draft: EventDraft) -> Result<String, PublishError> {
        let mut last_err = PublishError::NoRelays;
        for relay in &self.relays {
            match relay.publish(draft.clone()).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    warn!(relay = %relay.url(), error = %e, "publish failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn get_event_by_id(&self, id: &str) -> Result<Option<Event>> {
        for relay in &self.relays {
            if let Some(ev) = relay.get_event_by_id(id).await? {
                return Ok(Some(ev));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Tag, KIND_NOTE, KIND_VOTE};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn keys() -> Keys {
        Keys::from_secret_hex(&"01".repeat(32)).unwrap()
    }

    fn sample_event(id: &str, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: KIND_NOTE,
            created_at,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn filter_serializes_tag_keys() {
        let filter = Filter {
            kinds: Some(vec![34550, 34551]),
            e: Some(vec!["aa".into()]),
            a: Some(vec!["34550:x".into()]),
            since: Some(5),
            limit: Some(10),
            ..Default::default()
        };
        let json = filter.to_json();
        assert_eq!(json["kinds"][0], 34550);
        assert_eq!(json["#e"][0], "aa");
        assert_eq!(json["#a"][0], "34550:x");
        assert_eq!(json["since"], 5);
        assert_eq!(json["limit"], 10);
        assert!(json.get("#t").is_none());
    }

    #[tokio::test]
    async fn subscribe_receives_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let sub_id = match ws.next().await {
                Some(Ok(TMsg::Text(txt))) => {
                    let v: Value = serde_json::from_str(&txt).unwrap();
                    assert_eq!(v[0], "REQ");
                    assert_eq!(v[2]["kinds"][0], 34552);
                    v[1].as_str().unwrap().to_string()
                }
                other => panic!("expected REQ, got {other:?}"),
            };
            let ev = sample_event("aa11", 1);
            ws.send(TMsg::Text(json!(["EVENT", sub_id, ev]).to_string()))
                .await
                .unwrap();
            ws.send(TMsg::Text(json!(["EOSE", sub_id]).to_string()))
                .await
                .unwrap();
            // Keep the socket open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let client = RelayClient::connect(&format!("ws://{addr}"), keys(), None)
            .await
            .unwrap();
        let (_, mut rx) = client.subscribe(Filter::kinds(vec![KIND_VOTE])).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.id, "aa11");
        server.abort();
    }

    #[tokio::test]
    async fn publish_resolves_on_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let v: Value = serde_json::from_str(&txt).unwrap();
                assert_eq!(v[0], "EVENT");
                let id = v[1]["id"].as_str().unwrap();
                ws.send(TMsg::Text(json!(["OK", id, true, ""]).to_string()))
                    .await
                    .unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let client = RelayClient::connect(&format!("ws://{addr}"), keys(), None)
            .await
            .unwrap();
        let id = client
            .publish(EventDraft::new(KIND_VOTE, 1, vec![Tag(vec!["e".into(), "x".into()])], "0".into()))
            .await
            .unwrap();
        assert_eq!(id.len(), 64);
        server.abort();
    }

    #[tokio::test]
    async fn publish_rejected_is_typed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let v: Value = serde_json::from_str(&txt).unwrap();
                let id = v[1]["id"].as_str().unwrap();
                ws.send(TMsg::Text(
                    json!(["OK", id, false, "blocked: rate limit"]).to_string(),
                ))
                .await
                .unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let client = RelayClient::connect(&format!("ws://{addr}"), keys(), None)
            .await
            .unwrap();
        let err = client
            .publish(EventDraft::new(KIND_NOTE, 1, vec![], "hi".into()))
            .await
            .unwrap_err();
        match err {
            PublishError::Rejected(reason) => assert!(reason.contains("rate limit")),
            other => panic!("expected rejection, got {other:?}"),
        }
        server.abort();
    }

    #[tokio::test]
    async fn get_event_by_id_round_trip() {
        let keys = keys();
        let signed = keys
            .sign(EventDraft::new(KIND_NOTE, 7, vec![], "stored".into()))
            .unwrap();
        let stored = signed.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let TMsg::Text(txt) = msg {
                    let v: Value = serde_json::from_str(&txt).unwrap();
                    if v[0] == "REQ" {
                        let sub = v[1].as_str().unwrap().to_string();
                        if v[2]["ids"][0] == stored.id.as_str() {
                            ws.send(TMsg::Text(json!(["EVENT", sub, stored]).to_string()))
                                .await
                                .unwrap();
                        }
                        ws.send(TMsg::Text(json!(["EOSE", sub]).to_string()))
                            .await
                            .unwrap();
                    }
                }
            }
        });

        let client = RelayClient::connect(&format!("ws://{addr}"), keys.clone(), None)
            .await
            .unwrap();
        let found = client.get_event_by_id(&signed.id).await.unwrap().unwrap();
        assert_eq!(found, signed);
        server.abort();
    }

    #[tokio::test]
    async fn unsubscribe_sends_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (saw_close_tx, saw_close_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut tx = Some(saw_close_tx);
            while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let v: Value = serde_json::from_str(&txt).unwrap();
                if v[0] == "CLOSE" {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(v[1].as_str().unwrap().to_string());
                    }
                }
            }
        });

        let client = RelayClient::connect(&format!("ws://{addr}"), keys(), None)
            .await
            .unwrap();
        let (sub_id, _rx) = client.subscribe(Filter::default()).await.unwrap();
        client.unsubscribe(&sub_id).await;
        let closed = saw_close_rx.await.unwrap();
        assert_eq!(closed, sub_id);
        server.abort();
    }

    #[tokio::test]
    async fn connect_invalid_url_errors() {
        assert!(RelayClient::connect("not a url", keys(), None).await.is_err());
        assert!(RelayClient::connect("ws://127.0.0.1:1", keys(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn pool_requires_one_reachable_relay() {
        let urls = vec!["ws://127.0.0.1:1".to_string()];
        assert!(RelayPool::connect(&urls, keys(), None).await.is_err());
    }

    #[tokio::test]
    async fn pool_merges_subscriptions() {
        let mut addrs = Vec::new();
        let mut servers = Vec::new();
        for id in ["aa11", "bb22"] {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addrs.push(format!("ws://{}", listener.local_addr().unwrap()));
            let id = id.to_string();
            servers.push(tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                    let v: Value = serde_json::from_str(&txt).unwrap();
                    let sub = v[1].as_str().unwrap().to_string();
                    let ev = Event {
                        id: id.clone(),
                        pubkey: "p".into(),
                        kind: KIND_NOTE,
                        created_at: 1,
                        tags: vec![],
                        content: String::new(),
                        sig: String::new(),
                    };
                    ws.send(TMsg::Text(json!(["EVENT", sub, ev]).to_string()))
                        .await
                        .unwrap();
                }
                while ws.next().await.is_some() {}
            }));
        }

        let pool = RelayPool::connect(&addrs, keys(), None).await.unwrap();
        let (_, mut rx) = pool.subscribe(Filter::default()).await.unwrap();
        let mut seen = std::collections::HashSet::new();
        seen.insert(rx.recv().await.unwrap().id);
        seen.insert(rx.recv().await.unwrap().id);
        assert!(seen.contains("aa11") && seen.contains("bb22"));
        for s in servers {
            s.abort();
        }
    }
}
