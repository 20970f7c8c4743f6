//! Shared test utilities: an in-memory backend standing in for the feed.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use quoteline::config::{FeedConfig, StreamConfig};
use quoteline::websocket::{
    ConnectionManager, Connector, Outbound, Requester, RetryPolicy, Socket, SubscriptionRegistry,
};
use quoteline::{QuotelineError, Result};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Live feed endpoint used by the integration tests.
pub const LIVE_WS_URL: &str = "wss://ws.derivws.com/websockets/v3?app_id=1089&l=EN";

const WAIT: Duration = Duration::from_secs(5);

/// Hands each dialed socket to the test as a [`MockSocket`].
pub struct MockConnector {
    sockets: mpsc::UnboundedSender<MockSocket>,
    connects: AtomicUsize,
    fail: AtomicBool,
}

impl MockConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes every following connect attempt fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Socket>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(QuotelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.sockets.send(MockSocket {
            requests: out_rx,
            replies: Some(in_tx),
        });
        Box::pin(async move {
            Ok(Socket {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Receives the sockets dialed through a [`MockConnector`].
pub struct MockBackend {
    sockets: mpsc::UnboundedReceiver<MockSocket>,
}

impl MockBackend {
    /// Waits for the next connection.
    pub async fn accept(&mut self) -> MockSocket {
        tokio::time::timeout(WAIT, self.sockets.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

/// Backend side of one connection.
pub struct MockSocket {
    requests: mpsc::UnboundedReceiver<Outbound>,
    replies: Option<mpsc::UnboundedSender<String>>,
}

impl MockSocket {
    /// Next frame sent by the client, text or close.
    pub async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(WAIT, self.requests.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("client dropped the socket")
    }

    /// Next JSON request sent by the client.
    pub async fn next_request(&mut self) -> Value {
        match self.next_outbound().await {
            Outbound::Text(text) => serde_json::from_str(&text).expect("request is not JSON"),
            Outbound::Close => panic!("expected a request, got a close"),
        }
    }

    /// A request that has already been sent, if any.
    pub fn try_next_request(&mut self) -> Option<Value> {
        loop {
            match self.requests.try_recv().ok()? {
                Outbound::Text(text) => {
                    return Some(serde_json::from_str(&text).expect("request is not JSON"));
                }
                Outbound::Close => continue,
            }
        }
    }

    /// Answers `request` with `body`, echoing its `req_id` and parameters.
    pub fn reply(&self, request: &Value, mut body: Value) {
        body["req_id"] = request["req_id"].clone();
        body["echo_req"] = request.clone();
        self.push(body);
    }

    /// Sends an unsolicited message.
    pub fn push(&self, body: Value) {
        if let Some(replies) = &self.replies {
            let _ = replies.send(body.to_string());
        }
    }

    /// Drops the backend end, as if the network went away.
    pub fn drop_connection(&mut self) {
        self.replies = None;
    }
}

/// Creates a connector and the backend receiving its sockets.
pub fn mock_backend() -> (Arc<MockConnector>, MockBackend) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        sockets: tx,
        connects: AtomicUsize::new(0),
        fail: AtomicBool::new(false),
    });
    (connector, MockBackend { sockets: rx })
}

/// Retry policy short enough to keep real-time tests fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

pub fn stream_config() -> StreamConfig {
    StreamConfig {
        retry: fast_retry(),
        ..StreamConfig::default()
    }
}

/// A full client stack wired to an in-memory backend.
pub struct Harness {
    pub connector: Arc<MockConnector>,
    pub backend: MockBackend,
    pub manager: Arc<ConnectionManager>,
    pub requester: Requester,
    pub registry: SubscriptionRegistry,
}

pub fn harness() -> Harness {
    harness_with(&FeedConfig::default(), &stream_config())
}

pub fn harness_with(feed: &FeedConfig, stream: &StreamConfig) -> Harness {
    let (connector, backend) = mock_backend();
    let manager = Arc::new(ConnectionManager::new(connector.clone(), feed));
    let requester = Requester::new(Arc::clone(&manager), stream.retry);
    let registry =
        SubscriptionRegistry::spawn(requester.clone(), stream).expect("feed already claimed");
    Harness {
        connector,
        backend,
        manager,
        requester,
        registry,
    }
}

/// Body of a tick history reply.
pub fn history_body(prices: &[f64], times: &[i64], subscription_id: Option<&str>) -> Value {
    let mut body = json!({
        "msg_type": "history",
        "history": {"prices": prices, "times": times}
    });
    if let Some(id) = subscription_id {
        body["subscription"] = json!({"id": id});
    }
    body
}

/// Body of a candles reply; each candle is `(epoch, close)`.
pub fn candles_body(candles: &[(i64, f64)], subscription_id: Option<&str>) -> Value {
    let candles: Vec<Value> = candles
        .iter()
        .map(|(epoch, close)| {
            json!({"epoch": epoch, "open": 1.0, "high": 2.0, "low": 0.5, "close": close})
        })
        .collect();
    let mut body = json!({"msg_type": "candles", "candles": candles});
    if let Some(id) = subscription_id {
        body["subscription"] = json!({"id": id});
    }
    body
}

pub fn tick_push(symbol: &str, epoch: i64, quote: f64, subscription_id: &str) -> Value {
    json!({
        "msg_type": "tick",
        "subscription": {"id": subscription_id},
        "tick": {"epoch": epoch, "quote": quote, "symbol": symbol, "id": subscription_id}
    })
}

pub fn error_body(code: &str) -> Value {
    json!({"error": {"code": code, "message": format!("{code} raised by test backend")}})
}

/// Collects everything a callback receives.
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(T) + Send + Sync + 'static {
        let items = Arc::clone(&self.items);
        move |item| items.lock().push(item)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn all(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn last(&self) -> Option<T> {
        self.items.lock().last().cloned()
    }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Answers every request on `socket` with `handler`, recording the requests.
/// A `None` from the handler leaves the request unanswered.
pub fn serve(
    mut socket: MockSocket,
    mut handler: impl FnMut(&Value) -> Option<Value> + Send + 'static,
) -> (Arc<Mutex<Vec<Value>>>, JoinHandle<MockSocket>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let task = tokio::spawn(async move {
        while let Some(Outbound::Text(text)) = socket.requests.recv().await {
            let request: Value = serde_json::from_str(&text).expect("request is not JSON");
            log.lock().push(request.clone());
            if let Some(body) = handler(&request) {
                socket.reply(&request, body);
            }
        }
        socket
    });
    (seen, task)
}
