//! A single multiplexed connection to the data feed.
//!
//! A [`Connection`] stamps every outbound request with a fresh `req_id` and
//! parks a oneshot for it; the read loop hands the first matching inbound
//! message back to the waiting caller. Stream pushes and lifecycle changes
//! are forwarded, in arrival order, on the manager's feed channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::handler::{self, Inbound, StreamPush};
use super::{Outbound, Socket};
use crate::Result;
use crate::error::QuotelineError;
use crate::models::ApiError;

/// Identifies one physical connection for the lifetime of a manager.
pub type ConnectionId = u64;

/// Transport state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    fn as_u8(self) -> u8 {
        match self {
            ReadyState::Open => 0,
            ReadyState::Closing => 1,
            ReadyState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Open,
            1 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Session-level connection status, suitable for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Nothing opened yet, or torn down by logout.
    Idle,
    Connecting,
    Open,
    /// The last connection dropped or could not be established.
    Closed,
}

/// Lifecycle notifications for interested callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Ready(ConnectionId),
    Lost(ConnectionId),
    /// Stored credentials should be discarded by the session owner.
    SessionInvalidated,
}

/// Ordered events consumed by the subscription registry.
#[derive(Debug)]
pub enum FeedEvent {
    Opened(ConnectionId),
    Push {
        connection: ConnectionId,
        push: StreamPush,
    },
    Closed(ConnectionId),
}

/// Channels shared between a manager and every connection it creates.
pub(crate) struct Signals {
    pub(crate) feed: mpsc::UnboundedSender<FeedEvent>,
    pub(crate) events: broadcast::Sender<ConnectionEvent>,
    pub(crate) status: watch::Sender<ConnectionStatus>,
}

/// Successful reply to a request.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Connection that carried the request.
    pub connection: ConnectionId,
    pub body: Value,
}

/// One open socket to the feed.
pub struct Connection {
    id: ConnectionId,
    outgoing: mpsc::UnboundedSender<Outbound>,
    state: AtomicU8,
    retired: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_req_id: AtomicU64,
    request_timeout: Duration,
}

impl Connection {
    /// Wraps `socket` and spawns its read loop.
    pub(crate) fn spawn(
        id: ConnectionId,
        socket: Socket,
        signals: Arc<Signals>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let Socket { outgoing, incoming } = socket;
        let connection = Arc::new(Self {
            id,
            outgoing,
            state: AtomicU8::new(ReadyState::Open.as_u8()),
            retired: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(0),
            request_timeout,
        });

        tokio::spawn(Arc::clone(&connection).read_loop(incoming, signals));
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Sends `request` and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`QuotelineError::NotConnected`] if the connection is not
    /// open, [`QuotelineError::ConnectionClosed`] if it drops before the
    /// reply, [`QuotelineError::Timeout`] if no reply arrives in time, and
    /// [`QuotelineError::Api`] if the backend answers with an error.
    pub async fn request<R: Serialize + ?Sized>(&self, request: &R) -> Result<Reply> {
        if !self.is_open() {
            return Err(QuotelineError::NotConnected);
        }

        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut value = serde_json::to_value(request)?;
        let Some(object) = value.as_object_mut() else {
            return Err(QuotelineError::MalformedMessage(
                "request must serialize to a JSON object".to_string(),
            ));
        };
        object.insert("req_id".to_string(), req_id.into());
        let text = serde_json::to_string(&value)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req_id, tx);

        if self.outgoing.send(Outbound::Text(text)).is_err() {
            self.pending.lock().remove(&req_id);
            return Err(QuotelineError::NotConnected);
        }
        debug!(connection_id = self.id, req_id, "Sent request");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(body)) => self.reply_from(body),
            Ok(Err(_)) => Err(QuotelineError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&req_id);
                warn!(connection_id = self.id, req_id, "Request timed out");
                Err(QuotelineError::Timeout(self.request_timeout))
            }
        }
    }

    /// Retires the connection and asks the transport to close.
    ///
    /// A retired connection does not report itself as lost. Returns `true`
    /// if the loss had not been reported yet, leaving that to the caller.
    pub fn close(&self) -> bool {
        let unreported = !self.retired.swap(true, Ordering::AcqRel);
        let _ = self.state.compare_exchange(
            ReadyState::Open.as_u8(),
            ReadyState::Closing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.outgoing.send(Outbound::Close);
        unreported
    }

    fn reply_from(&self, body: Value) -> Result<Reply> {
        if let Some(error) = body.get("error") {
            let error: ApiError = serde_json::from_value(error.clone())?;
            return Err(QuotelineError::Api(error));
        }
        Ok(Reply {
            connection: self.id,
            body,
        })
    }

    async fn read_loop(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<String>,
        signals: Arc<Signals>,
    ) {
        while let Some(text) = incoming.recv().await {
            match handler::classify(&text, |req_id| self.pending.lock().contains_key(&req_id)) {
                Ok(Inbound::Reply { req_id, body }) => {
                    if let Some(tx) = self.pending.lock().remove(&req_id) {
                        let _ = tx.send(body);
                    }
                }
                Ok(Inbound::Push(push)) => {
                    let _ = signals.feed.send(FeedEvent::Push {
                        connection: self.id,
                        push,
                    });
                }
                Ok(Inbound::Ignored) => {}
                Err(e) => {
                    warn!(connection_id = self.id, error = %e, "Dropping malformed message");
                }
            }
        }

        self.state.store(ReadyState::Closed.as_u8(), Ordering::Release);
        // Dropping the senders fails every outstanding request.
        self.pending.lock().clear();

        if self.retired.swap(true, Ordering::AcqRel) {
            debug!(connection_id = self.id, "Retired connection closed");
            return;
        }

        warn!(connection_id = self.id, "Connection lost");
        signals.status.send_replace(ConnectionStatus::Closed);
        let _ = signals.events.send(ConnectionEvent::Lost(self.id));
        let _ = signals.feed.send(FeedEvent::Closed(self.id));
    }
}
