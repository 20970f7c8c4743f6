//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns the single session connection: it opens it
//! lazily, collapses concurrent open attempts into one socket, replaces it on
//! demand, and counts stale-connection checks so that a connection that keeps
//! failing ends the session instead of retrying forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionStatus, FeedEvent, ReadyState, Signals,
};
use super::{Socket, connect, spawn_pump};
use crate::Result;
use crate::config::FeedConfig;
use crate::error::QuotelineError;
use crate::models::{ApiErrorKind, AuthorizeRequest, PingRequest};

const EVENT_CAPACITY: usize = 64;

/// Creates transport sockets for the manager.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Socket>>;
}

/// Dials the feed over a real WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.endpoint())
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Socket>> {
        let url = self.url.clone();
        Box::pin(async move {
            info!(url = %url, "Connecting to WebSocket");
            let (write, read) = connect(&url).await?;
            Ok(spawn_pump(write, read))
        })
    }
}

/// Owns the session's feed connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    auth_token: Option<String>,
    max_reconnect_attempts: u32,
    request_timeout: Duration,
    /// Held across a connect so concurrent openers share one attempt.
    slot: tokio::sync::Mutex<Option<Arc<Connection>>>,
    /// Last published connection, readable without waiting on `slot`.
    latest: RwLock<Option<Arc<Connection>>>,
    generation: AtomicU64,
    next_id: AtomicU64,
    reconnect_attempts: AtomicU32,
    signals: Arc<Signals>,
    feed: Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
}

impl ConnectionManager {
    /// Creates an idle manager. Nothing is dialed until first use.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: &FeedConfig) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Idle);

        Self {
            connector,
            auth_token: config.auth_token.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts.max(1),
            request_timeout: config.request_timeout,
            slot: tokio::sync::Mutex::new(None),
            latest: RwLock::new(None),
            generation: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            signals: Arc::new(Signals {
                feed: feed_tx,
                events,
                status,
            }),
            feed: Mutex::new(Some(feed_rx)),
        }
    }

    /// Returns a usable connection, creating one if needed.
    ///
    /// An open connection is reused unless `force_new` is set. Callers that
    /// arrive while another caller is connecting wait for, and receive, that
    /// caller's connection.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the socket cannot be established, or
    /// the backend error if authorization is rejected. Failures are not
    /// retried here.
    pub async fn open(&self, force_new: bool) -> Result<Arc<Connection>> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut slot = self.slot.lock().await;

        if let Some(current) = slot.as_ref() {
            let replaced_meanwhile = self.generation.load(Ordering::Acquire) != observed;
            if current.is_open() && (!force_new || replaced_meanwhile) {
                return Ok(Arc::clone(current));
            }
            info!(connection_id = current.id(), "Tearing down connection");
            self.retire(current);
        }
        *slot = None;
        *self.latest.write() = None;
        self.signals.status.send_replace(ConnectionStatus::Connecting);

        let connection = match self.establish().await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Connection failed: {e}");
                self.signals.status.send_replace(ConnectionStatus::Closed);
                return Err(e);
            }
        };

        let id = connection.id();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.reconnect_attempts.store(0, Ordering::Release);
        *slot = Some(Arc::clone(&connection));
        *self.latest.write() = Some(Arc::clone(&connection));

        self.signals.status.send_replace(ConnectionStatus::Open);
        let _ = self.signals.events.send(ConnectionEvent::Ready(id));
        let _ = self.signals.feed.send(FeedEvent::Opened(id));
        info!(connection_id = id, "Connection ready");

        Ok(connection)
    }

    async fn establish(&self) -> Result<Arc<Connection>> {
        let socket = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = Connection::spawn(
            id,
            socket,
            Arc::clone(&self.signals),
            self.request_timeout,
        );

        if let Some(token) = &self.auth_token
            && let Err(e) = connection.request(&AuthorizeRequest::new(token)).await
        {
            connection.close();
            if e.api_error()
                .is_some_and(|api| api.kind == ApiErrorKind::InvalidToken)
            {
                warn!(connection_id = id, "Authorization rejected, invalidating session");
                let _ = self.signals.events.send(ConnectionEvent::SessionInvalidated);
            }
            return Err(e);
        }

        Ok(connection)
    }

    /// Returns the current connection if it is open.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.latest
            .read()
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    /// Returns `true` if `id` names the open connection.
    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.current().is_some_and(|connection| connection.id() == id)
    }

    /// Returns the open connection, dialing one first if the manager has
    /// never connected (or was closed by logout).
    ///
    /// # Errors
    ///
    /// Returns [`QuotelineError::NotConnected`] while a connection is being
    /// established or after it was lost, and any error from [`Self::open`].
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }
        match self.status() {
            ConnectionStatus::Idle => self.open(false).await,
            _ => Err(QuotelineError::NotConnected),
        }
    }

    /// Reconnects if the connection is closing or closed.
    ///
    /// Each stale observation counts as one attempt. When the count reaches
    /// the configured maximum, [`ConnectionEvent::SessionInvalidated`] is
    /// emitted and the count starts over instead of reconnecting.
    ///
    /// # Errors
    ///
    /// Returns the error of the reconnection attempt.
    pub async fn check_and_reconnect(&self) -> Result<()> {
        let stale = match self.latest.read().as_ref() {
            Some(connection) => matches!(
                connection.ready_state(),
                ReadyState::Closing | ReadyState::Closed
            ),
            None => self.status() == ConnectionStatus::Closed,
        };
        if !stale {
            return Ok(());
        }

        let attempts = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if attempts >= self.max_reconnect_attempts {
            warn!(attempts, "Reconnection attempts exhausted, invalidating session");
            self.reconnect_attempts.store(0, Ordering::Release);
            let _ = self.signals.events.send(ConnectionEvent::SessionInvalidated);
            return Ok(());
        }

        info!(attempts, "Connection is stale, reconnecting");
        self.open(true).await.map(|_| ())
    }

    /// Tears the connection down (logout). The next use dials afresh.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        let closed = slot.take();
        *self.latest.write() = None;
        self.reconnect_attempts.store(0, Ordering::Release);
        self.signals.status.send_replace(ConnectionStatus::Idle);

        if let Some(connection) = closed {
            self.retire(&connection);
            info!(connection_id = connection.id(), "Connection closed");
        }
    }

    /// Closes a published connection and reports it lost, unless its read
    /// loop already did. The status signal is left to the caller.
    fn retire(&self, connection: &Connection) {
        if connection.close() {
            let id = connection.id();
            let _ = self.signals.events.send(ConnectionEvent::Lost(id));
            let _ = self.signals.feed.send(FeedEvent::Closed(id));
        }
    }

    /// Periodically pings an open connection, or tries to recover a stale
    /// one.
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.current() {
                    Some(connection) => {
                        if let Err(e) = connection.request(&PingRequest::new()).await {
                            warn!(connection_id = connection.id(), "Ping failed: {e}");
                        } else {
                            debug!(connection_id = connection.id(), "Ping answered");
                        }
                    }
                    None if manager.status() == ConnectionStatus::Idle => {}
                    None => {
                        if let Err(e) = manager.check_and_reconnect().await {
                            warn!("Reconnect failed: {e}");
                        }
                    }
                }
            }
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.signals.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.signals.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.events.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Waits up to `limit` for the status to become open.
    pub async fn wait_until_open(&self, limit: Duration) -> bool {
        let mut status = self.signals.status.subscribe();
        matches!(
            tokio::time::timeout(limit, status.wait_for(|s| *s == ConnectionStatus::Open)).await,
            Ok(Ok(_))
        )
    }

    /// Hands out the ordered feed of pushes and lifecycle events. Only the
    /// first caller receives it.
    pub(crate) fn take_feed(&self) -> Option<mpsc::UnboundedReceiver<FeedEvent>> {
        self.feed.lock().take()
    }
}
