//! Deduplicated stream subscriptions.
//!
//! The [`SubscriptionRegistry`] keeps at most one upstream subscription per
//! [`StreamKey`], however many listeners attach to it. Each key moves through
//! `NoSubscription -> PendingUpstream -> Active -> Terminating`; the check
//! and the move to `PendingUpstream` happen under one lock acquisition, so
//! concurrent attaches can never both issue a subscribe.
//!
//! Pushes and connection lifecycle events arrive on the manager's feed and
//! are routed by a background task. Every update for listeners is queued
//! while the registry lock is held and handed out by a single delivery task,
//! so callbacks see updates in the order the buffers changed and never run
//! under the lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::{ConnectionId, FeedEvent};
use super::handler::{HistoryReply, StreamPush, history_reply};
use super::request::Requester;
use crate::Result;
use crate::config::StreamConfig;
use crate::error::{QuotelineError, TransientKind};
use crate::models::{
    ApiError, ForgetAllRequest, ForgetRequest, StreamKey, Style, TicksHistoryRequest,
};
use crate::series::{Point, Series, SeriesBuffer};

/// Handle identifying one attached listener.
pub type ListenerId = u64;

type Callback = Arc<dyn Fn(StreamUpdate) + Send + Sync>;

/// What a listener receives after each change to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// The full series.
    Snapshot,
    /// Only the new point. The initial history still arrives as a snapshot.
    Push,
}

/// Delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Snapshot(Series),
    Point(Point),
    /// The stream failed or was ended by the backend.
    Error(ApiError),
}

/// A callback registered against one stream.
#[derive(Clone)]
pub struct Listener {
    mode: ListenerMode,
    callback: Callback,
    /// Cleared on detach; queued updates are dropped once it is.
    attached: Arc<AtomicBool>,
}

impl Listener {
    pub fn snapshot(callback: impl Fn(StreamUpdate) + Send + Sync + 'static) -> Self {
        Self::new(ListenerMode::Snapshot, Arc::new(callback))
    }

    pub fn push(callback: impl Fn(StreamUpdate) + Send + Sync + 'static) -> Self {
        Self::new(ListenerMode::Push, Arc::new(callback))
    }

    fn new(mode: ListenerMode, callback: Callback) -> Self {
        Self {
            mode,
            callback,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn mode(&self) -> ListenerMode {
        self.mode
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("mode", &self.mode).finish()
    }
}

/// Externally visible state of a stream key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NoSubscription,
    PendingUpstream,
    Active,
    Terminating,
}

/// Result of [`SubscriptionRegistry::attach`].
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: ListenerId,
    /// Buffer contents at the moment of attaching.
    pub snapshot: Series,
    pub state: SubscriptionState,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Pending {
        request: u64,
    },
    Active {
        subscription_id: Option<String>,
        connection: ConnectionId,
    },
    Terminating {
        subscription_id: String,
    },
}

impl Phase {
    fn state(&self) -> SubscriptionState {
        match self {
            Phase::Idle => SubscriptionState::NoSubscription,
            Phase::Pending { .. } => SubscriptionState::PendingUpstream,
            Phase::Active { .. } => SubscriptionState::Active,
            Phase::Terminating { .. } => SubscriptionState::Terminating,
        }
    }
}

struct Entry {
    phase: Phase,
    buffer: SeriesBuffer,
    listeners: Vec<(ListenerId, Listener)>,
    /// Points pushed before the subscribe reply arrived.
    early: VecDeque<Point>,
}

impl Entry {
    fn new(key: &StreamKey, capacity: usize) -> Self {
        Self {
            phase: Phase::Idle,
            buffer: SeriesBuffer::for_key(key, capacity),
            listeners: Vec::new(),
            early: VecDeque::new(),
        }
    }

    fn broadcast(&self, update: &StreamUpdate) -> Dispatch {
        self.listeners
            .iter()
            .map(|(_, listener)| (listener.clone(), update.clone()))
            .collect()
    }

    fn fan_out(&self, point: Point) -> Dispatch {
        let snapshot = self
            .listeners
            .iter()
            .any(|(_, l)| l.mode == ListenerMode::Snapshot)
            .then(|| self.buffer.snapshot());

        self.listeners
            .iter()
            .map(|(_, listener)| {
                let update = match (listener.mode, &snapshot) {
                    (ListenerMode::Snapshot, Some(series)) => {
                        StreamUpdate::Snapshot(series.clone())
                    }
                    _ => StreamUpdate::Point(point),
                };
                (listener.clone(), update)
            })
            .collect()
    }
}

type Dispatch = Vec<(Listener, StreamUpdate)>;

#[derive(Default)]
struct State {
    entries: HashMap<StreamKey, Entry>,
    /// Upstream subscription id to the key it feeds.
    routes: HashMap<String, StreamKey>,
}

struct Inner {
    requester: Requester,
    state: Mutex<State>,
    capacity: usize,
    next_listener: AtomicU64,
    next_request: AtomicU64,
    deliveries: mpsc::UnboundedSender<Dispatch>,
}

/// Shared registry of live streams. Cloning yields another handle to the
/// same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl SubscriptionRegistry {
    /// Creates the registry and starts routing the manager's feed.
    ///
    /// # Errors
    ///
    /// Returns [`QuotelineError::FeedClaimed`] if another registry already
    /// consumes this manager's feed.
    pub fn spawn(requester: Requester, config: &StreamConfig) -> Result<Self> {
        let feed = requester
            .manager()
            .take_feed()
            .ok_or(QuotelineError::FeedClaimed)?;

        let (deliveries, queued) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            requester,
            state: Mutex::new(State::default()),
            capacity: config.series_capacity.max(1),
            next_listener: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
            deliveries,
        });
        tokio::spawn(route(Arc::downgrade(&inner), feed));
        tokio::spawn(deliver(queued));

        Ok(Self { inner })
    }

    /// Registers `listener` for `key`, subscribing upstream if no
    /// subscription is live or pending.
    ///
    /// A listener joining a live stream is sent the current series first,
    /// even when it is empty, ahead of any later push.
    pub fn attach(&self, key: &StreamKey, listener: Listener) -> Attachment {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed) + 1;
        let listener = Listener::new(listener.mode, listener.callback);
        let mut subscribe = None;

        let attachment = {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(key, self.inner.capacity));

            match entry.phase {
                Phase::Idle | Phase::Terminating { .. } => {
                    if matches!(entry.phase, Phase::Terminating { .. }) {
                        entry.buffer.clear();
                    }
                    let request = self.inner.next_request();
                    entry.phase = Phase::Pending { request };
                    entry.early.clear();
                    subscribe = Some(request);
                }
                Phase::Active { .. } => {
                    let current = StreamUpdate::Snapshot(entry.buffer.snapshot());
                    self.inner.post(vec![(listener.clone(), current)]);
                }
                Phase::Pending { .. } => {}
            }
            entry.listeners.push((id, listener));

            Attachment {
                id,
                snapshot: entry.buffer.snapshot(),
                state: entry.phase.state(),
            }
        };

        debug!(key = %key, listener_id = id, "Listener attached");
        if let Some(request) = subscribe {
            self.inner.spawn_subscribe(key.clone(), request);
        }
        attachment
    }

    /// Removes a listener. The upstream subscription is forgotten once the
    /// last listener of `key` is gone.
    ///
    /// Returns `false` if the listener was not attached.
    pub fn detach(&self, key: &StreamKey, listener: ListenerId) -> bool {
        let mut forget = None;
        {
            let mut state = self.inner.state.lock();
            let State { entries, routes } = &mut *state;
            let Some(entry) = entries.get_mut(key) else {
                return false;
            };

            let Some(position) = entry.listeners.iter().position(|(id, _)| *id == listener)
            else {
                return false;
            };
            let (_, removed) = entry.listeners.remove(position);
            removed.attached.store(false, Ordering::Release);
            debug!(key = %key, listener_id = listener, "Listener detached");
            if !entry.listeners.is_empty() {
                return true;
            }

            let remove = match &entry.phase {
                Phase::Active {
                    subscription_id: Some(subscription_id),
                    connection,
                } => {
                    forget = Some((subscription_id.clone(), *connection));
                    false
                }
                Phase::Active {
                    subscription_id: None,
                    ..
                }
                | Phase::Idle => true,
                // The reply is torn down when it arrives.
                Phase::Pending { .. } | Phase::Terminating { .. } => false,
            };

            if remove {
                entries.remove(key);
            } else if let Some((subscription_id, _)) = &forget {
                routes.remove(subscription_id);
                entry.buffer.clear();
                entry.early.clear();
                entry.phase = Phase::Terminating {
                    subscription_id: subscription_id.clone(),
                };
            }
        }

        if let Some((subscription_id, connection)) = forget {
            self.inner
                .spawn_forget(Some(key.clone()), subscription_id, connection);
        }
        true
    }

    /// Attaches a snapshot listener that receives the full series after
    /// every change. The current series comes first if the stream is
    /// already live.
    pub fn monitor(
        &self,
        key: &StreamKey,
        callback: impl Fn(Series) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener = Listener::snapshot(move |update| {
            if let StreamUpdate::Snapshot(series) = update {
                callback(series);
            }
        });
        self.attach(key, listener).id
    }

    pub fn stop_monitor(&self, key: &StreamKey, listener: ListenerId) -> bool {
        self.detach(key, listener)
    }

    /// Returns the live series for `key`, or fetches `count` historical
    /// points when the key has no active subscription.
    ///
    /// # Errors
    ///
    /// Returns the error of the historical fetch.
    pub async fn request(&self, key: &StreamKey, count: u32) -> Result<Series> {
        if let Some(series) = self.active_snapshot(key) {
            return Ok(series);
        }
        let reply = self
            .inner
            .requester
            .send_until_done(|| TicksHistoryRequest::new(key, count), &[])
            .await?;
        Ok(history_reply(&reply.body)?.series)
    }

    /// Forgets every upstream subscription of `style` and resubscribes the
    /// keys that still have listeners.
    ///
    /// # Errors
    ///
    /// Returns the error of the `forget_all` request. Local state is left
    /// untouched in that case.
    pub async fn forget_all(&self, style: Style) -> Result<()> {
        match self.inner.requester.manager().current() {
            Some(connection) => {
                connection.request(&ForgetAllRequest::new(&[style])).await?;
                info!(style = style.as_str(), "Forgot all upstream subscriptions");
            }
            None => debug!(style = style.as_str(), "No open connection, nothing to forget"),
        }

        let mut restarts = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let State { entries, routes } = &mut *state;
            entries.retain(|key, entry| {
                if key.style() != style {
                    return true;
                }
                match &entry.phase {
                    Phase::Active {
                        subscription_id, ..
                    } => {
                        if let Some(subscription_id) = subscription_id {
                            routes.remove(subscription_id);
                        }
                        if entry.listeners.is_empty() {
                            return false;
                        }
                        let request = self.inner.next_request();
                        entry.phase = Phase::Pending { request };
                        entry.early.clear();
                        restarts.push((key.clone(), request));
                        true
                    }
                    Phase::Terminating { .. } => false,
                    Phase::Idle | Phase::Pending { .. } => true,
                }
            });
        }

        for (key, request) in restarts {
            self.inner.spawn_subscribe(key, request);
        }
        Ok(())
    }

    pub fn state(&self, key: &StreamKey) -> SubscriptionState {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map_or(SubscriptionState::NoSubscription, |entry| entry.phase.state())
    }

    /// Backend-assigned id of the live subscription for `key`.
    pub fn subscription_id(&self, key: &StreamKey) -> Option<String> {
        match &self.inner.state.lock().entries.get(key)?.phase {
            Phase::Active {
                subscription_id, ..
            } => subscription_id.clone(),
            Phase::Terminating { subscription_id } => Some(subscription_id.clone()),
            _ => None,
        }
    }

    pub fn listener_count(&self, key: &StreamKey) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Copy of the buffer held for `key`, live or not.
    pub fn snapshot(&self, key: &StreamKey) -> Option<Series> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.buffer.snapshot())
    }

    fn active_snapshot(&self, key: &StreamKey) -> Option<Series> {
        let state = self.inner.state.lock();
        let entry = state.entries.get(key)?;
        matches!(entry.phase, Phase::Active { .. }).then(|| entry.buffer.snapshot())
    }
}

impl Inner {
    fn next_request(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queues updates for the delivery task. Must be called with the state
    /// lock held so the queue follows the order of buffer changes.
    fn post(&self, dispatch: Dispatch) {
        if !dispatch.is_empty() {
            let _ = self.deliveries.send(dispatch);
        }
    }

    fn history_count(&self) -> u32 {
        u32::try_from(self.capacity).unwrap_or(u32::MAX)
    }

    fn spawn_subscribe(self: &Arc<Self>, key: StreamKey, request: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            debug!(key = %key, "Subscribing upstream");
            let count = inner.history_count();
            let result = inner
                .requester
                .send_until_done(
                    || TicksHistoryRequest::new(&key, count).subscribe(),
                    &[TransientKind::AlreadySubscribed],
                )
                .await
                .and_then(|reply| Ok((reply.connection, history_reply(&reply.body)?)));
            inner.finish_subscribe(&key, request, result);
        });
    }

    fn finish_subscribe(
        self: &Arc<Self>,
        key: &StreamKey,
        request: u64,
        result: Result<(ConnectionId, HistoryReply)>,
    ) {
        let mut orphan = None;
        let mut restart = None;

        {
            let mut state = self.state.lock();
            let State { entries, routes } = &mut *state;

            let superseded = !matches!(
                entries.get(key).map(|entry| &entry.phase),
                Some(Phase::Pending { request: current }) if *current == request
            );
            if superseded {
                if let Ok((connection, reply)) = result {
                    orphan = reply.subscription_id.map(|id| (id, connection));
                }
            } else if let Some(entry) = entries.get_mut(key) {
                match result {
                    Ok((connection, _)) if !self.requester.manager().is_current(connection) => {
                        debug!(key = %key, connection_id = connection, "Reply from a replaced connection");
                        if entry.listeners.is_empty() {
                            entries.remove(key);
                        } else {
                            let request = self.next_request();
                            entry.phase = Phase::Pending { request };
                            entry.early.clear();
                            restart = Some(request);
                        }
                    }
                    Ok((connection, reply)) => {
                        entry.buffer.seed(reply.series);
                        for point in entry.early.drain(..) {
                            entry.buffer.apply(point);
                        }

                        if entry.listeners.is_empty() {
                            debug!(key = %key, "All listeners left while subscribing");
                            entries.remove(key);
                            orphan = reply.subscription_id.map(|id| (id, connection));
                        } else {
                            if let Some(subscription_id) = &reply.subscription_id {
                                routes.insert(subscription_id.clone(), key.clone());
                            }
                            info!(
                                key = %key,
                                subscription_id = reply.subscription_id.as_deref().unwrap_or("-"),
                                points = entry.buffer.len(),
                                "Subscription active"
                            );
                            entry.phase = Phase::Active {
                                subscription_id: reply.subscription_id,
                                connection,
                            };
                            let snapshot = StreamUpdate::Snapshot(entry.buffer.snapshot());
                            self.post(entry.broadcast(&snapshot));
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, "Subscribe failed: {e}");
                        entry.phase = Phase::Idle;
                        entry.early.clear();
                        if entry.listeners.is_empty() {
                            entries.remove(key);
                        } else {
                            self.post(entry.broadcast(&StreamUpdate::Error(stream_error(&e))));
                        }
                    }
                }
            }
        }

        if let Some((subscription_id, connection)) = orphan {
            self.spawn_forget(None, subscription_id, connection);
        }
        if let Some(request) = restart {
            self.spawn_subscribe(key.clone(), request);
        }
    }

    /// Sends a `forget` for a subscription living on `connection`. Nothing
    /// is sent if that connection is gone, since the subscription died with
    /// it.
    fn spawn_forget(
        self: &Arc<Self>,
        key: Option<StreamKey>,
        subscription_id: String,
        connection: ConnectionId,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let live = inner
                .requester
                .manager()
                .current()
                .filter(|current| current.id() == connection);
            match live {
                Some(current) => {
                    let request = ForgetRequest::new(subscription_id.as_str());
                    match current.request(&request).await {
                        Ok(_) => debug!(subscription_id = %subscription_id, "Subscription forgotten"),
                        Err(e) => warn!(subscription_id = %subscription_id, "Forget failed: {e}"),
                    }
                }
                None => {
                    debug!(subscription_id = %subscription_id, "Connection gone, skipping forget");
                }
            }

            if let Some(key) = key {
                let mut state = inner.state.lock();
                let done = matches!(
                    state.entries.get(&key).map(|entry| &entry.phase),
                    Some(Phase::Terminating { subscription_id: id }) if *id == subscription_id
                );
                if done {
                    state.entries.remove(&key);
                }
            }
        });
    }

    fn on_push(&self, connection: ConnectionId, push: StreamPush) {
        let mut state = self.state.lock();
        let State { entries, routes } = &mut *state;

        let Some(key) = push
            .subscription_id()
            .and_then(|id| routes.get(id).cloned())
            .or_else(|| push.key())
        else {
            debug!("Push for an unknown stream");
            return;
        };
        let Some(entry) = entries.get_mut(&key) else {
            debug!(key = %key, "Push for a stream without listeners");
            return;
        };

        let live = match &entry.phase {
            Phase::Active {
                subscription_id,
                connection: live_connection,
            } => {
                *live_connection == connection
                    && match (subscription_id.as_deref(), push.subscription_id()) {
                        (Some(live), Some(pushed)) => live == pushed,
                        _ => true,
                    }
            }
            _ => false,
        };

        match push {
            StreamPush::Error { error, .. } if live => {
                warn!(key = %key, code = %error.code, "Stream ended by backend");
                if let Phase::Active {
                    subscription_id: Some(subscription_id),
                    ..
                } = &entry.phase
                {
                    routes.remove(subscription_id);
                }
                entry.phase = Phase::Idle;
                self.post(entry.broadcast(&StreamUpdate::Error(error)));
            }
            StreamPush::Error { .. } => {}
            push => {
                let Some(point) = push.point() else {
                    return;
                };
                if live {
                    if entry.buffer.apply(point).changed() {
                        self.post(entry.fan_out(point));
                    }
                } else if matches!(entry.phase, Phase::Pending { .. }) {
                    if entry.early.len() >= self.capacity {
                        entry.early.pop_front();
                    }
                    entry.early.push_back(point);
                }
            }
        }
    }

    /// Invalidates subscriptions bound to older connections and resubscribes
    /// every key that still has listeners.
    fn on_connection_opened(self: &Arc<Self>, id: ConnectionId) {
        let mut restarts = Vec::new();
        {
            let mut state = self.state.lock();
            let State { entries, routes } = &mut *state;
            entries.retain(|key, entry| {
                match &entry.phase {
                    Phase::Active {
                        subscription_id,
                        connection,
                    } if *connection != id => {
                        if let Some(subscription_id) = subscription_id {
                            routes.remove(subscription_id);
                        }
                        entry.phase = Phase::Idle;
                    }
                    Phase::Terminating { .. } => return false,
                    _ => {}
                }

                if matches!(entry.phase, Phase::Idle) {
                    if entry.listeners.is_empty() {
                        return false;
                    }
                    let request = self.next_request();
                    entry.phase = Phase::Pending { request };
                    entry.early.clear();
                    restarts.push((key.clone(), request));
                }
                true
            });
        }

        if !restarts.is_empty() {
            info!(connection_id = id, streams = restarts.len(), "Resubscribing streams");
        }
        for (key, request) in restarts {
            self.spawn_subscribe(key, request);
        }
    }

    /// Drops subscription ids bound to `id`. Buffers stay for redisplay.
    fn on_connection_closed(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let State { entries, routes } = &mut *state;
        entries.retain(|_, entry| match &entry.phase {
            Phase::Active {
                subscription_id,
                connection,
            } if *connection == id => {
                if let Some(subscription_id) = subscription_id {
                    routes.remove(subscription_id);
                }
                entry.phase = Phase::Idle;
                true
            }
            Phase::Terminating { .. } => false,
            _ => true,
        });
        debug!(connection_id = id, "Subscriptions invalidated");
    }
}

async fn route(inner: Weak<Inner>, mut feed: mpsc::UnboundedReceiver<FeedEvent>) {
    while let Some(event) = feed.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            FeedEvent::Push { connection, push } => inner.on_push(connection, push),
            FeedEvent::Opened(id) => inner.on_connection_opened(id),
            FeedEvent::Closed(id) => inner.on_connection_closed(id),
        }
    }
    debug!("Subscription router stopped");
}

/// Hands queued updates to their listeners, one batch at a time.
async fn deliver(mut queued: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(dispatch) = queued.recv().await {
        for (listener, update) in dispatch {
            if listener.attached.load(Ordering::Acquire) {
                (listener.callback)(update);
            }
        }
    }
    debug!("Listener delivery stopped");
}

/// Backend error to hand to listeners for a failed subscribe.
fn stream_error(error: &QuotelineError) -> ApiError {
    error
        .api_error()
        .cloned()
        .unwrap_or_else(|| ApiError::new("StreamFailure", error.to_string()))
}
