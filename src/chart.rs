//! Bridge between the streaming core and a chart widget.
//!
//! [`ChartAdapter`] exposes the calls a chart needs: the symbol catalog and
//! trading hours at mount time, one-shot historical quotes, and streaming
//! quote subscriptions whose callbacks stop firing the moment they are
//! unsubscribed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::StreamConfig;
use crate::error::{QuotelineError, TransientKind};
use crate::models::candle::Candle;
use crate::models::symbols::{ActiveSymbol, TradingTimes};
use crate::models::tick::{History, Tick};
use crate::models::{
    ActiveSymbolsRequest, StreamKey, Style, TicksHistoryRequest, TradingTimesRequest,
};
use crate::series::{Point, Series};
use crate::websocket::{
    Listener, ListenerId, Requester, StreamUpdate, SubscriptionRegistry, history_reply,
};

/// Points requested when a [`QuoteRequest`] does not say otherwise.
pub const DEFAULT_COUNT: u32 = 1000;

/// Catalog a chart needs before it can request any stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub active_symbols: Vec<ActiveSymbol>,
    pub trading_times: TradingTimes,
}

/// Parameters of a quote fetch or subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub symbol: String,
    /// `0` for ticks, otherwise the candle period in seconds.
    pub granularity: u32,
    pub count: u32,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl QuoteRequest {
    pub fn new(symbol: impl Into<String>, granularity: u32) -> Self {
        Self {
            symbol: symbol.into(),
            granularity,
            count: DEFAULT_COUNT,
            start: None,
            end: None,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.symbol.clone(), self.granularity)
    }
}

/// Quotes in the shape a chart consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quotes {
    History(History),
    Candles(Vec<Candle>),
}

impl Quotes {
    /// No quotes, shaped for `granularity`.
    pub fn empty(granularity: u32) -> Self {
        Series::empty(granularity).into()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Quotes::History(history) => history.times.is_empty(),
            Quotes::Candles(candles) => candles.is_empty(),
        }
    }
}

impl From<Series> for Quotes {
    fn from(series: Series) -> Self {
        match series {
            Series::Ticks(ticks) => Quotes::History(History::from_ticks(&ticks)),
            Series::Candles(candles) => Quotes::Candles(candles),
        }
    }
}

/// Delivered to a quote subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteUpdate {
    /// Full history, sent first and after every resubscription.
    Quotes(Quotes),
    Tick(Tick),
    Ohlc(Candle),
}

/// Handle returned by [`ChartAdapter::subscribe_quotes`].
///
/// Clones share the same liveness flag.
#[derive(Clone)]
pub struct QuoteSubscription {
    key: StreamKey,
    listener: ListenerId,
    alive: Arc<AtomicBool>,
    registry: SubscriptionRegistry,
}

impl QuoteSubscription {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Silences the callback and detaches it. Calling this again has no
    /// effect.
    ///
    /// Returns `true` on the call that actually unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.registry.detach(&self.key, self.listener);
        true
    }
}

/// Chart-facing facade over the subscription registry.
pub struct ChartAdapter {
    requester: Requester,
    registry: SubscriptionRegistry,
    config: StreamConfig,
    subscriptions: Mutex<Vec<QuoteSubscription>>,
    chart_data: RwLock<ChartData>,
    error: RwLock<Option<String>>,
}

impl ChartAdapter {
    pub fn new(
        requester: Requester,
        registry: SubscriptionRegistry,
        config: &StreamConfig,
    ) -> Self {
        Self {
            requester,
            registry,
            config: config.clone(),
            subscriptions: Mutex::new(Vec::new()),
            chart_data: RwLock::new(ChartData::default()),
            error: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Fetches the symbol catalog and trading hours.
    ///
    /// An empty catalog is retried up to the configured count with a fixed
    /// delay. When retries run out, [`Self::error`] reports the failure and
    /// the last catalog that loaded successfully (possibly empty) is
    /// returned.
    pub async fn get_chart_data(&self) -> ChartData {
        let attempts = self.config.chart_data_retries + 1;
        for attempt in 1..=attempts {
            match self.fetch_chart_data().await {
                Ok(data) if !data.active_symbols.is_empty() => {
                    info!(symbols = data.active_symbols.len(), "Chart data loaded");
                    *self.chart_data.write() = data.clone();
                    *self.error.write() = None;
                    return data;
                }
                Ok(_) => debug!(attempt, "Symbol catalog is empty"),
                Err(e) => warn!(attempt, "Chart data fetch failed: {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.chart_data_retry_delay).await;
            }
        }

        error!(attempts, "Giving up on chart data");
        *self.error.write() = Some(format!("chart data unavailable after {attempts} attempts"));
        self.chart_data.read().clone()
    }

    async fn fetch_chart_data(&self) -> Result<ChartData> {
        let tolerable = [TransientKind::RateLimit];
        let fetch = futures_util::future::try_join(
            self.requester
                .send_until_done(ActiveSymbolsRequest::brief, &tolerable),
            self.requester
                .send_until_done(TradingTimesRequest::today, &tolerable),
        );
        let (symbols, times) = tokio::time::timeout(self.config.fetch_timeout, fetch)
            .await
            .map_err(|_| QuotelineError::Timeout(self.config.fetch_timeout))??;

        Ok(ChartData {
            active_symbols: field(&symbols.body, "active_symbols")?,
            trading_times: field(&times.body, "trading_times")?,
        })
    }

    /// Fetches historical quotes without subscribing.
    ///
    /// # Errors
    ///
    /// Returns [`QuotelineError::Timeout`] if the fetch outlives the
    /// configured timeout, or the backend error (e.g. an invalid symbol).
    pub async fn get_quotes(&self, request: &QuoteRequest) -> Result<Quotes> {
        let history = TicksHistoryRequest::new(&request.key(), request.count)
            .with_range(request.start, request.end);
        let reply = tokio::time::timeout(
            self.config.fetch_timeout,
            self.requester
                .send_until_done(|| history.clone(), &[TransientKind::RateLimit]),
        )
        .await
        .map_err(|_| QuotelineError::Timeout(self.config.fetch_timeout))??;

        Ok(history_reply(&reply.body)?.series.into())
    }

    /// Streams quotes for `request` into `callback`.
    ///
    /// The current history, even when empty, is delivered first when the
    /// stream is already live. Stream errors reach the callback as empty
    /// [`Quotes`].
    pub fn subscribe_quotes(
        &self,
        request: &QuoteRequest,
        callback: impl Fn(QuoteUpdate) + Send + Sync + 'static,
    ) -> QuoteSubscription {
        let key = request.key();
        let alive = Arc::new(AtomicBool::new(true));

        let listener = {
            let alive = Arc::clone(&alive);
            let granularity = key.granularity;
            Listener::push(move |update| {
                if !alive.load(Ordering::Acquire) {
                    return;
                }
                callback(match update {
                    StreamUpdate::Snapshot(series) => QuoteUpdate::Quotes(series.into()),
                    StreamUpdate::Point(Point::Tick(tick)) => QuoteUpdate::Tick(tick),
                    StreamUpdate::Point(Point::Candle(candle)) => QuoteUpdate::Ohlc(candle),
                    StreamUpdate::Error(error) => {
                        warn!(code = %error.code, "Quote stream failed, sending empty quotes");
                        QuoteUpdate::Quotes(Quotes::empty(granularity))
                    }
                });
            })
        };

        let attachment = self.registry.attach(&key, listener);

        let subscription = QuoteSubscription {
            key,
            listener: attachment.id,
            alive,
            registry: self.registry.clone(),
        };
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(QuoteSubscription::is_active);
        subscriptions.push(subscription.clone());
        subscription
    }

    /// Unsubscribes the streams of `request`, or every stream of this
    /// adapter when `None`. The latter also forgets all upstream tick
    /// subscriptions.
    pub async fn unsubscribe_quotes(&self, request: Option<&QuoteRequest>) {
        let removed: Vec<QuoteSubscription> = {
            let mut subscriptions = self.subscriptions.lock();
            match request {
                Some(request) => {
                    let key = request.key();
                    let (removed, kept): (Vec<_>, Vec<_>) = subscriptions
                        .drain(..)
                        .partition(|subscription| subscription.key == key);
                    *subscriptions = kept;
                    removed
                }
                None => std::mem::take(&mut *subscriptions),
            }
        };

        for subscription in &removed {
            subscription.unsubscribe();
        }

        if request.is_none()
            && let Err(e) = self.registry.forget_all(Style::Ticks).await
        {
            warn!("Failed to forget tick subscriptions: {e}");
        }
    }

    /// Terminal chart-data error, if the last load gave up.
    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    /// Last catalog loaded successfully.
    pub fn chart_data(&self) -> ChartData {
        self.chart_data.read().clone()
    }
}

fn field<T: DeserializeOwned + Default>(body: &Value, name: &str) -> Result<T> {
    match body.get(name) {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
        _ => Ok(T::default()),
    }
}
