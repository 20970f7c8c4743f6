//! Shared models for the upstream data-feed protocol.
//!
//! Contains the [`StreamKey`] identity, outbound request types, the
//! classified [`ApiError`] returned by the backend, and lenient numeric
//! decoding shared by the tick and candle models.

pub mod candle;
pub mod symbols;
pub mod tick;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TransientKind;

/// Identity of a requested data stream.
///
/// A granularity of `0` denotes the raw tick stream; anything greater is an
/// OHLC candle stream with that bucket size in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub symbol: String,
    pub granularity: u32,
}

impl StreamKey {
    pub fn new(symbol: impl Into<String>, granularity: u32) -> Self {
        Self {
            symbol: symbol.into(),
            granularity,
        }
    }

    /// Key for the raw tick stream of `symbol`.
    pub fn ticks(symbol: impl Into<String>) -> Self {
        Self::new(symbol, 0)
    }

    pub fn is_ticks(&self) -> bool {
        self.granularity == 0
    }

    pub fn style(&self) -> Style {
        if self.is_ticks() {
            Style::Ticks
        } else {
            Style::Candles
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.granularity)
    }
}

/// Shape of a historical or streamed series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    Ticks,
    Candles,
}

impl Style {
    /// Returns the wire-format name expected by the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Ticks => "ticks",
            Style::Candles => "candles",
        }
    }
}

/// The `msg_type` tag carried by every backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Tick,
    Ohlc,
    Candles,
    History,
    Forget,
    ForgetAll,
    ActiveSymbols,
    TradingTimes,
    Authorize,
    Ping,
    Other,
}

impl MsgType {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "tick" => MsgType::Tick,
            "ohlc" => MsgType::Ohlc,
            "candles" => MsgType::Candles,
            "history" => MsgType::History,
            "forget" => MsgType::Forget,
            "forget_all" => MsgType::ForgetAll,
            "active_symbols" => MsgType::ActiveSymbols,
            "trading_times" => MsgType::TradingTimes,
            "authorize" => MsgType::Authorize,
            "ping" => MsgType::Ping,
            _ => MsgType::Other,
        }
    }
}

/// A `ticks_history` request, optionally turned into a live subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicksHistoryRequest {
    pub ticks_history: String,
    pub style: String,
    pub end: String,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjust_start_time: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<u8>,
}

impl TicksHistoryRequest {
    /// Requests the latest `count` points of `key`.
    pub fn new(key: &StreamKey, count: u32) -> Self {
        Self {
            ticks_history: key.symbol.clone(),
            style: key.style().as_str().to_string(),
            end: "latest".to_string(),
            count,
            granularity: (!key.is_ticks()).then_some(key.granularity),
            start: None,
            adjust_start_time: Some(1),
            subscribe: None,
        }
    }

    /// Asks the backend to keep streaming updates after the history.
    #[must_use]
    pub fn subscribe(mut self) -> Self {
        self.subscribe = Some(1);
        self
    }

    /// Restricts the history to an explicit epoch range.
    #[must_use]
    pub fn with_range(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.start = start;
        if let Some(end) = end {
            self.end = end.to_string();
        }
        self
    }
}

/// Cancels one upstream subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForgetRequest {
    pub forget: String,
}

impl ForgetRequest {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            forget: subscription_id.into(),
        }
    }
}

/// Cancels every upstream subscription of the given styles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForgetAllRequest {
    pub forget_all: Vec<String>,
}

impl ForgetAllRequest {
    pub fn new(styles: &[Style]) -> Self {
        Self {
            forget_all: styles.iter().map(|s| s.as_str().to_string()).collect(),
        }
    }
}

/// Authorizes the connection with an opaque session token.
#[derive(Serialize)]
pub struct AuthorizeRequest {
    pub authorize: String,
}

impl AuthorizeRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            authorize: token.into(),
        }
    }
}

/// A `ping` request used to keep the connection alive.
#[derive(Serialize)]
pub struct PingRequest {
    pub ping: u8,
}

impl PingRequest {
    pub fn new() -> Self {
        Self { ping: 1 }
    }
}

impl Default for PingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches the tradable symbol catalog.
#[derive(Serialize)]
pub struct ActiveSymbolsRequest {
    pub active_symbols: String,
    pub product_type: String,
}

impl ActiveSymbolsRequest {
    pub fn brief() -> Self {
        Self {
            active_symbols: "brief".to_string(),
            product_type: "basic".to_string(),
        }
    }
}

/// Fetches today's trading-hours table.
#[derive(Serialize)]
pub struct TradingTimesRequest {
    pub trading_times: String,
}

impl TradingTimesRequest {
    pub fn today() -> Self {
        Self {
            trading_times: "today".to_string(),
        }
    }
}

/// An `error` object returned by the backend, classified on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "WireError")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub kind: ApiErrorKind,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl From<WireError> for ApiError {
    fn from(wire: WireError) -> Self {
        ApiError::new(wire.code, wire.message)
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            kind: ApiErrorKind::classify(&code),
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Closed set of backend error codes the crate reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    AlreadySubscribed,
    RateLimit,
    MarketIsClosed,
    InvalidSymbol,
    InvalidToken,
    Other,
}

impl ApiErrorKind {
    pub fn classify(code: &str) -> Self {
        match code {
            "AlreadySubscribed" => ApiErrorKind::AlreadySubscribed,
            "RateLimit" => ApiErrorKind::RateLimit,
            "MarketIsClosed" => ApiErrorKind::MarketIsClosed,
            "InvalidSymbol" => ApiErrorKind::InvalidSymbol,
            "InvalidToken" | "AuthorizationRequired" => ApiErrorKind::InvalidToken,
            _ => ApiErrorKind::Other,
        }
    }

    pub fn transient_kind(self) -> Option<TransientKind> {
        match self {
            ApiErrorKind::AlreadySubscribed => Some(TransientKind::AlreadySubscribed),
            ApiErrorKind::RateLimit => Some(TransientKind::RateLimit),
            _ => None,
        }
    }
}

/// A number the backend may send either as a JSON number or a string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Lenient(pub f64);

impl<'de> Deserialize<'de> for Lenient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Lenient(value)),
            Raw::Text(text) => text
                .trim()
                .parse()
                .map(Lenient)
                .map_err(serde::de::Error::custom),
        }
    }
}

pub(crate) fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Lenient::deserialize(deserializer).map(|value| value.0)
}

pub(crate) fn lenient_f64_vec<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<f64>, D::Error> {
    Vec::<Lenient>::deserialize(deserializer)
        .map(|values| values.into_iter().map(|value| value.0).collect())
}
