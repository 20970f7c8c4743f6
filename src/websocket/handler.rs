//! Incoming message classification.
//!
//! Every text frame read from the feed is sorted into a reply to an
//! outstanding request, a push for a live stream, or noise.

use serde_json::Value;
use tracing::{debug, warn};

use crate::Result;
use crate::error::QuotelineError;
use crate::models::candle::{Candle, OhlcPush};
use crate::models::tick::{History, Tick, TickPush};
use crate::models::{ApiError, MsgType, StreamKey};
use crate::series::{Point, Series};

/// Default bucket size the backend applies to `style: candles` requests
/// that omit a granularity.
const DEFAULT_CANDLE_GRANULARITY: u32 = 60;

/// A classified inbound message.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// First message carrying the `req_id` of an outstanding request.
    Reply { req_id: u64, body: Value },
    Push(StreamPush),
    Ignored,
}

/// A message belonging to a live upstream subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPush {
    Tick {
        subscription_id: Option<String>,
        symbol: String,
        tick: Tick,
    },
    Ohlc {
        subscription_id: Option<String>,
        symbol: String,
        granularity: u32,
        candle: Candle,
    },
    /// The backend ended a stream with an error (e.g. market closed).
    Error {
        subscription_id: Option<String>,
        key: Option<StreamKey>,
        error: ApiError,
    },
}

impl StreamPush {
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            StreamPush::Tick {
                subscription_id, ..
            }
            | StreamPush::Ohlc {
                subscription_id, ..
            }
            | StreamPush::Error {
                subscription_id, ..
            } => subscription_id.as_deref(),
        }
    }

    /// The stream this push belongs to, derived from its payload.
    pub fn key(&self) -> Option<StreamKey> {
        match self {
            StreamPush::Tick { symbol, .. } => Some(StreamKey::ticks(symbol.clone())),
            StreamPush::Ohlc {
                symbol,
                granularity,
                ..
            } => Some(StreamKey::new(symbol.clone(), *granularity)),
            StreamPush::Error { key, .. } => key.clone(),
        }
    }

    pub fn point(&self) -> Option<Point> {
        match self {
            StreamPush::Tick { tick, .. } => Some(Point::Tick(*tick)),
            StreamPush::Ohlc { candle, .. } => Some(Point::Candle(*candle)),
            StreamPush::Error { .. } => None,
        }
    }
}

/// Decoded `ticks_history` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryReply {
    pub series: Series,
    pub subscription_id: Option<String>,
}

/// Sorts one inbound text frame.
///
/// `is_pending` reports whether a `req_id` still waits for its first reply.
pub(crate) fn classify(text: &str, is_pending: impl Fn(u64) -> bool) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| QuotelineError::MalformedMessage(e.to_string()))?;

    if let Some(req_id) = value.get("req_id").and_then(Value::as_u64)
        && is_pending(req_id)
    {
        return Ok(Inbound::Reply {
            req_id,
            body: value,
        });
    }

    let subscription_id = subscription_id(&value);

    if let Some(error) = value.get("error") {
        let error: ApiError = serde_json::from_value(error.clone())?;
        let key = value.get("echo_req").and_then(echo_key);
        if subscription_id.is_none() && key.is_none() {
            warn!(code = %error.code, message = %error.message, "Unsolicited error");
            return Ok(Inbound::Ignored);
        }
        return Ok(Inbound::Push(StreamPush::Error {
            subscription_id,
            key,
            error,
        }));
    }

    let msg_type = value
        .get("msg_type")
        .and_then(Value::as_str)
        .map(MsgType::from_wire);

    match msg_type {
        Some(MsgType::Tick) => {
            let push: TickPush = serde_json::from_value(value["tick"].clone())?;
            Ok(Inbound::Push(StreamPush::Tick {
                subscription_id: subscription_id.or_else(|| push.id.clone()),
                tick: push.tick(),
                symbol: push.symbol,
            }))
        }
        Some(MsgType::Ohlc) => {
            let push: OhlcPush = serde_json::from_value(value["ohlc"].clone())?;
            Ok(Inbound::Push(StreamPush::Ohlc {
                subscription_id: subscription_id.or_else(|| push.id.clone()),
                candle: push.candle(),
                granularity: push.granularity,
                symbol: push.symbol,
            }))
        }
        Some(other) => {
            debug!(msg_type = ?other, "Ignoring unrouted message");
            Ok(Inbound::Ignored)
        }
        None => Ok(Inbound::Ignored),
    }
}

/// Decodes the history or candles carried by a `ticks_history` reply.
pub fn history_reply(body: &Value) -> Result<HistoryReply> {
    let series = if let Some(candles) = body.get("candles") {
        Series::Candles(serde_json::from_value(candles.clone())?)
    } else if let Some(history) = body.get("history") {
        let history: History = serde_json::from_value(history.clone())?;
        Series::Ticks(history.into_ticks())
    } else {
        return Err(QuotelineError::MalformedMessage(
            "reply carries neither history nor candles".to_string(),
        ));
    };

    Ok(HistoryReply {
        series,
        subscription_id: subscription_id(body),
    })
}

fn subscription_id(value: &Value) -> Option<String> {
    value
        .get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Recovers the stream key from the echoed `ticks_history` request.
fn echo_key(echo: &Value) -> Option<StreamKey> {
    let symbol = echo.get("ticks_history")?.as_str()?;
    let candles = echo.get("style").and_then(Value::as_str) == Some("candles");
    let granularity = match echo.get("granularity").and_then(Value::as_u64) {
        Some(granularity) => u32::try_from(granularity).ok()?,
        None if candles => DEFAULT_CANDLE_GRANULARITY,
        None => 0,
    };
    Some(StreamKey::new(symbol, granularity))
}
