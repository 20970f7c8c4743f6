//! OHLC candlestick models.

use serde::{Deserialize, Serialize};

use super::lenient_f64;

/// A single OHLC candle, keyed by the start of its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub epoch: i64,
    #[serde(deserialize_with = "lenient_f64")]
    pub open: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub high: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub low: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub close: f64,
}

/// The `ohlc` payload of a streamed candle message.
///
/// `epoch` is the time of the update; the bucket the candle belongs to
/// starts at `open_time`.
#[derive(Debug, Clone, Deserialize)]
pub struct OhlcPush {
    pub epoch: i64,
    pub open_time: i64,
    #[serde(deserialize_with = "lenient_f64")]
    pub open: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub high: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub low: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub close: f64,
    pub symbol: String,
    pub granularity: u32,
    #[serde(default)]
    pub id: Option<String>,
}

impl OhlcPush {
    pub fn candle(&self) -> Candle {
        Candle {
            epoch: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}
