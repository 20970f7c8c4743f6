//! Tick stream models.

use serde::{Deserialize, Serialize};

use super::{lenient_f64, lenient_f64_vec};

/// A single price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub epoch: i64,
    #[serde(deserialize_with = "lenient_f64")]
    pub quote: f64,
}

/// Parallel price/time arrays returned by a `ticks_history` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(deserialize_with = "lenient_f64_vec")]
    pub prices: Vec<f64>,
    pub times: Vec<i64>,
}

impl History {
    /// Zips the arrays into ticks, ignoring any unpaired tail.
    pub fn into_ticks(self) -> Vec<Tick> {
        self.times
            .into_iter()
            .zip(self.prices)
            .map(|(epoch, quote)| Tick { epoch, quote })
            .collect()
    }

    pub fn from_ticks(ticks: &[Tick]) -> Self {
        Self {
            prices: ticks.iter().map(|t| t.quote).collect(),
            times: ticks.iter().map(|t| t.epoch).collect(),
        }
    }
}

/// The `tick` payload of a streamed tick message.
#[derive(Debug, Clone, Deserialize)]
pub struct TickPush {
    pub epoch: i64,
    #[serde(deserialize_with = "lenient_f64")]
    pub quote: f64,
    pub symbol: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl TickPush {
    pub fn tick(&self) -> Tick {
        Tick {
            epoch: self.epoch,
            quote: self.quote,
        }
    }
}
