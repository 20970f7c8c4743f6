//! Symbol catalog and trading-hours models.

use serde::{Deserialize, Serialize};

/// One entry of the `active_symbols` catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub submarket: String,
    #[serde(default)]
    pub exchange_is_open: u8,
    #[serde(default)]
    pub is_trading_suspended: u8,
    /// Smallest price increment, e.g. `0.01`.
    #[serde(default)]
    pub pip: f64,
}

impl ActiveSymbol {
    pub fn is_open(&self) -> bool {
        self.exchange_is_open == 1 && self.is_trading_suspended == 0
    }

    /// Number of decimal places implied by `pip`.
    pub fn pip_size(&self) -> u32 {
        if self.pip <= 0.0 || self.pip >= 1.0 {
            return 0;
        }
        (-self.pip.log10()).round() as u32
    }
}

/// The `trading_times` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingTimes {
    #[serde(default)]
    pub markets: Vec<Market>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub name: String,
    #[serde(default)]
    pub submarkets: Vec<Submarket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submarket {
    pub name: String,
    #[serde(default)]
    pub symbols: Vec<SymbolTimes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTimes {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub times: SessionTimes,
}

/// Opening and closing times (`HH:MM:SS`, or `--` when closed all day).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTimes {
    #[serde(default)]
    pub open: Vec<String>,
    #[serde(default)]
    pub close: Vec<String>,
}

impl TradingTimes {
    /// Looks up the session times of `symbol` across all markets.
    pub fn times_for(&self, symbol: &str) -> Option<&SessionTimes> {
        self.markets
            .iter()
            .flat_map(|m| &m.submarkets)
            .flat_map(|s| &s.symbols)
            .find(|s| s.symbol == symbol)
            .map(|s| &s.times)
    }
}
