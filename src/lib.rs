//! Multiplexed market-data streaming client.
//!
//! Opens and recovers a single feed connection, deduplicates concurrent
//! subscriptions per (symbol, granularity) stream, merges streamed ticks and
//! candles into bounded rolling series, and fans updates out to any number of
//! listeners. [`chart::ChartAdapter`] packages this for a chart widget.

pub mod chart;
pub mod config;
pub mod error;
pub mod models;
pub mod series;
pub mod websocket;

pub use error::{QuotelineError, Result};
