use std::sync::Arc;

use quoteline::QuotelineError;
use quoteline::chart::{ChartAdapter, QuoteRequest, QuoteUpdate};
use quoteline::config::fetch_config;
use quoteline::websocket::{
    ConnectionEvent, ConnectionManager, Requester, SubscriptionRegistry, WsConnector,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), QuotelineError> {
    // Initialize tracing subscriber for logging output.
    tracing_subscriber::fmt::init();

    let app_config = fetch_config()?;

    let mut args = std::env::args().skip(1);
    let symbol = args.next().unwrap_or_else(|| "R_100".to_string());
    let granularity = match args.next() {
        Some(value) => value
            .parse()
            .map_err(|_| QuotelineError::Config(format!("invalid granularity {value:?}")))?,
        None => 0,
    };

    let connector = Arc::new(WsConnector::from_config(&app_config.feed));
    let manager = Arc::new(ConnectionManager::new(connector, &app_config.feed));
    let watchdog = manager.spawn_watchdog(app_config.feed.watchdog_interval);

    let mut events = manager.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::SessionInvalidated => warn!("Session invalidated"),
                other => info!(?other, "Connection event"),
            }
        }
    });

    let requester = Requester::new(Arc::clone(&manager), app_config.stream.retry);
    let registry = SubscriptionRegistry::spawn(requester.clone(), &app_config.stream)?;
    let adapter = ChartAdapter::new(requester, registry, &app_config.stream);

    let chart_data = adapter.get_chart_data().await;
    if let Some(error) = adapter.error() {
        warn!("{error}");
    }
    info!(
        symbols = chart_data.active_symbols.len(),
        "Symbol catalog ready"
    );

    let request = QuoteRequest::new(symbol, granularity);
    let subscription = adapter.subscribe_quotes(&request, |update| match update {
        QuoteUpdate::Quotes(quotes) => info!(empty = quotes.is_empty(), "History received"),
        QuoteUpdate::Tick(tick) => info!(epoch = tick.epoch, quote = tick.quote, "Tick"),
        QuoteUpdate::Ohlc(candle) => info!(
            epoch = candle.epoch,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            "Candle"
        ),
    });
    info!(key = %subscription.key(), "Streaming, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    adapter.unsubscribe_quotes(None).await;
    manager.close().await;
    watchdog.abort();

    Ok(())
}
