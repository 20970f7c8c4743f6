//! Chart adapter behavior against an in-memory backend.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quoteline::chart::{ChartAdapter, QuoteRequest, QuoteUpdate, Quotes};
use quoteline::config::{FeedConfig, StreamConfig};
use quoteline::models::ApiErrorKind;
use quoteline::models::tick::History;
use quoteline::websocket::SubscriptionState;
use serde_json::{Value, json};

use common::{
    Harness, Recorder, candles_body, error_body, eventually, harness, harness_with, history_body,
    serve, stream_config, tick_push,
};

fn adapter_for(h: &Harness, config: &StreamConfig) -> ChartAdapter {
    ChartAdapter::new(h.requester.clone(), h.registry.clone(), config)
}

fn symbols_body(symbols: &[&str]) -> Value {
    let symbols: Vec<Value> = symbols
        .iter()
        .map(|symbol| {
            json!({
                "symbol": symbol,
                "display_name": format!("{symbol} Index"),
                "market": "synthetic_index",
                "submarket": "random_index",
                "exchange_is_open": 1,
                "is_trading_suspended": 0,
                "pip": 0.01
            })
        })
        .collect();
    json!({"msg_type": "active_symbols", "active_symbols": symbols})
}

fn trading_times_body() -> Value {
    json!({
        "msg_type": "trading_times",
        "trading_times": {
            "markets": [{
                "name": "Derived",
                "submarkets": [{
                    "name": "Continuous Indices",
                    "symbols": [{
                        "symbol": "R_100",
                        "name": "Volatility 100 Index",
                        "times": {"open": ["00:00:00"], "close": ["23:59:59"]}
                    }]
                }]
            }]
        }
    })
}

/// Answers catalog requests, returning an empty symbol list when
/// `empty_on` holds for the n-th catalog call (1-based).
fn catalog_backend(
    calls: Arc<AtomicUsize>,
    empty_on: impl Fn(usize) -> bool + Send + 'static,
) -> impl FnMut(&Value) -> Option<Value> + Send + 'static {
    move |request| {
        if request.get("active_symbols").is_some() {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            return Some(if empty_on(call) {
                symbols_body(&[])
            } else {
                symbols_body(&["R_100", "R_50"])
            });
        }
        if request.get("trading_times").is_some() {
            return Some(trading_times_body());
        }
        None
    }
}

/// Answers subscribes with one tick of history and acknowledges forgets.
fn stream_backend(request: &Value) -> Option<Value> {
    if let Some(symbol) = request["ticks_history"].as_str() {
        let id = format!("sub-{symbol}");
        return Some(history_body(&[1.0], &[1], Some(&id)));
    }
    if request.get("forget").is_some() {
        return Some(json!({"msg_type": "forget", "forget": 1}));
    }
    if request.get("forget_all").is_some() {
        return Some(json!({"msg_type": "forget_all", "forget_all": []}));
    }
    None
}

#[tokio::test]
async fn test_two_subscribers_share_one_request_and_both_get_history() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let first = Recorder::<QuoteUpdate>::new();
    let second = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 0);

    adapter.subscribe_quotes(&request, first.callback());
    adapter.subscribe_quotes(&request, second.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, history_body(&[1.0, 2.0, 3.0], &[1, 2, 3], Some("sub-1")));
    eventually(|| first.len() == 1 && second.len() == 1).await;

    let expected = QuoteUpdate::Quotes(Quotes::History(History {
        prices: vec![1.0, 2.0, 3.0],
        times: vec![1, 2, 3],
    }));
    assert_eq!(first.all(), vec![expected.clone()]);
    assert_eq!(second.all(), vec![expected]);
    assert!(socket.try_next_request().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_subscriber_does_not_reorder_history_and_ticks() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let recorder = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 0);

    let slow_calls = Arc::clone(&calls);
    adapter.subscribe_quotes(&request, move |_| {
        if slow_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(300));
        }
    });
    adapter.subscribe_quotes(&request, recorder.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, history_body(&[1.0, 2.0, 3.0], &[1, 2, 3], Some("sub-1")));
    eventually(|| h.registry.state(&request.key()) == SubscriptionState::Active).await;
    socket.push(tick_push("R_100", 4, 4.0, "sub-1"));

    eventually(|| recorder.len() == 2).await;
    let updates = recorder.all();
    let QuoteUpdate::Quotes(Quotes::History(history)) = &updates[0] else {
        panic!("expected history first, got {:?}", updates[0]);
    };
    assert_eq!(history.times, vec![1, 2, 3]);
    assert!(matches!(&updates[1], QuoteUpdate::Tick(tick) if tick.epoch == 4));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsubscribe_twice_forgets_once() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let recorder = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 0);
    let subscription = adapter.subscribe_quotes(&request, recorder.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, history_body(&[1.0], &[1], Some("sub-1")));
    eventually(|| recorder.len() == 1).await;

    let copy = subscription.clone();
    assert!(subscription.unsubscribe());
    assert!(!subscription.unsubscribe());
    assert!(!copy.unsubscribe());
    assert!(!copy.is_active());

    let forget = socket.next_request().await;
    assert_eq!(forget["forget"], "sub-1");
    socket.reply(&forget, json!({"msg_type": "forget", "forget": 1}));

    eventually(|| h.registry.state(&request.key()) == SubscriptionState::NoSubscription).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(socket.try_next_request().is_none());
}

#[tokio::test]
async fn test_unsubscribed_callback_stays_silent_while_stream_lives() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let gone = Recorder::<QuoteUpdate>::new();
    let staying = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 0);

    let unmounted = adapter.subscribe_quotes(&request, gone.callback());
    adapter.subscribe_quotes(&request, staying.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, history_body(&[1.0], &[1], Some("sub-1")));
    eventually(|| gone.len() == 1 && staying.len() == 1).await;

    unmounted.unsubscribe();
    socket.push(tick_push("R_100", 2, 2.5, "sub-1"));
    eventually(|| staying.len() == 2).await;

    assert_eq!(gone.len(), 1);
    assert_eq!(h.registry.state(&request.key()), SubscriptionState::Active);
    assert!(matches!(staying.last(), Some(QuoteUpdate::Tick(tick)) if tick.epoch == 2));
}

#[tokio::test]
async fn test_subscribing_to_live_stream_delivers_history_at_once() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let first = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 0);
    adapter.subscribe_quotes(&request, first.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, history_body(&[1.0, 2.0], &[1, 2], Some("sub-1")));
    eventually(|| first.len() == 1).await;

    let late = Recorder::<QuoteUpdate>::new();
    adapter.subscribe_quotes(&request, late.callback());
    eventually(|| late.len() == 1).await;
    assert_eq!(late.all(), first.all());
}

#[tokio::test]
async fn test_subscribing_to_empty_live_stream_delivers_empty_quotes() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let first = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 0);
    adapter.subscribe_quotes(&request, first.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, history_body(&[], &[], Some("sub-1")));
    eventually(|| first.len() == 1).await;
    assert_eq!(h.registry.state(&request.key()), SubscriptionState::Active);

    let late = Recorder::<QuoteUpdate>::new();
    adapter.subscribe_quotes(&request, late.callback());
    eventually(|| late.len() == 1).await;
    assert_eq!(late.last(), Some(QuoteUpdate::Quotes(Quotes::empty(0))));

    socket.push(tick_push("R_100", 5, 5.0, "sub-1"));
    eventually(|| late.len() == 2).await;
    assert!(matches!(late.last(), Some(QuoteUpdate::Tick(tick)) if tick.epoch == 5));
}

#[tokio::test]
async fn test_stream_error_becomes_empty_quotes() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let recorder = Recorder::<QuoteUpdate>::new();
    let request = QuoteRequest::new("R_100", 60);
    adapter.subscribe_quotes(&request, recorder.callback());

    let mut socket = h.backend.accept().await;
    let subscribe = socket.next_request().await;
    socket.reply(&subscribe, candles_body(&[(60, 1.0)], Some("c-1")));
    eventually(|| recorder.len() == 1).await;

    let mut closed = error_body("MarketIsClosed");
    closed["msg_type"] = json!("ohlc");
    closed["subscription"] = json!({"id": "c-1"});
    closed["echo_req"] = json!({
        "ticks_history": "R_100", "style": "candles", "granularity": 60, "subscribe": 1
    });
    socket.push(closed);

    eventually(|| recorder.len() == 2).await;
    assert_eq!(recorder.last(), Some(QuoteUpdate::Quotes(Quotes::empty(60))));
}

#[tokio::test]
async fn test_get_quotes_returns_candles() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let request = QuoteRequest {
        count: 2,
        ..QuoteRequest::new("R_100", 60)
    };

    let (quotes, sent) = tokio::join!(adapter.get_quotes(&request), async {
        let mut socket = h.backend.accept().await;
        let sent = socket.next_request().await;
        socket.reply(&sent, candles_body(&[(60, 1.0), (120, 1.2)], None));
        (socket, sent)
    });

    let (_socket, sent) = sent;
    assert_eq!(sent["style"], "candles");
    assert_eq!(sent["granularity"], 60);
    assert_eq!(sent["count"], 2);
    assert!(sent.get("subscribe").is_none());

    let Quotes::Candles(candles) = quotes.expect("get_quotes failed") else {
        panic!("expected candles");
    };
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[1].close, 1.2);
}

#[tokio::test]
async fn test_get_quotes_surfaces_business_errors() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let request = QuoteRequest::new("NOPE", 0);

    let (quotes, _socket) = tokio::join!(adapter.get_quotes(&request), async {
        let mut socket = h.backend.accept().await;
        let sent = socket.next_request().await;
        socket.reply(&sent, error_body("InvalidSymbol"));
        socket
    });

    let err = quotes.expect_err("get_quotes should fail");
    assert_eq!(err.api_error().map(|e| e.kind), Some(ApiErrorKind::InvalidSymbol));
}

#[tokio::test(start_paused = true)]
async fn test_chart_data_retries_empty_catalog() {
    let Harness {
        mut backend,
        requester,
        registry,
        ..
    } = harness();
    let adapter = ChartAdapter::new(requester, registry, &stream_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = catalog_backend(Arc::clone(&calls), |call| call < 3);
    tokio::spawn(async move {
        let (_, task) = serve(backend.accept().await, handler);
        let _ = task.await;
    });

    let data = adapter.get_chart_data().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(data.active_symbols.len(), 2);
    assert!(data.trading_times.times_for("R_100").is_some());
    assert!(adapter.error().is_none());
    assert_eq!(adapter.chart_data(), data);
}

#[tokio::test(start_paused = true)]
async fn test_chart_data_exhaustion_keeps_last_known_good() {
    let config = StreamConfig {
        chart_data_retries: 2,
        ..stream_config()
    };
    let Harness {
        mut backend,
        requester,
        registry,
        ..
    } = harness_with(&FeedConfig::default(), &config);
    let adapter = ChartAdapter::new(requester, registry, &config);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = catalog_backend(Arc::clone(&calls), |call| call > 1);
    tokio::spawn(async move {
        let (_, task) = serve(backend.accept().await, handler);
        let _ = task.await;
    });

    let loaded = adapter.get_chart_data().await;
    assert_eq!(loaded.active_symbols.len(), 2);

    let fallback = adapter.get_chart_data().await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(fallback, loaded);
    assert!(adapter.error().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_chart_data_timeout_yields_error_state() {
    let config = StreamConfig {
        chart_data_retries: 0,
        ..stream_config()
    };
    let Harness {
        mut backend,
        requester,
        registry,
        ..
    } = harness_with(&FeedConfig::default(), &config);
    let adapter = ChartAdapter::new(requester, registry, &config);
    tokio::spawn(async move {
        let (_, task) = serve(backend.accept().await, |_| None);
        let _ = task.await;
    });

    let data = adapter.get_chart_data().await;

    assert!(data.active_symbols.is_empty());
    assert!(adapter.error().is_some());
}

#[tokio::test]
async fn test_unsubscribe_one_request_keeps_others() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let r100 = QuoteRequest::new("R_100", 0);
    let r50 = QuoteRequest::new("R_50", 0);
    adapter.subscribe_quotes(&r100, |_| {});
    adapter.subscribe_quotes(&r50, |_| {});

    let (seen, _task) = serve(h.backend.accept().await, stream_backend);
    eventually(|| {
        h.registry.state(&r100.key()) == SubscriptionState::Active
            && h.registry.state(&r50.key()) == SubscriptionState::Active
    })
    .await;

    adapter.unsubscribe_quotes(Some(&r100)).await;

    eventually(|| h.registry.state(&r100.key()) == SubscriptionState::NoSubscription).await;
    assert_eq!(h.registry.listener_count(&r50.key()), 1);
    let requests = seen.lock().clone();
    assert!(requests.iter().any(|r| r["forget"] == "sub-R_100"));
    assert!(requests.iter().all(|r| r.get("forget_all").is_none()));
}

#[tokio::test]
async fn test_unsubscribe_everything_forgets_all_ticks() {
    let mut h = harness();
    let adapter = adapter_for(&h, &stream_config());
    let r100 = QuoteRequest::new("R_100", 0);
    let r50 = QuoteRequest::new("R_50", 0);
    adapter.subscribe_quotes(&r100, |_| {});
    adapter.subscribe_quotes(&r50, |_| {});

    let (seen, _task) = serve(h.backend.accept().await, stream_backend);
    eventually(|| {
        h.registry.state(&r100.key()) == SubscriptionState::Active
            && h.registry.state(&r50.key()) == SubscriptionState::Active
    })
    .await;

    adapter.unsubscribe_quotes(None).await;

    assert!(
        seen.lock()
            .iter()
            .any(|r| r["forget_all"] == json!(["ticks"]))
    );
    for request in [&r100, &r50] {
        assert_eq!(h.registry.listener_count(&request.key()), 0);
        eventually(|| h.registry.state(&request.key()) == SubscriptionState::NoSubscription)
            .await;
    }
}
