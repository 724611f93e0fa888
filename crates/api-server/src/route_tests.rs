use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use broker_adapter::{FakeBroker, QuoteTick};
use market_core::{AppConfig, Timeframe};
use market_data::{HistoryProvider, QuoteCache, StreamManager};
use model_registry::ModelRegistry;
use order_router::{OrderRouter, RouterConfig};
use performance_tracker::PerformanceTracker;
use portfolio::SnapshotStore;
use rust_decimal::prelude::FromPrimitive;
use signal_pipeline::SignalPipeline;

use crate::{build_router, AppState};

const INFY: &str = "NSE_EQ|INFY";

async fn test_app() -> (Router, AppState) {
    let config = AppConfig {
        timeframes: vec![Timeframe::Daily],
        timeframe_weights: vec![1.0],
        ..AppConfig::default()
    };

    let broker = Arc::new(FakeBroker::new());
    broker.set_ticks(vec![QuoteTick {
        instrument_key: INFY.to_string(),
        ltp: 1500.0,
        open: 1490.0,
        high: 1510.0,
        low: 1485.0,
        close: 1495.0,
        volume: 1000.0,
        source_ts: Utc::now(),
    }]);

    let history = Arc::new(HistoryProvider::new(broker.clone()));
    let registry = Arc::new(ModelRegistry::in_memory());
    let tracker = Arc::new(PerformanceTracker::in_memory(30, 5));
    let quote_cache = Arc::new(QuoteCache::new(Duration::from_secs(60), 64));
    let stream = Arc::new(StreamManager::new(
        broker.clone(),
        quote_cache.clone(),
        256,
        Duration::from_secs(30),
    ));
    let order_router = Arc::new(OrderRouter::new(
        RouterConfig {
            paper_slippage_bps: 5.0,
            max_order_quantity: config.max_order_quantity,
            max_position_value: rust_decimal::Decimal::from_f64(config.max_position_value)
                .unwrap(),
            starting_cash: rust_decimal::Decimal::from_f64(config.paper_starting_cash).unwrap(),
        },
        broker,
        quote_cache.clone(),
    ));
    order_router
        .register_instruments(&[INFY.to_string()])
        .await;
    let snapshots = SnapshotStore::new("sqlite::memory:").await.unwrap();
    let pipeline = Arc::new(
        SignalPipeline::new(config.clone(), history, registry, tracker).unwrap(),
    );

    let state = AppState {
        config: Arc::new(config),
        pipeline,
        order_router,
        snapshots,
        stream,
        quote_cache,
    };
    (build_router(state.clone()), state)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn models_endpoint_lists_active_models() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(Request::get("/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_model_performance_is_not_found() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(
            Request::get("/models/nope/performance?window=7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["kind"], "NotFound");
}

#[tokio::test]
async fn signal_for_symbol_without_data_is_not_ready() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(
            Request::get("/signals/NSE_EQ%7CUNSEEDED")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["kind"], "NotReady");
}

#[tokio::test]
async fn mode_switch_requires_confirmation_handshake() {
    let (app, _) = test_app().await;

    // first attempt: challenged, mode unchanged
    let response = app
        .clone()
        .oneshot(
            Request::post("/mode")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"mode":"live"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["mode"], "paper");
    assert_eq!(body["data"]["confirmation_required"], true);
    let token = body["data"]["confirmation_token"].as_str().unwrap().to_string();

    // second attempt with the token: flipped
    let payload = format!(r#"{{"mode":"live","confirmation":"{token}"}}"#);
    let response = app
        .clone()
        .oneshot(
            Request::post("/mode")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["mode"], "live");

    let response = app
        .oneshot(Request::get("/mode").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["mode"], "live");
}

#[tokio::test]
async fn paper_order_round_trips_through_the_api() {
    let (app, _) = test_app().await;
    let payload = format!(
        r#"{{"symbol":"{INFY}","side":"buy","order_type":"market","quantity":10}}"#
    );
    let response = app
        .clone()
        .oneshot(
            Request::post("/orders")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["state"], "filled");
    let order_id = body["data"]["order_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            Request::get(format!("/orders/{order_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["symbol"], INFY);
}

#[tokio::test]
async fn invalid_order_gets_machine_readable_error() {
    let (app, _) = test_app().await;
    let payload = format!(
        r#"{{"symbol":"{INFY}","side":"buy","order_type":"market","quantity":0}}"#
    );
    let response = app
        .oneshot(
            Request::post("/orders")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "InvalidOrder");
    assert!(body["error"]["message"].as_str().unwrap().contains("quantity"));
}

#[tokio::test]
async fn holdings_reflect_paper_fills() {
    let (app, _) = test_app().await;
    let payload = format!(
        r#"{{"symbol":"{INFY}","side":"buy","order_type":"market","quantity":10}}"#
    );
    app.clone()
        .oneshot(
            Request::post("/orders")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::get("/portfolio/holdings")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let holdings = body["data"]["holdings"].as_array().unwrap();
    assert_eq!(holdings.len(), 1);
    assert_eq!(holdings[0]["symbol"], INFY);
}

#[tokio::test]
async fn snapshot_range_defaults_to_recent_window() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(
            Request::get("/portfolio/snapshots")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}
