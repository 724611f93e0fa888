//! HTTP/WS surface the core exposes to its hosting process.

mod model_routes;
mod order_routes;
mod portfolio_routes;
mod signal_routes;
mod ws_routes;

#[cfg(test)]
mod route_tests;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use broker_adapter::{BrokerAdapter, FakeBroker, UpstoxAdapter};
use market_core::{exit, AppConfig, CoreError};
use market_data::{HistoryProvider, QuoteCache, StreamManager};
use model_registry::{ModelRegistry, RegistryStore};
use order_router::{OrderRouter, RouterConfig};
use performance_tracker::PerformanceTracker;
use portfolio::{SnapshotStore, Snapshotter};
use rust_decimal::prelude::FromPrimitive;
use signal_pipeline::SignalPipeline;

// ---------------------------------------------------------------------------
// Shared state and response envelope
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<SignalPipeline>,
    pub order_router: Arc<OrderRouter>,
    pub snapshots: SnapshotStore,
    pub stream: Arc<StreamManager>,
    pub quote_cache: Arc<QuoteCache>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error kind.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Route-level error: a `CoreError` rendered as a machine-readable body
/// plus the matching status code.
pub struct AppError(pub CoreError);

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) | CoreError::NotReady(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidSymbol(_)
            | CoreError::InvalidOrder(_)
            | CoreError::InvalidData(_)
            | CoreError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            CoreError::ConfirmationRequired(_) => StatusCode::FORBIDDEN,
            CoreError::InsufficientHistory { .. }
            | CoreError::InsufficientSamples { .. }
            | CoreError::InsufficientData { .. }
            | CoreError::NoActivePredictors(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Timeout(_) | CoreError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::UpstreamTransient(_) | CoreError::UpstreamPermanent(_) => {
                StatusCode::BAD_GATEWAY
            }
            CoreError::AuthFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                kind: self.0.kind().to_string(),
                message: self.0.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(signal_routes::routes())
        .merge(model_routes::routes())
        .merge(order_routes::routes())
        .merge(portfolio_routes::routes())
        .merge(ws_routes::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Process assembly
// ---------------------------------------------------------------------------

/// Build every component from config. Errors map onto the hosting
/// process's exit codes (see `exit_code_for`).
pub async fn build_state(config: AppConfig) -> Result<AppState, CoreError> {
    let config = Arc::new(config);
    std::fs::create_dir_all(&config.data_dir)?;

    // broker adapter: live token if configured, deterministic fake
    // otherwise so paper trading works offline
    let adapter: Arc<dyn BrokerAdapter> = match std::env::var("UPSTOX_ACCESS_TOKEN") {
        Ok(token) if !token.is_empty() => Arc::new(
            UpstoxAdapter::new(token).map_err(CoreError::from)?,
        ),
        _ => {
            tracing::warn!("UPSTOX_ACCESS_TOKEN not set; using the offline fake broker");
            Arc::new(FakeBroker::new())
        }
    };

    let history = Arc::new(
        HistoryProvider::new(adapter.clone()).with_cache_dir(config.data_dir.join("cache"))?,
    );
    let registry = Arc::new(ModelRegistry::open(RegistryStore::open(
        config.data_dir.join("registry"),
    )?)?);
    let tracker = Arc::new(PerformanceTracker::open(
        config.data_dir.join("predictions.log"),
        config.tracker_window_days,
        config.min_observations,
    )?);

    let quote_cache = Arc::new(QuoteCache::new(config.cache_ttl, config.cache_capacity));
    let stream = Arc::new(StreamManager::new(
        adapter.clone(),
        quote_cache.clone(),
        2048,
        std::time::Duration::from_secs(60),
    ));

    let order_router = Arc::new(OrderRouter::new(
        RouterConfig {
            paper_slippage_bps: config.paper_slippage_bps,
            max_order_quantity: config.max_order_quantity,
            max_position_value: rust_decimal::Decimal::from_f64(config.max_position_value)
                .ok_or_else(|| {
                    CoreError::InvalidConfig("max_position_value is not representable".into())
                })?,
            starting_cash: rust_decimal::Decimal::from_f64(config.paper_starting_cash)
                .ok_or_else(|| {
                    CoreError::InvalidConfig("paper_starting_cash is not representable".into())
                })?,
        },
        adapter.clone(),
        quote_cache.clone(),
    ));

    let db_url = format!("sqlite://{}", config.data_dir.join("snapshots.db").display());
    let snapshots = SnapshotStore::new(&db_url).await?;

    let pipeline = Arc::new(SignalPipeline::new(
        (*config).clone(),
        history,
        registry,
        tracker,
    )?);

    Ok(AppState {
        config,
        pipeline,
        order_router,
        snapshots,
        stream,
        quote_cache,
    })
}

/// Run the server until ctrl-c, with the stream manager and snapshotter
/// as sibling tasks.
pub async fn run_server(config: AppConfig) -> Result<(), CoreError> {
    let state = build_state(config).await?;

    // the watchlist is streamed, tradable, and settled in the background
    if !state.config.watchlist.is_empty() {
        state
            .order_router
            .register_instruments(&state.config.watchlist)
            .await;
        state.stream.subscribe(&state.config.watchlist).await;
    }

    let snapshotter = Arc::new(Snapshotter::new(
        state.order_router.clone(),
        state.snapshots.clone(),
        state.config.snapshot_interval,
        state.config.session_end_time,
        state.config.snapshot_retention_days,
    ));

    let stream = state.stream.clone();
    let stream_task = tokio::spawn(async move { stream.run().await });

    let snap = snapshotter.clone();
    let snapshot_task = tokio::spawn(async move { snap.run().await });

    // resting paper orders re-price as the cache moves
    let router_for_polling = state.order_router.clone();
    let poll_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
        loop {
            ticker.tick().await;
            router_for_polling.poll_open_orders().await;
        }
    });

    // periodic settlement: match open predictions against realised bars
    let pipeline_for_settle = state.pipeline.clone();
    let watchlist = state.config.watchlist.clone();
    let settle_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            ticker.tick().await;
            for symbol in &watchlist {
                if let Err(e) = pipeline_for_settle.settle(symbol).await {
                    tracing::warn!(symbol, error = %e, "settlement pass failed");
                }
            }
        }
    });

    let bind_addr = state.config.bind_addr.clone();
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|e| CoreError::Persistence(format!("server error: {e}")))?;

    // orderly teardown: final snapshot, then stop the stream
    snapshotter.shutdown();
    state.stream.shutdown();
    poll_task.abort();
    settle_task.abort();
    let _ = snapshot_task.await;
    let _ = stream_task.await;
    Ok(())
}

/// Map a startup/runtime failure onto the documented exit codes.
pub fn exit_code_for(err: &CoreError) -> i32 {
    match err {
        CoreError::InvalidConfig(_) => exit::CONFIG,
        CoreError::UnreadableState(_) | CoreError::RegistryCorruption(_) => exit::STATE,
        CoreError::Io(_) | CoreError::Persistence(_) => exit::IO,
        _ => exit::INTERNAL,
    }
}
