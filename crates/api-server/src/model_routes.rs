use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use market_core::{ModelMetadata, RollingMetrics};

use crate::{ApiResponse, AppError, AppState};

#[derive(Deserialize)]
pub struct PerformanceQuery {
    /// Rolling window in days; defaults to the tracker's configured window.
    pub window: Option<u32>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/:id/performance", get(model_performance))
        .route("/models/train/:symbol", post(train_models))
}

/// Active models with their rolling metrics inline.
async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<ModelMetadata>>>, AppError> {
    let all = state.pipeline.registry().list_metadata().await;
    let active: Vec<ModelMetadata> = all.into_iter().filter(|m| m.active).collect();
    Ok(Json(ApiResponse::success(active)))
}

async fn model_performance(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Query(query): Query<PerformanceQuery>,
) -> Result<Json<ApiResponse<RollingMetrics>>, AppError> {
    // existence check first so an unknown id is NotFound, not
    // InsufficientSamples
    state.pipeline.registry().get_metadata(&model_id).await?;

    let window = query.window.unwrap_or(state.config.tracker_window_days);
    let metrics = state
        .pipeline
        .tracker()
        .rolling_metrics_windowed(&model_id, window, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(metrics)))
}

/// Fit (or refit) the predictor stack for a symbol. Returns the ids
/// active after the run.
async fn train_models(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Vec<String>>>, AppError> {
    let active = state.pipeline.train_models(&symbol).await?;
    Ok(Json(ApiResponse::success(active)))
}
