use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use market_core::{CoreError, SignalRecord};

use crate::{ApiResponse, AppError, AppState};

/// Per-request ceiling on on-demand signal generation.
const GENERATE_DEADLINE: Duration = Duration::from_secs(20);

pub fn routes() -> Router<AppState> {
    Router::new().route("/signals/:symbol", get(get_signal))
}

/// Latest signal for a symbol, generating one on demand if none exists.
async fn get_signal(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<SignalRecord>>, AppError> {
    if let Some(record) = state.pipeline.tracker().latest_signal(&symbol).await {
        return Ok(Json(ApiResponse::success(record)));
    }

    match state.pipeline.generate(&symbol, GENERATE_DEADLINE).await {
        Ok(record) => Ok(Json(ApiResponse::success(record))),
        // no usable data yet reads as "not ready" rather than a fault
        Err(CoreError::InsufficientHistory { .. }) | Err(CoreError::NoActivePredictors(_)) => {
            Err(AppError(CoreError::NotReady(symbol)))
        }
        Err(e) => Err(AppError(e)),
    }
}
