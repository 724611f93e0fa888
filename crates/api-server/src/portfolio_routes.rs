use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use market_core::{Holding, PortfolioSnapshot};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{ApiResponse, AppError, AppState};

#[derive(Deserialize)]
pub struct SnapshotQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HoldingsResponse {
    pub cash: Decimal,
    pub total_value: Decimal,
    pub holdings: Vec<Holding>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/portfolio/snapshots", get(get_snapshots))
        .route("/portfolio/holdings", get(get_holdings))
}

/// Ordered snapshots within the requested range (defaults to the last
/// 30 days).
async fn get_snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<ApiResponse<Vec<PortfolioSnapshot>>>, AppError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - chrono::Duration::days(30));
    let snapshots = state.snapshots.range(from, to).await?;
    Ok(Json(ApiResponse::success(snapshots)))
}

/// The holdings book right now, valued at the latest cached prices.
async fn get_holdings(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<HoldingsResponse>>, AppError> {
    let (cash, total_value, holdings) = state.order_router.holdings_valued().await;
    Ok(Json(ApiResponse::success(HoldingsResponse {
        cash,
        total_value,
        holdings,
    })))
}
