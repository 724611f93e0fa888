use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use market_core::{CoreError, Order, OrderState, TradingMode};
use order_router::{ModeChange, OrderModify, OrderRequest};

use crate::{ApiResponse, AppError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(place_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/modify", post(modify_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/mode", post(set_mode).get(get_mode))
}

#[derive(Debug, Serialize)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
}

async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<ApiResponse<OrderAck>>, AppError> {
    let order = state.order_router.place(request).await?;
    Ok(Json(ApiResponse::success(OrderAck {
        order_id: order.order_id,
        state: order.state,
    })))
}

async fn list_orders(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Order>>>, AppError> {
    Ok(Json(ApiResponse::success(state.order_router.list().await)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<Order>>, AppError> {
    Ok(Json(ApiResponse::success(
        state.order_router.get(&order_id).await?,
    )))
}

async fn modify_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(patch): Json<OrderModify>,
) -> Result<Json<ApiResponse<Order>>, AppError> {
    Ok(Json(ApiResponse::success(
        state.order_router.modify(&order_id, patch).await?,
    )))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<Order>>, AppError> {
    Ok(Json(ApiResponse::success(
        state.order_router.cancel(&order_id).await?,
    )))
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
    #[serde(default)]
    pub confirmation: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModeResponse {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_required: Option<bool>,
    /// Present the token back on the next call to complete the switch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_token: Option<String>,
}

async fn set_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<ApiResponse<ModeResponse>>, AppError> {
    let target = TradingMode::parse(&request.mode)
        .ok_or_else(|| CoreError::InvalidData(format!("unknown mode {}", request.mode)))?;

    let change = state
        .order_router
        .set_mode(target, request.confirmation.as_deref())
        .await?;

    let response = match change {
        ModeChange::Changed(mode) => ModeResponse {
            mode: mode.as_str().to_string(),
            confirmation_required: None,
            confirmation_token: None,
        },
        ModeChange::ConfirmationRequired { token } => ModeResponse {
            mode: state.order_router.mode().await.as_str().to_string(),
            confirmation_required: Some(true),
            confirmation_token: Some(token),
        },
    };
    Ok(Json(ApiResponse::success(response)))
}

async fn get_mode(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ModeResponse>>, AppError> {
    Ok(Json(ApiResponse::success(ModeResponse {
        mode: state.order_router.mode().await.as_str().to_string(),
        confirmation_required: None,
        confirmation_token: None,
    })))
}
