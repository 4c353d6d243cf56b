use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::api::error::ApiError;
use crate::indexer::AddressInfo;
use crate::state::AppState;
use crate::store::AddressDetails;

#[derive(Deserialize)]
pub struct TrackRequest {
    pub address: String,
    #[serde(default)]
    pub required_confirmations: Option<i64>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/track", post(track_address))
        .route("/api/address/:address", get(get_address))
        // A bare path without an address is a client error, not a miss.
        .route("/api/address", get(missing_address))
        .route("/api/address/", get(missing_address))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .with_state(state)
}

/// Bearer-token check applied to every route.
async fn auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(ApiError::Unauthorized);
    };
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();
    if scheme != "Bearer" || token.is_empty() || token != state.config.api_token {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// POST /api/track: register an address and return its current view. The
/// address is wired into the mempool tracker before the response goes out
/// so the next tick already matches it.
async fn track_address(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TrackRequest>,
) -> Result<Json<AddressDetails>, ApiError> {
    if request.address.trim().is_empty() {
        return Err(ApiError::BadRequest("address required".to_string()));
    }
    let required = request.required_confirmations.unwrap_or(1).max(1);
    info!(address = %request.address, required, "tracking address");

    let tracked = state
        .store
        .get_or_create_address(&request.address, required)
        .await?;

    state
        .mempool
        .add_address(
            &tracked.address,
            AddressInfo {
                id: tracked.id,
                required_confirmations: tracked.required_confirmations,
            },
        )
        .await;

    details_response(&state, &tracked.address).await
}

/// GET /api/address/{address}: same shape as track; an unknown address is
/// registered with the default confirmation threshold.
async fn get_address(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<AddressDetails>, ApiError> {
    if address.trim().is_empty() {
        return Err(ApiError::BadRequest("address required".to_string()));
    }
    state.store.get_or_create_address(&address, 1).await?;
    details_response(&state, &address).await
}

async fn missing_address() -> ApiError {
    ApiError::BadRequest("address required".to_string())
}

async fn details_response(
    state: &AppState,
    address: &str,
) -> Result<Json<AddressDetails>, ApiError> {
    match state.store.address_details(address).await? {
        Some(details) => Ok(Json(details)),
        None => {
            error!(%address, "address vanished between registration and read");
            Err(ApiError::BadRequest("address required".to_string()))
        }
    }
}
