use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;

use crate::api::errors::ApiError;
use crate::api::reporting;
use crate::api::types::{ClientFeaturesResponse, CLIENT_FEATURES_VERSION};
use crate::metrics_utils::TOGGLE_EVALUATIONS_COUNTER;
use crate::router;
use crate::tokens::token_resolver::CLIENT_ACCESS;

/// Toggle definitions for server-side SDKs, which evaluate them locally.
pub async fn features(
    state: State<router::State>,
    headers: HeaderMap,
) -> Result<Json<ClientFeaturesResponse>, ApiError> {
    let token = state
        .token_resolver
        .resolve_headers(&headers, CLIENT_ACCESS)
        .await?;
    let features = state.toggle_filter.definitions(&token.scope()).await?;
    metrics::counter!(TOGGLE_EVALUATIONS_COUNTER, "api" => "client").increment(1);

    Ok(Json(ClientFeaturesResponse {
        version: CLIENT_FEATURES_VERSION,
        features,
    }))
}

pub async fn register(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let token = state
        .token_resolver
        .resolve_headers(&headers, CLIENT_ACCESS)
        .await?;
    reporting::register(&state, &token, body).await?;
    Ok("OK")
}

pub async fn metrics(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let token = state
        .token_resolver
        .resolve_headers(&headers, CLIENT_ACCESS)
        .await?;
    reporting::metrics(&state, &token, body).await?;
    Ok("OK")
}
