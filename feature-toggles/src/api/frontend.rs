use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;

use crate::api::errors::ApiError;
use crate::api::reporting;
use crate::api::types::FrontendResponse;
use crate::metrics_utils::TOGGLE_EVALUATIONS_COUNTER;
use crate::router;
use crate::tokens::token_resolver::FRONTEND_ACCESS;
use crate::toggles::context::EvaluationContext;

/// Toggles enabled for the caller's context, within the token's scope.
pub async fn features(
    state: State<router::State>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FrontendResponse>, ApiError> {
    let token = state
        .token_resolver
        .resolve_headers(&headers, FRONTEND_ACCESS)
        .await?;

    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let context = EvaluationContext::from_query(params).with_remote_address_fallback(peer);

    let toggles = state
        .toggle_filter
        .visible_toggles(&token.scope(), &context)
        .await?;
    metrics::counter!(TOGGLE_EVALUATIONS_COUNTER, "api" => "frontend").increment(1);

    Ok(Json(FrontendResponse { toggles }))
}

pub async fn register(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let token = state
        .token_resolver
        .resolve_headers(&headers, FRONTEND_ACCESS)
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
        .resolve_headers(&headers, FRONTEND_ACCESS)
        .await?;
    reporting::metrics(&state, &token, body).await?;
    Ok("OK")
}
