use bytes::Bytes;

use crate::api::errors::ApiError;
use crate::api::types::{ClientMetricsRequest, ClientRegistrationRequest, DEFAULT_INSTANCE_ID};
use crate::metrics::metrics_models::{ClientRegistration, MetricsBucket};
use crate::router;
use crate::time::TimeSource;
use crate::tokens::token_models::ApiToken;
use crate::toggles::toggle_filter::DEFAULT_ENVIRONMENT;

/// The token's environment when it names one, otherwise the one in the body, otherwise `default`.
pub fn reporting_environment(token: &ApiToken, requested: Option<String>) -> String {
    if let Some(environment) = token.scope().environment.concrete() {
        return environment.to_string();
    }
    requested
        .filter(|environment| !environment.is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

fn require_app_name(app_name: &str) -> Result<(), ApiError> {
    if app_name.trim().is_empty() {
        return Err(ApiError::BadRequest("appName must not be empty".to_string()));
    }
    Ok(())
}

/// Records an SDK registration posted with the given token.
pub async fn register(
    state: &router::State,
    token: &ApiToken,
    body: Bytes,
) -> Result<(), ApiError> {
    let request: ClientRegistrationRequest = serde_json::from_slice(&body)?;
    require_app_name(&request.app_name)?;

    let registration = ClientRegistration {
        environment: reporting_environment(token, request.environment),
        app_name: request.app_name,
        instance_id: request
            .instance_id
            .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string()),
        sdk_version: request.sdk_version,
        interval: request.interval,
        started: request.started,
        strategies: request.strategies,
        seen_at: state.clock.now(),
    };
    state.application_registry.register(&registration).await?;
    Ok(())
}

/// Merges a usage bucket posted with the given token.
pub async fn metrics(
    state: &router::State,
    token: &ApiToken,
    body: Bytes,
) -> Result<(), ApiError> {
    let request: ClientMetricsRequest = serde_json::from_slice(&body)?;
    require_app_name(&request.app_name)?;

    let bucket = MetricsBucket {
        environment: reporting_environment(token, request.environment),
        app_name: request.app_name,
        instance_id: request
            .instance_id
            .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string()),
        start: request.bucket.start,
        stop: request.bucket.stop,
        toggles: request.bucket.toggles,
    };
    state.metrics_aggregator.ingest(&bucket).await?;
    Ok(())
}
