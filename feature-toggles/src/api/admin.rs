use std::collections::{BTreeSet, HashMap};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::api::types::{
    ApplicationsResponse, CreateFeatureRequest, CreateTokenRequest, FeatureView,
    FeaturesResponse, TokensResponse, ADMIN_FEATURES_VERSION,
};
use crate::metrics::aggregator::DEFAULT_HOURS_BACK;
use crate::metrics::metrics_models::FeatureUsage;
use crate::router;
use crate::time::TimeSource;
use crate::tokens::token_models::{generate_secret, ApiToken, ProjectAccess, TokenType, WILDCARD};
use crate::tokens::token_resolver::ADMIN_ACCESS;
use crate::toggles::strategy::{FeatureStrategy, StrategyDefinition};
use crate::toggles::toggle_filter::StrategyView;
use crate::toggles::toggle_models::{validate_variants, FeatureToggle};

const MAX_FEATURE_NAME_LENGTH: usize = 100;

async fn authorize(state: &router::State, headers: &HeaderMap) -> Result<ApiToken, ApiError> {
    let token = state
        .token_resolver
        .resolve_headers(headers, ADMIN_ACCESS)
        .await?;
    tracing::debug!(token_name = %token.token_name, "admin request");
    Ok(token)
}

/// Builds a new token with a fresh secret. Admin tokens always span every project and environment.
fn issue_token(request: CreateTokenRequest, now: DateTime<Utc>) -> Result<ApiToken, ApiError> {
    if request.token_name.trim().is_empty() {
        return Err(ApiError::BadRequest("tokenName must not be empty".to_string()));
    }

    let (projects, environment) = match request.token_type {
        TokenType::Admin => (vec![WILDCARD.to_string()], WILDCARD.to_string()),
        TokenType::Client | TokenType::Frontend => {
            let environment = request
                .environment
                .filter(|env| !env.is_empty() && env != WILDCARD)
                .ok_or_else(|| {
                    ApiError::BadRequest(format!(
                        "{} tokens must name a single environment",
                        request.token_type
                    ))
                })?;
            let projects = match (request.projects, request.project) {
                (Some(projects), _) => projects,
                (None, Some(project)) => vec![project],
                (None, None) => vec![WILDCARD.to_string()],
            };
            if projects.is_empty() || projects.iter().any(|p| p.is_empty()) {
                return Err(ApiError::BadRequest(
                    "projects must list at least one project".to_string(),
                ));
            }
            let projects = if projects.iter().any(|p| p == WILDCARD) {
                vec![WILDCARD.to_string()]
            } else {
                projects
            };
            (projects, environment)
        }
    };

    Ok(ApiToken {
        secret: generate_secret(&projects, &environment),
        token_name: request.token_name,
        token_type: request.token_type,
        projects,
        environment,
        created_at: now,
    })
}

fn validate_feature_name(name: &str) -> Result<(), ApiError> {
    let url_friendly = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if name.is_empty() || name.len() > MAX_FEATURE_NAME_LENGTH || !url_friendly {
        return Err(ApiError::BadRequest(format!(
            "{name:?} is not a valid feature name"
        )));
    }
    Ok(())
}

/// Loads a toggle and checks it lives in the given project. Archived toggles count as missing.
async fn project_toggle(
    state: &router::State,
    project_id: &str,
    feature_name: &str,
) -> Result<FeatureToggle, ApiError> {
    match state.stores.toggles.get_toggle(feature_name).await? {
        Some(toggle) if toggle.project == project_id && !toggle.archived => Ok(toggle),
        _ => Err(ApiError::NotFound(format!(
            "feature {feature_name} in project {project_id}"
        ))),
    }
}

pub async fn list_tokens(
    state: State<router::State>,
    headers: HeaderMap,
) -> Result<Json<TokensResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let tokens = state.stores.tokens.list_tokens().await?;
    Ok(Json(TokensResponse { tokens }))
}

pub async fn create_token(
    state: State<router::State>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiToken>), ApiError> {
    authorize(&state, &headers).await?;
    let request: CreateTokenRequest = serde_json::from_slice(&body)?;
    let token = issue_token(request, state.clock.now())?;
    state.stores.tokens.insert_token(&token).await?;

    tracing::info!(token_name = %token.token_name, token_type = %token.token_type, "issued token");
    Ok((StatusCode::CREATED, Json(token)))
}

pub async fn delete_token(
    state: State<router::State>,
    headers: HeaderMap,
    Path(secret): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers).await?;
    if !state.stores.tokens.delete_token(&secret).await? {
        return Err(ApiError::NotFound("token".to_string()));
    }
    tracing::info!("revoked token");
    Ok(StatusCode::OK)
}

pub async fn list_features(
    state: State<router::State>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Result<Json<FeaturesResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let toggles = state
        .stores
        .toggles
        .list_toggles(&ProjectAccess::Only(BTreeSet::from([project_id])))
        .await?;
    let features = toggles
        .iter()
        .filter(|toggle| !toggle.archived)
        .map(FeatureView::from)
        .collect();
    Ok(Json(FeaturesResponse {
        version: ADMIN_FEATURES_VERSION,
        features,
    }))
}

pub async fn create_feature(
    state: State<router::State>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<FeatureView>), ApiError> {
    authorize(&state, &headers).await?;
    let request: CreateFeatureRequest = serde_json::from_slice(&body)?;
    validate_feature_name(&request.name)?;
    validate_variants(&request.variants)?;

    let mut toggle = FeatureToggle::new(&request.name, &project_id, state.clock.now());
    toggle.description = request.description;
    toggle.impression_data = request.impression_data;
    toggle.variants = request.variants;
    state.stores.toggles.create_toggle(&toggle).await?;

    tracing::info!(feature = %toggle.name, project = %toggle.project, "created feature");
    Ok((StatusCode::CREATED, Json(FeatureView::from(&toggle))))
}

pub async fn archive_feature(
    state: State<router::State>,
    headers: HeaderMap,
    Path((project_id, feature_name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers).await?;
    project_toggle(&state, &project_id, &feature_name).await?;
    state.stores.toggles.archive_toggle(&feature_name).await?;
    tracing::info!(feature = %feature_name, "archived feature");
    Ok(StatusCode::OK)
}

async fn set_environment(
    state: &router::State,
    project_id: &str,
    feature_name: &str,
    environment: &str,
    enabled: bool,
) -> Result<Json<FeatureView>, ApiError> {
    project_toggle(state, project_id, feature_name).await?;
    state
        .stores
        .toggles
        .set_environment_enabled(feature_name, environment, enabled)
        .await?;
    let toggle = project_toggle(state, project_id, feature_name).await?;
    Ok(Json(FeatureView::from(&toggle)))
}

pub async fn enable_environment(
    state: State<router::State>,
    headers: HeaderMap,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
) -> Result<Json<FeatureView>, ApiError> {
    authorize(&state, &headers).await?;
    set_environment(&state, &project_id, &feature_name, &environment, true).await
}

pub async fn disable_environment(
    state: State<router::State>,
    headers: HeaderMap,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
) -> Result<Json<FeatureView>, ApiError> {
    authorize(&state, &headers).await?;
    set_environment(&state, &project_id, &feature_name, &environment, false).await
}

pub async fn add_strategy(
    state: State<router::State>,
    headers: HeaderMap,
    Path((project_id, feature_name, environment)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Json<StrategyView>, ApiError> {
    authorize(&state, &headers).await?;
    let definition: StrategyDefinition = serde_json::from_slice(&body)?;
    let strategy = FeatureStrategy::from_definition(Uuid::now_v7(), definition)?;

    project_toggle(&state, &project_id, &feature_name).await?;
    state
        .stores
        .toggles
        .add_strategy(&feature_name, &environment, &strategy)
        .await?;

    tracing::info!(feature = %feature_name, %environment, strategy = strategy.strategy.name(), "added strategy");
    Ok(Json(StrategyView::from(&strategy)))
}

pub async fn remove_strategy(
    state: State<router::State>,
    headers: HeaderMap,
    Path((project_id, feature_name, environment, strategy_id)): Path<(
        String,
        String,
        String,
        Uuid,
    )>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers).await?;
    project_toggle(&state, &project_id, &feature_name).await?;
    if !state
        .stores
        .toggles
        .remove_strategy(&feature_name, &environment, strategy_id)
        .await?
    {
        return Err(ApiError::NotFound(format!("strategy {strategy_id}")));
    }
    Ok(StatusCode::OK)
}

pub async fn feature_usage(
    state: State<router::State>,
    headers: HeaderMap,
    Path(feature_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FeatureUsage>, ApiError> {
    authorize(&state, &headers).await?;
    let hours_back = match params.get("hoursBack") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::BadRequest(format!("hoursBack {raw:?} is not a number")))?,
        None => DEFAULT_HOURS_BACK,
    };
    let usage = state
        .metrics_aggregator
        .feature_usage(&feature_name, hours_back)
        .await?;
    Ok(Json(usage))
}

pub async fn list_applications(
    state: State<router::State>,
    headers: HeaderMap,
) -> Result<Json<ApplicationsResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let applications = state.application_registry.applications().await?;
    Ok(Json(ApplicationsResponse { applications }))
}
