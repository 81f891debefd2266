use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::metrics_models::{ClientApplication, ToggleCounts};
use crate::tokens::token_models::{ApiToken, TokenType};
use crate::toggles::toggle_filter::{ClientFeature, EvaluatedToggle, StrategyView};
use crate::toggles::toggle_models::{FeatureToggle, Variant};

pub const CLIENT_FEATURES_VERSION: u32 = 2;
pub const ADMIN_FEATURES_VERSION: u32 = 1;

/// Instance id recorded when an SDK does not send one.
pub const DEFAULT_INSTANCE_ID: &str = "default";

#[derive(Debug, Deserialize, Serialize)]
pub struct FrontendResponse {
    pub toggles: Vec<EvaluatedToggle>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClientFeaturesResponse {
    pub version: u32,
    pub features: Vec<ClientFeature>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistrationRequest {
    pub app_name: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub sdk_version: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    pub interval: u64,
    pub started: DateTime<Utc>,
    pub strategies: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BucketPayload {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(default)]
    pub toggles: BTreeMap<String, ToggleCounts>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetricsRequest {
    pub app_name: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    pub bucket: BucketPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest {
    #[serde(alias = "username")]
    pub token_name: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default)]
    pub projects: Option<Vec<String>>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TokensResponse {
    pub tokens: Vec<ApiToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFeatureRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub impression_data: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentView {
    pub name: String,
    pub enabled: bool,
    pub strategies: Vec<StrategyView>,
}

/// A toggle with all of its environments, as the admin API shows it.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureView {
    pub name: String,
    pub project: String,
    pub description: Option<String>,
    pub impression_data: bool,
    pub variants: Vec<Variant>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub environments: Vec<EnvironmentView>,
}

impl From<&FeatureToggle> for FeatureView {
    fn from(toggle: &FeatureToggle) -> Self {
        FeatureView {
            name: toggle.name.clone(),
            project: toggle.project.clone(),
            description: toggle.description.clone(),
            impression_data: toggle.impression_data,
            variants: toggle.variants.clone(),
            archived: toggle.archived,
            created_at: toggle.created_at,
            environments: toggle
                .environments
                .iter()
                .map(|env| EnvironmentView {
                    name: env.name.clone(),
                    enabled: env.enabled,
                    strategies: env.strategies.iter().map(StrategyView::from).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FeaturesResponse {
    pub version: u32,
    pub features: Vec<FeatureView>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ApplicationsResponse {
    pub applications: Vec<ClientApplication>,
}
