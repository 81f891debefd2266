use anyhow::Error;
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{memory::MemoryStore, Stores};
use crate::tokens::token_models::{ApiToken, TokenType};
use crate::toggles::strategy::{FeatureStrategy, StrategyDefinition};
use crate::toggles::toggle_models::FeatureToggle;

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub fn memory_stores() -> Stores {
    Stores::from_backend(MemoryStore::new())
}

pub async fn insert_token(
    stores: &Stores,
    secret: &str,
    token_type: TokenType,
) -> Result<ApiToken, Error> {
    let token = ApiToken::from_secret(secret, token_type, Utc::now())?;
    stores.tokens.insert_token(&token).await?;
    Ok(token)
}

/// Builds strategies from their JSON definitions, e.g. `[{"name": "default"}]`.
pub fn strategies_from_json(definitions: Value) -> Result<Vec<FeatureStrategy>, Error> {
    let definitions: Vec<StrategyDefinition> = serde_json::from_value(definitions)?;
    definitions
        .into_iter()
        .map(|definition| Ok(FeatureStrategy::from_definition(Uuid::now_v7(), definition)?))
        .collect()
}

/// Inserts a toggle that is enabled in one environment with the given strategies.
pub async fn insert_toggle(
    stores: &Stores,
    project: &str,
    name: &str,
    environment: &str,
    strategies: Value,
) -> Result<FeatureToggle, Error> {
    let mut toggle = FeatureToggle::new(name, project, Utc::now());
    let feature_environment = toggle.environment_mut(environment);
    feature_environment.enabled = true;
    feature_environment.strategies = strategies_from_json(strategies)?;
    stores.toggles.create_toggle(&toggle).await?;
    Ok(toggle)
}
