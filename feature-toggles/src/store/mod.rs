use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::metrics_models::{
    ClientApplication, ClientRegistration, HourlyKey, HourlyUsage, ToggleCounts,
};
use crate::tokens::token_models::{ApiToken, ProjectAccess};
use crate::toggles::strategy::FeatureStrategy;
use crate::toggles::toggle_models::FeatureToggle;

pub mod memory;
pub mod postgres;

/// Enumeration of errors for operations on the stores.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("migrations failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("stored data is corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    pub fn query(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
        move |error| StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_token(&self, secret: &str) -> StoreResult<Option<ApiToken>>;

    async fn list_tokens(&self) -> StoreResult<Vec<ApiToken>>;

    /// Fails with `Conflict` when the secret is already issued.
    async fn insert_token(&self, token: &ApiToken) -> StoreResult<()>;

    /// Returns whether a token was deleted.
    async fn delete_token(&self, secret: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait ToggleStore: Send + Sync {
    /// Toggles in the given projects, archived ones included, in insertion order.
    async fn list_toggles(&self, projects: &ProjectAccess) -> StoreResult<Vec<FeatureToggle>>;

    async fn get_toggle(&self, name: &str) -> StoreResult<Option<FeatureToggle>>;

    /// Fails with `Conflict` when a toggle of that name exists in any project.
    async fn create_toggle(&self, toggle: &FeatureToggle) -> StoreResult<()>;

    async fn set_environment_enabled(
        &self,
        name: &str,
        environment: &str,
        enabled: bool,
    ) -> StoreResult<()>;

    async fn add_strategy(
        &self,
        name: &str,
        environment: &str,
        strategy: &FeatureStrategy,
    ) -> StoreResult<()>;

    /// Returns whether a strategy was removed.
    async fn remove_strategy(&self, name: &str, environment: &str, id: Uuid)
        -> StoreResult<bool>;

    /// Returns whether a live toggle was archived.
    async fn archive_toggle(&self, name: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Adds counts to one hourly aggregate. Must be atomic per key.
    async fn increment_hourly(&self, key: &HourlyKey, counts: ToggleCounts) -> StoreResult<()>;

    async fn add_seen_application(&self, feature_name: &str, app_name: &str) -> StoreResult<()>;

    /// Aggregates at or after `since`, ordered by timestamp then environment.
    async fn hourly_usage(
        &self,
        feature_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<HourlyUsage>>;

    /// Sorted by application name.
    async fn seen_applications(&self, feature_name: &str) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn upsert_registration(&self, registration: &ClientRegistration) -> StoreResult<()>;

    async fn list_applications(&self) -> StoreResult<Vec<ClientApplication>>;
}

#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;
}

/// One backend seen through each repository interface.
#[derive(Clone)]
pub struct Stores {
    pub tokens: Arc<dyn TokenStore>,
    pub toggles: Arc<dyn ToggleStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub applications: Arc<dyn ApplicationStore>,
    pub health: Arc<dyn StoreHealth>,
}

impl Stores {
    pub fn from_backend<S>(backend: S) -> Stores
    where
        S: TokenStore + ToggleStore + MetricsStore + ApplicationStore + StoreHealth + 'static,
    {
        let backend = Arc::new(backend);
        Stores {
            tokens: backend.clone(),
            toggles: backend.clone(),
            metrics: backend.clone(),
            applications: backend.clone(),
            health: backend,
        }
    }
}
