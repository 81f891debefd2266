use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::instrument;
use uuid::Uuid;

use crate::metrics::metrics_models::{
    ClientApplication, ClientInstance, ClientRegistration, HourlyKey, HourlyUsage, ToggleCounts,
};
use crate::store::{
    ApplicationStore, MetricsStore, StoreError, StoreHealth, StoreResult, TokenStore, ToggleStore,
};
use crate::tokens::token_models::{ApiToken, ProjectAccess, TokenType};
use crate::toggles::constraint::ConstraintDefinition;
use crate::toggles::strategy::{FeatureStrategy, StrategyDefinition};
use crate::toggles::toggle_models::{FeatureEnvironment, FeatureToggle, Variant};

/// A store backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    secret: String,
    token_name: String,
    token_type: String,
    projects: Vec<String>,
    environment: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TokenRow> for ApiToken {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        let token_type: TokenType = row
            .token_type
            .parse()
            .map_err(|_| StoreError::Corrupted(format!("token type {}", row.token_type)))?;
        Ok(ApiToken {
            secret: row.secret,
            token_name: row.token_name,
            token_type,
            projects: row.projects,
            environment: row.environment,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FeatureRow {
    name: String,
    project: String,
    description: Option<String>,
    impression_data: bool,
    variants: Json<Vec<Variant>>,
    archived: bool,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    feature_name: String,
    environment: String,
    enabled: bool,
}

#[derive(sqlx::FromRow)]
struct StrategyRow {
    id: Uuid,
    feature_name: String,
    environment: String,
    strategy_name: String,
    parameters: Json<BTreeMap<String, String>>,
    constraints: Json<Vec<ConstraintDefinition>>,
}

#[derive(sqlx::FromRow)]
struct HourlyRow {
    environment: String,
    timestamp: DateTime<Utc>,
    yes_count: i64,
    no_count: i64,
}

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    app_name: String,
    strategies: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    app_name: String,
    instance_id: String,
    sdk_version: Option<String>,
    environment: String,
    started: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

fn count_to_db(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn count_from_db(count: i64) -> u64 {
    u64::try_from(count).unwrap_or_default()
}

impl PgStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<PgStore> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(StoreError::ConnectionError)?;
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> PgStore {
        PgStore { pool }
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Loads environments and strategies for the given feature rows and assembles the toggles.
    async fn assemble(&self, features: Vec<FeatureRow>) -> StoreResult<Vec<FeatureToggle>> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = features.iter().map(|f| f.name.clone()).collect();

        let environments = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT feature_name, environment, enabled FROM feature_environments
             WHERE feature_name = ANY($1) ORDER BY seq",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT feature_environments"))?;

        let strategies = sqlx::query_as::<_, StrategyRow>(
            "SELECT id, feature_name, environment, strategy_name, parameters, constraints
             FROM feature_strategies WHERE feature_name = ANY($1) ORDER BY seq",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT feature_strategies"))?;

        let mut toggles: Vec<FeatureToggle> = features
            .into_iter()
            .map(|row| FeatureToggle {
                name: row.name,
                project: row.project,
                description: row.description,
                impression_data: row.impression_data,
                variants: row.variants.0,
                environments: Vec::new(),
                archived: row.archived,
                created_at: row.created_at,
            })
            .collect();
        let positions: HashMap<String, usize> = toggles
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        for row in environments {
            if let Some(&i) = positions.get(&row.feature_name) {
                let mut environment = FeatureEnvironment::new(&row.environment);
                environment.enabled = row.enabled;
                toggles[i].environments.push(environment);
            }
        }

        for row in strategies {
            let Some(&i) = positions.get(&row.feature_name) else {
                continue;
            };
            let definition = StrategyDefinition {
                name: row.strategy_name,
                parameters: row.parameters.0,
                constraints: row.constraints.0,
            };
            let strategy = FeatureStrategy::from_definition(row.id, definition)
                .map_err(|e| StoreError::Corrupted(format!("strategy {}: {}", row.id, e)))?;
            toggles[i]
                .environment_mut(&row.environment)
                .strategies
                .push(strategy);
        }

        Ok(toggles)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    #[instrument(skip_all)]
    async fn get_token(&self, secret: &str) -> StoreResult<Option<ApiToken>> {
        let row = sqlx::query_as::<_, TokenRow>(
            "SELECT secret, token_name, token_type, projects, environment, created_at
             FROM api_tokens WHERE secret = $1",
        )
        .bind(secret)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::query("SELECT api_tokens"))?;
        row.map(ApiToken::try_from).transpose()
    }

    async fn list_tokens(&self) -> StoreResult<Vec<ApiToken>> {
        sqlx::query_as::<_, TokenRow>(
            "SELECT secret, token_name, token_type, projects, environment, created_at
             FROM api_tokens ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT api_tokens"))?
        .into_iter()
        .map(ApiToken::try_from)
        .collect()
    }

    async fn insert_token(&self, token: &ApiToken) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO api_tokens (secret, token_name, token_type, projects, environment, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (secret) DO NOTHING",
        )
        .bind(&token.secret)
        .bind(&token.token_name)
        .bind(token.token_type.as_str())
        .bind(&token.projects)
        .bind(&token.environment)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("INSERT api_tokens"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("token {}", token.token_name)));
        }
        Ok(())
    }

    async fn delete_token(&self, secret: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM api_tokens WHERE secret = $1")
            .bind(secret)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query("DELETE api_tokens"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ToggleStore for PgStore {
    #[instrument(skip_all)]
    async fn list_toggles(&self, projects: &ProjectAccess) -> StoreResult<Vec<FeatureToggle>> {
        let columns = "SELECT name, project, description, impression_data, variants, archived, created_at FROM features";
        let features = match projects {
            ProjectAccess::All => {
                sqlx::query_as::<_, FeatureRow>(&format!("{columns} ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await
            }
            ProjectAccess::Only(projects) => {
                let projects: Vec<String> = projects.iter().cloned().collect();
                sqlx::query_as::<_, FeatureRow>(&format!(
                    "{columns} WHERE project = ANY($1) ORDER BY id"
                ))
                .bind(projects)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(StoreError::query("SELECT features"))?;

        self.assemble(features).await
    }

    async fn get_toggle(&self, name: &str) -> StoreResult<Option<FeatureToggle>> {
        let features = sqlx::query_as::<_, FeatureRow>(
            "SELECT name, project, description, impression_data, variants, archived, created_at
             FROM features WHERE name = $1",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT features"))?;
        Ok(self.assemble(features).await?.pop())
    }

    async fn create_toggle(&self, toggle: &FeatureToggle) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionError)?;

        let result = sqlx::query(
            "INSERT INTO features (name, project, description, impression_data, variants, archived, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(&toggle.name)
        .bind(&toggle.project)
        .bind(&toggle.description)
        .bind(toggle.impression_data)
        .bind(Json(&toggle.variants))
        .bind(toggle.archived)
        .bind(toggle.created_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("INSERT features"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("feature {}", toggle.name)));
        }

        for environment in &toggle.environments {
            sqlx::query(
                "INSERT INTO feature_environments (feature_name, environment, enabled)
                 VALUES ($1, $2, $3)",
            )
            .bind(&toggle.name)
            .bind(&environment.name)
            .bind(environment.enabled)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::query("INSERT feature_environments"))?;

            for strategy in &environment.strategies {
                insert_strategy(&mut tx, &toggle.name, &environment.name, strategy).await?;
            }
        }

        tx.commit().await.map_err(StoreError::query("COMMIT"))?;
        Ok(())
    }

    async fn set_environment_enabled(
        &self,
        name: &str,
        environment: &str,
        enabled: bool,
    ) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionError)?;
        lock_toggle(&mut tx, name).await?;

        sqlx::query(
            "INSERT INTO feature_environments (feature_name, environment, enabled)
             VALUES ($1, $2, $3)
             ON CONFLICT (feature_name, environment) DO UPDATE SET enabled = EXCLUDED.enabled",
        )
        .bind(name)
        .bind(environment)
        .bind(enabled)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("UPSERT feature_environments"))?;

        tx.commit().await.map_err(StoreError::query("COMMIT"))?;
        Ok(())
    }

    async fn add_strategy(
        &self,
        name: &str,
        environment: &str,
        strategy: &FeatureStrategy,
    ) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionError)?;
        lock_toggle(&mut tx, name).await?;

        sqlx::query(
            "INSERT INTO feature_environments (feature_name, environment, enabled)
             VALUES ($1, $2, FALSE)
             ON CONFLICT (feature_name, environment) DO NOTHING",
        )
        .bind(name)
        .bind(environment)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("INSERT feature_environments"))?;

        insert_strategy(&mut tx, name, environment, strategy).await?;

        tx.commit().await.map_err(StoreError::query("COMMIT"))?;
        Ok(())
    }

    async fn remove_strategy(
        &self,
        name: &str,
        environment: &str,
        id: Uuid,
    ) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionError)?;
        lock_toggle(&mut tx, name).await?;

        let result = sqlx::query(
            "DELETE FROM feature_strategies
             WHERE id = $1 AND feature_name = $2 AND environment = $3",
        )
        .bind(id)
        .bind(name)
        .bind(environment)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("DELETE feature_strategies"))?;

        tx.commit().await.map_err(StoreError::query("COMMIT"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn archive_toggle(&self, name: &str) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE features SET archived = TRUE WHERE name = $1 AND NOT archived")
                .bind(name)
                .execute(&self.pool)
                .await
                .map_err(StoreError::query("UPDATE features"))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Locks the feature row for the rest of the transaction, so it cannot be archived or
/// removed under the write.
async fn lock_toggle(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    name: &str,
) -> StoreResult<()> {
    let locked: Option<i64> =
        sqlx::query_scalar("SELECT id FROM features WHERE name = $1 FOR SHARE")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(StoreError::query("SELECT features FOR SHARE"))?;
    match locked {
        Some(_) => Ok(()),
        None => Err(StoreError::NotFound(format!("feature {name}"))),
    }
}

async fn insert_strategy(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    name: &str,
    environment: &str,
    strategy: &FeatureStrategy,
) -> StoreResult<()> {
    let definition = strategy.to_definition();
    sqlx::query(
        "INSERT INTO feature_strategies (id, feature_name, environment, strategy_name, parameters, constraints)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(strategy.id)
    .bind(name)
    .bind(environment)
    .bind(&definition.name)
    .bind(Json(&definition.parameters))
    .bind(Json(&definition.constraints))
    .execute(&mut **tx)
    .await
    .map_err(StoreError::query("INSERT feature_strategies"))?;
    Ok(())
}

#[async_trait]
impl MetricsStore for PgStore {
    #[instrument(skip_all)]
    async fn increment_hourly(&self, key: &HourlyKey, counts: ToggleCounts) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO client_metrics_hourly (feature_name, environment, timestamp, yes_count, no_count)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (feature_name, environment, timestamp) DO UPDATE
             SET yes_count = LEAST(client_metrics_hourly.yes_count::NUMERIC + EXCLUDED.yes_count, 9223372036854775807)::BIGINT,
                 no_count = LEAST(client_metrics_hourly.no_count::NUMERIC + EXCLUDED.no_count, 9223372036854775807)::BIGINT",
        )
        .bind(&key.feature_name)
        .bind(&key.environment)
        .bind(key.timestamp)
        .bind(count_to_db(counts.yes))
        .bind(count_to_db(counts.no))
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("UPSERT client_metrics_hourly"))?;
        Ok(())
    }

    async fn add_seen_application(&self, feature_name: &str, app_name: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO feature_seen_applications (feature_name, app_name)
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(feature_name)
        .bind(app_name)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("INSERT feature_seen_applications"))?;
        Ok(())
    }

    async fn hourly_usage(
        &self,
        feature_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<HourlyUsage>> {
        let rows = sqlx::query_as::<_, HourlyRow>(
            "SELECT environment, timestamp, yes_count, no_count FROM client_metrics_hourly
             WHERE feature_name = $1 AND timestamp >= $2
             ORDER BY timestamp, environment",
        )
        .bind(feature_name)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT client_metrics_hourly"))?;

        Ok(rows
            .into_iter()
            .map(|row| HourlyUsage {
                environment: row.environment,
                timestamp: row.timestamp,
                yes: count_from_db(row.yes_count),
                no: count_from_db(row.no_count),
            })
            .collect())
    }

    async fn seen_applications(&self, feature_name: &str) -> StoreResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT app_name FROM feature_seen_applications
             WHERE feature_name = $1 ORDER BY app_name",
        )
        .bind(feature_name)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT feature_seen_applications"))
    }
}

#[async_trait]
impl ApplicationStore for PgStore {
    async fn upsert_registration(&self, registration: &ClientRegistration) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionError)?;

        sqlx::query(
            "INSERT INTO client_applications (app_name, strategies, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (app_name) DO UPDATE
             SET strategies = EXCLUDED.strategies, updated_at = EXCLUDED.updated_at",
        )
        .bind(&registration.app_name)
        .bind(&registration.strategies)
        .bind(registration.seen_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("UPSERT client_applications"))?;

        sqlx::query(
            "INSERT INTO client_instances (app_name, instance_id, sdk_version, environment, started, last_seen)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (app_name, instance_id) DO UPDATE
             SET sdk_version = EXCLUDED.sdk_version,
                 environment = EXCLUDED.environment,
                 started = EXCLUDED.started,
                 last_seen = EXCLUDED.last_seen",
        )
        .bind(&registration.app_name)
        .bind(&registration.instance_id)
        .bind(&registration.sdk_version)
        .bind(&registration.environment)
        .bind(registration.started)
        .bind(registration.seen_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::query("UPSERT client_instances"))?;

        tx.commit().await.map_err(StoreError::query("COMMIT"))?;
        Ok(())
    }

    async fn list_applications(&self) -> StoreResult<Vec<ClientApplication>> {
        let applications = sqlx::query_as::<_, ApplicationRow>(
            "SELECT app_name, strategies FROM client_applications ORDER BY app_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT client_applications"))?;

        let instances = sqlx::query_as::<_, InstanceRow>(
            "SELECT app_name, instance_id, sdk_version, environment, started, last_seen
             FROM client_instances ORDER BY app_name, instance_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT client_instances"))?;

        let mut by_app: HashMap<String, Vec<ClientInstance>> = HashMap::new();
        for row in instances {
            by_app.entry(row.app_name).or_default().push(ClientInstance {
                instance_id: row.instance_id,
                sdk_version: row.sdk_version,
                environment: row.environment,
                started: row.started,
                last_seen: row.last_seen,
            });
        }

        Ok(applications
            .into_iter()
            .map(|row| ClientApplication {
                instances: by_app.remove(&row.app_name).unwrap_or_default(),
                app_name: row.app_name,
                strategies: row.strategies,
            })
            .collect())
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::ConnectionError)?;
        Ok(())
    }
}
