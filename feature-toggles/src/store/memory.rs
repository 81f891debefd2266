use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics::metrics_models::{
    ClientApplication, ClientInstance, ClientRegistration, HourlyKey, HourlyUsage, ToggleCounts,
};
use crate::store::{
    ApplicationStore, MetricsStore, StoreError, StoreHealth, StoreResult, TokenStore, ToggleStore,
};
use crate::tokens::token_models::{ApiToken, ProjectAccess};
use crate::toggles::strategy::FeatureStrategy;
use crate::toggles::toggle_models::FeatureToggle;

#[derive(Default)]
struct MemoryState {
    tokens: Vec<ApiToken>,
    toggles: Vec<FeatureToggle>,
    hourly: BTreeMap<HourlyKey, ToggleCounts>,
    seen_applications: HashMap<String, BTreeSet<String>>,
    applications: BTreeMap<String, ClientApplication>,
}

impl MemoryState {
    fn toggle_mut(&mut self, name: &str) -> StoreResult<&mut FeatureToggle> {
        self.toggles
            .iter_mut()
            .find(|toggle| toggle.name == name)
            .ok_or_else(|| StoreError::NotFound(format!("feature {name}")))
    }
}

/// Keeps everything in process memory. Each operation runs under a single lock
/// acquisition, which makes metric increments atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get_token(&self, secret: &str) -> StoreResult<Option<ApiToken>> {
        let state = self.state.read().await;
        Ok(state.tokens.iter().find(|t| t.secret == secret).cloned())
    }

    async fn list_tokens(&self) -> StoreResult<Vec<ApiToken>> {
        Ok(self.state.read().await.tokens.clone())
    }

    async fn insert_token(&self, token: &ApiToken) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.tokens.iter().any(|t| t.secret == token.secret) {
            return Err(StoreError::Conflict(format!("token {}", token.token_name)));
        }
        state.tokens.push(token.clone());
        Ok(())
    }

    async fn delete_token(&self, secret: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let before = state.tokens.len();
        state.tokens.retain(|t| t.secret != secret);
        Ok(state.tokens.len() != before)
    }
}

#[async_trait]
impl ToggleStore for MemoryStore {
    async fn list_toggles(&self, projects: &ProjectAccess) -> StoreResult<Vec<FeatureToggle>> {
        let state = self.state.read().await;
        Ok(state
            .toggles
            .iter()
            .filter(|toggle| projects.allows(&toggle.project))
            .cloned()
            .collect())
    }

    async fn get_toggle(&self, name: &str) -> StoreResult<Option<FeatureToggle>> {
        let state = self.state.read().await;
        Ok(state.toggles.iter().find(|t| t.name == name).cloned())
    }

    async fn create_toggle(&self, toggle: &FeatureToggle) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.toggles.iter().any(|t| t.name == toggle.name) {
            return Err(StoreError::Conflict(format!("feature {}", toggle.name)));
        }
        state.toggles.push(toggle.clone());
        Ok(())
    }

    async fn set_environment_enabled(
        &self,
        name: &str,
        environment: &str,
        enabled: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.toggle_mut(name)?.environment_mut(environment).enabled = enabled;
        Ok(())
    }

    async fn add_strategy(
        &self,
        name: &str,
        environment: &str,
        strategy: &FeatureStrategy,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .toggle_mut(name)?
            .environment_mut(environment)
            .strategies
            .push(strategy.clone());
        Ok(())
    }

    async fn remove_strategy(
        &self,
        name: &str,
        environment: &str,
        id: Uuid,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let toggle = state.toggle_mut(name)?;
        let Some(environment) = toggle
            .environments
            .iter_mut()
            .find(|env| env.name == environment)
        else {
            return Ok(false);
        };
        let before = environment.strategies.len();
        environment.strategies.retain(|strategy| strategy.id != id);
        Ok(environment.strategies.len() != before)
    }

    async fn archive_toggle(&self, name: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.toggles.iter_mut().find(|t| t.name == name) {
            Some(toggle) if !toggle.archived => {
                toggle.archived = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn increment_hourly(&self, key: &HourlyKey, counts: ToggleCounts) -> StoreResult<()> {
        let mut state = self.state.write().await;
        *state.hourly.entry(key.clone()).or_default() += counts;
        Ok(())
    }

    async fn add_seen_application(&self, feature_name: &str, app_name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .seen_applications
            .entry(feature_name.to_string())
            .or_default()
            .insert(app_name.to_string());
        Ok(())
    }

    async fn hourly_usage(
        &self,
        feature_name: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<HourlyUsage>> {
        let state = self.state.read().await;
        let mut usage: Vec<HourlyUsage> = state
            .hourly
            .iter()
            .filter(|(key, _)| key.feature_name == feature_name && key.timestamp >= since)
            .map(|(key, counts)| HourlyUsage {
                environment: key.environment.clone(),
                timestamp: key.timestamp,
                yes: counts.yes,
                no: counts.no,
            })
            .collect();
        usage.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.environment.cmp(&b.environment))
        });
        Ok(usage)
    }

    async fn seen_applications(&self, feature_name: &str) -> StoreResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .seen_applications
            .get(feature_name)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn upsert_registration(&self, registration: &ClientRegistration) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let application = state
            .applications
            .entry(registration.app_name.clone())
            .or_insert_with(|| ClientApplication {
                app_name: registration.app_name.clone(),
                strategies: Vec::new(),
                instances: Vec::new(),
            });
        application.strategies = registration.strategies.clone();

        let instance = ClientInstance {
            instance_id: registration.instance_id.clone(),
            sdk_version: registration.sdk_version.clone(),
            environment: registration.environment.clone(),
            started: registration.started,
            last_seen: registration.seen_at,
        };
        match application
            .instances
            .iter_mut()
            .find(|i| i.instance_id == registration.instance_id)
        {
            Some(existing) => *existing = instance,
            None => application.instances.push(instance),
        }
        Ok(())
    }

    async fn list_applications(&self) -> StoreResult<Vec<ClientApplication>> {
        Ok(self.state.read().await.applications.values().cloned().collect())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::tokens::token_models::TokenType;
    use crate::toggles::strategy::{Strategy, StrategyDefinition};

    fn key(feature: &str, environment: &str, hour: u32) -> HourlyKey {
        HourlyKey {
            feature_name: feature.to_string(),
            environment: environment.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let store = MemoryStore::new();
        let token =
            ApiToken::from_secret("default:development.abc", TokenType::Client, Utc::now()).unwrap();

        store.insert_token(&token).await.unwrap();
        assert!(matches!(
            store.insert_token(&token).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.get_token(&token.secret).await.unwrap(), Some(token.clone()));

        assert!(store.delete_token(&token.secret).await.unwrap());
        assert!(!store.delete_token(&token.secret).await.unwrap());
        assert_eq!(store.get_token(&token.secret).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_toggles_keep_insertion_order() {
        let store = MemoryStore::new();
        for (name, project) in [("zeta", "a"), ("alpha", "b"), ("mid", "a")] {
            store
                .create_toggle(&FeatureToggle::new(name, project, Utc::now()))
                .await
                .unwrap();
        }

        let all = store.list_toggles(&ProjectAccess::All).await.unwrap();
        let names: Vec<_> = all.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);

        let only_a = store
            .list_toggles(&ProjectAccess::from_projects(["a"]))
            .await
            .unwrap();
        let names: Vec<_> = only_a.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "mid"]);

        assert!(matches!(
            store
                .create_toggle(&FeatureToggle::new("zeta", "other", Utc::now()))
                .await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_strategies_attach_and_detach() {
        let store = MemoryStore::new();
        store
            .create_toggle(&FeatureToggle::new("toggle", "default", Utc::now()))
            .await
            .unwrap();

        let strategy = FeatureStrategy::from_definition(
            Uuid::now_v7(),
            StrategyDefinition {
                name: "default".to_string(),
                parameters: Default::default(),
                constraints: vec![],
            },
        )
        .unwrap();
        store
            .add_strategy("toggle", "production", &strategy)
            .await
            .unwrap();
        store
            .set_environment_enabled("toggle", "production", true)
            .await
            .unwrap();

        let toggle = store.get_toggle("toggle").await.unwrap().unwrap();
        let production = toggle.environment("production").unwrap();
        assert!(production.enabled);
        assert_eq!(production.strategies[0].strategy, Strategy::Default);

        assert!(store
            .remove_strategy("toggle", "production", strategy.id)
            .await
            .unwrap());
        assert!(!store
            .remove_strategy("toggle", "development", strategy.id)
            .await
            .unwrap());

        assert!(matches!(
            store.set_environment_enabled("missing", "production", true).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_archive_is_one_way() {
        let store = MemoryStore::new();
        store
            .create_toggle(&FeatureToggle::new("toggle", "default", Utc::now()))
            .await
            .unwrap();
        assert!(store.archive_toggle("toggle").await.unwrap());
        assert!(!store.archive_toggle("toggle").await.unwrap());
        assert!(!store.archive_toggle("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_hourly_increments_are_additive() {
        let store = MemoryStore::new();
        store
            .increment_hourly(&key("toggle", "production", 10), ToggleCounts { yes: 1, no: 10 })
            .await
            .unwrap();
        store
            .increment_hourly(&key("toggle", "production", 10), ToggleCounts { yes: 2, no: 20 })
            .await
            .unwrap();
        store
            .increment_hourly(&key("toggle", "development", 9), ToggleCounts { yes: 5, no: 0 })
            .await
            .unwrap();

        let usage = store
            .hourly_usage("toggle", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].environment, "development");
        assert_eq!((usage[1].yes, usage[1].no), (3, 30));

        let recent = store
            .hourly_usage("toggle", Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_seen_applications_are_a_set() {
        let store = MemoryStore::new();
        for app in ["web", "ios", "web"] {
            store.add_seen_application("toggle", app).await.unwrap();
        }
        assert_eq!(
            store.seen_applications("toggle").await.unwrap(),
            vec!["ios".to_string(), "web".to_string()]
        );
        assert!(store.seen_applications("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registrations_upsert_instances() {
        let store = MemoryStore::new();
        let registration = ClientRegistration {
            app_name: "web".to_string(),
            instance_id: "i-1".to_string(),
            sdk_version: Some("unleash-client-rust:0.1".to_string()),
            environment: "development".to_string(),
            interval: 10_000,
            started: Utc::now(),
            strategies: vec!["default".to_string()],
            seen_at: Utc::now(),
        };
        store.upsert_registration(&registration).await.unwrap();
        store
            .upsert_registration(&ClientRegistration {
                strategies: vec!["default".to_string(), "flexibleRollout".to_string()],
                ..registration.clone()
            })
            .await
            .unwrap();
        store
            .upsert_registration(&ClientRegistration {
                instance_id: "i-2".to_string(),
                ..registration
            })
            .await
            .unwrap();

        let applications = store.list_applications().await.unwrap();
        assert_eq!(applications.len(), 1);
        assert_eq!(applications[0].instances.len(), 2);
        assert_eq!(
            applications[0].strategies,
            vec!["default".to_string()]
        );
    }
}
