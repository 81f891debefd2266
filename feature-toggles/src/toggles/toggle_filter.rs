use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::store::{StoreError, ToggleStore};
use crate::tokens::token_models::TokenScope;
use crate::toggles::context::EvaluationContext;
use crate::toggles::strategy::{FeatureStrategy, StrategyDefinition};
use crate::toggles::toggle_models::{select_variant, FeatureToggle, Variant, VariantResult};

/// Environment used for definitions when a token is not bound to one.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// A toggle that evaluated to on for the request, as frontend SDKs see it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedToggle {
    pub name: String,
    pub enabled: bool,
    pub impression_data: bool,
    pub variant: VariantResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyView {
    pub id: Uuid,
    #[serde(flatten)]
    pub definition: StrategyDefinition,
}

impl From<&FeatureStrategy> for StrategyView {
    fn from(strategy: &FeatureStrategy) -> Self {
        StrategyView {
            id: strategy.id,
            definition: strategy.to_definition(),
        }
    }
}

/// A toggle definition for one environment, as server-side SDKs see it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFeature {
    pub name: String,
    pub project: String,
    pub enabled: bool,
    pub impression_data: bool,
    pub strategies: Vec<StrategyView>,
    pub variants: Vec<Variant>,
}

/// Evaluates toggles against a token scope and a request context, keeping input order.
pub fn filter_toggles(
    toggles: &[FeatureToggle],
    scope: &TokenScope,
    context: &EvaluationContext,
) -> Vec<EvaluatedToggle> {
    toggles
        .iter()
        .filter_map(|toggle| evaluate_toggle(toggle, scope, context))
        .collect()
}

fn evaluate_toggle(
    toggle: &FeatureToggle,
    scope: &TokenScope,
    context: &EvaluationContext,
) -> Option<EvaluatedToggle> {
    if toggle.archived || !scope.projects.allows(&toggle.project) {
        return None;
    }

    toggle
        .environments
        .iter()
        .filter(|environment| environment.enabled && scope.environment.allows(&environment.name))
        .find_map(|environment| {
            let context = context.clone().with_environment(&environment.name);
            // OR across strategies, zero strategies means off.
            let on = environment
                .strategies
                .iter()
                .any(|strategy| strategy.is_enabled(&toggle.name, &context));
            on.then(|| EvaluatedToggle {
                name: toggle.name.clone(),
                enabled: true,
                impression_data: toggle.impression_data,
                variant: select_variant(&toggle.name, &toggle.variants, &context),
            })
        })
}

/// Toggle definitions in scope for one environment. Archived toggles are left out.
pub fn client_features(toggles: &[FeatureToggle], scope: &TokenScope) -> Vec<ClientFeature> {
    let environment = scope
        .environment
        .concrete()
        .unwrap_or(DEFAULT_ENVIRONMENT);

    toggles
        .iter()
        .filter(|toggle| !toggle.archived && scope.projects.allows(&toggle.project))
        .map(|toggle| {
            let feature_environment = toggle.environment(environment);
            ClientFeature {
                name: toggle.name.clone(),
                project: toggle.project.clone(),
                enabled: feature_environment.is_some_and(|env| env.enabled),
                impression_data: toggle.impression_data,
                strategies: feature_environment
                    .map(|env| env.strategies.iter().map(StrategyView::from).collect())
                    .unwrap_or_default(),
                variants: toggle.variants.clone(),
            }
        })
        .collect()
}

pub struct ToggleFilter {
    store: Arc<dyn ToggleStore>,
}

impl ToggleFilter {
    pub fn new(store: Arc<dyn ToggleStore>) -> Self {
        ToggleFilter { store }
    }

    #[instrument(skip_all)]
    pub async fn visible_toggles(
        &self,
        scope: &TokenScope,
        context: &EvaluationContext,
    ) -> Result<Vec<EvaluatedToggle>, StoreError> {
        let toggles = self.store.list_toggles(&scope.projects).await?;
        let visible = filter_toggles(&toggles, scope, context);
        tracing::debug!(
            candidates = toggles.len(),
            visible = visible.len(),
            "filtered toggles"
        );
        Ok(visible)
    }

    #[instrument(skip_all)]
    pub async fn definitions(&self, scope: &TokenScope) -> Result<Vec<ClientFeature>, StoreError> {
        let toggles = self.store.list_toggles(&scope.projects).await?;
        Ok(client_features(&toggles, scope))
    }
}
