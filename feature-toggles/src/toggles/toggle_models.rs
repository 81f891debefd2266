use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::toggles::constraint::DefinitionError;
use crate::toggles::context::EvaluationContext;
use crate::toggles::hashing::normalized_hash;
use crate::toggles::strategy::{FeatureStrategy, Stickiness};

pub const MAX_VARIANT_WEIGHT: u32 = 1000;
pub const DISABLED_VARIANT: &str = "disabled";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VariantPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickiness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<VariantPayload>,
}

/// The variant handed to a frontend SDK alongside an enabled toggle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VariantResult {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<VariantPayload>,
}

impl VariantResult {
    pub fn disabled() -> Self {
        VariantResult {
            name: DISABLED_VARIANT.to_string(),
            enabled: false,
            payload: None,
        }
    }
}

pub fn validate_variants(variants: &[Variant]) -> Result<(), DefinitionError> {
    match variants.iter().find(|v| v.weight > MAX_VARIANT_WEIGHT) {
        Some(variant) => Err(DefinitionError::InvalidVariantWeight(variant.name.clone())),
        None => Ok(()),
    }
}

/// Picks the variant whose cumulative weight bucket holds the context's sticky hash.
pub fn select_variant(
    toggle_name: &str,
    variants: &[Variant],
    context: &EvaluationContext,
) -> VariantResult {
    let total_weight: u32 = variants.iter().map(|v| v.weight).sum();
    if total_weight == 0 {
        return VariantResult::disabled();
    }

    let stickiness = variants
        .iter()
        .find_map(|v| v.stickiness.as_deref())
        .map(Stickiness::parse)
        .unwrap_or(Stickiness::Default);
    let Some(identifier) = stickiness.identifier(context) else {
        return VariantResult::disabled();
    };

    let target = normalized_hash(toggle_name, &identifier, total_weight);
    let mut counter = 0;
    for variant in variants {
        if variant.weight == 0 {
            continue;
        }
        counter += variant.weight;
        if counter >= target {
            return VariantResult {
                name: variant.name.clone(),
                enabled: true,
                payload: variant.payload.clone(),
            };
        }
    }
    VariantResult::disabled()
}

/// The enabled flag and the strategies of a toggle in one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEnvironment {
    pub name: String,
    pub enabled: bool,
    pub strategies: Vec<FeatureStrategy>,
}

impl FeatureEnvironment {
    pub fn new(name: &str) -> Self {
        FeatureEnvironment {
            name: name.to_string(),
            enabled: false,
            strategies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureToggle {
    pub name: String,
    pub project: String,
    pub description: Option<String>,
    pub impression_data: bool,
    pub variants: Vec<Variant>,
    pub environments: Vec<FeatureEnvironment>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl FeatureToggle {
    pub fn new(name: &str, project: &str, created_at: DateTime<Utc>) -> Self {
        FeatureToggle {
            name: name.to_string(),
            project: project.to_string(),
            description: None,
            impression_data: false,
            variants: Vec::new(),
            environments: Vec::new(),
            archived: false,
            created_at,
        }
    }

    pub fn environment(&self, name: &str) -> Option<&FeatureEnvironment> {
        self.environments.iter().find(|env| env.name == name)
    }

    pub fn environment_mut(&mut self, name: &str) -> &mut FeatureEnvironment {
        let index = match self.environments.iter().position(|env| env.name == name) {
            Some(index) => index,
            None => {
                self.environments.push(FeatureEnvironment::new(name));
                self.environments.len() - 1
            }
        };
        &mut self.environments[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(name: &str, weight: u32) -> Variant {
        Variant {
            name: name.to_string(),
            weight,
            stickiness: Some("userId".to_string()),
            payload: None,
        }
    }

    #[test]
    fn test_no_variants_gives_disabled_variant() {
        let result = select_variant("toggle", &[], &EvaluationContext::default());
        assert_eq!(result, VariantResult::disabled());
    }

    #[test]
    fn test_single_variant_always_wins() {
        let context = EvaluationContext {
            user_id: Some("42".to_string()),
            ..Default::default()
        };
        let mut only = variant("blue", 1000);
        only.payload = Some(VariantPayload {
            payload_type: "string".to_string(),
            value: "navy".to_string(),
        });
        let result = select_variant("toggle", &[only], &context);
        assert_eq!(result.name, "blue");
        assert!(result.enabled);
        assert_eq!(result.payload.unwrap().value, "navy");
    }

    #[test]
    fn test_variants_split_by_weight() {
        let variants = vec![variant("a", 500), variant("zero", 0), variant("b", 500)];
        let mut seen_a = 0;
        for i in 0..1000 {
            let context = EvaluationContext {
                user_id: Some(i.to_string()),
                ..Default::default()
            };
            let result = select_variant("toggle", &variants, &context);
            assert_ne!(result.name, "zero");
            if result.name == "a" {
                seen_a += 1;
            }
        }
        assert!((400..600).contains(&seen_a), "got {seen_a}");
    }

    #[test]
    fn test_missing_sticky_field_gives_disabled_variant() {
        let result = select_variant("toggle", &[variant("a", 1000)], &EvaluationContext::default());
        assert_eq!(result, VariantResult::disabled());
    }

    #[test]
    fn test_variant_weight_is_bounded() {
        assert!(validate_variants(&[variant("a", 1000)]).is_ok());
        assert_eq!(
            validate_variants(&[variant("a", 1001)]),
            Err(DefinitionError::InvalidVariantWeight("a".to_string()))
        );
    }

    #[test]
    fn test_environment_mut_creates_disabled_environment() {
        let mut toggle = FeatureToggle::new("toggle", "default", Utc::now());
        toggle.environment_mut("production").enabled = true;
        toggle.environment_mut("development");
        assert_eq!(toggle.environments.len(), 2);
        assert!(toggle.environment("production").unwrap().enabled);
        assert!(!toggle.environment("development").unwrap().enabled);
        assert!(toggle.environment("staging").is_none());
    }
}
