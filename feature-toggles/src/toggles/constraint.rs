use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::toggles::context::EvaluationContext;

/// Rejections raised while validating strategy and constraint definitions.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("constraint is missing a context name")]
    MissingContextName,
    #[error("{0} is not a supported constraint operator")]
    UnknownOperator(String),
    #[error("operator {0} requires a value")]
    MissingValue(String),
    #[error("{0} is not a number")]
    InvalidNumber(String),
    #[error("{0} is not an RFC 3339 date")]
    InvalidDate(String),
    #[error("{0} is not a semantic version")]
    InvalidSemver(String),
    #[error("strategy is missing a name")]
    MissingStrategyName,
    #[error("parameter {parameter} of strategy {strategy} is invalid: {reason}")]
    InvalidParameter {
        strategy: String,
        parameter: String,
        reason: String,
    },
    #[error("variant {0} has a weight above 1000")]
    InvalidVariantWeight(String),
}

/// Constraint as it travels over the wire and is stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDefinition {
    pub context_name: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOperator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOperator {
    After,
    Before,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemverOperator {
    Eq,
    Gt,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintCheck {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    StrContains(Vec<String>),
    StrStartsWith(Vec<String>),
    StrEndsWith(Vec<String>),
    Numeric(NumericOperator, f64),
    Date(DateOperator, DateTime<Utc>),
    Semver(SemverOperator, Version),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub context_name: String,
    pub check: ConstraintCheck,
    pub inverted: bool,
    pub case_insensitive: bool,
}

impl Constraint {
    /// A missing context field fails the constraint, whatever the operator or inversion.
    pub fn is_satisfied(&self, context: &EvaluationContext) -> bool {
        let Some(value) = context.field(&self.context_name) else {
            return false;
        };
        self.check.matches(&value, self.case_insensitive) != self.inverted
    }

    pub fn to_definition(&self) -> ConstraintDefinition {
        let (operator, values, value) = match &self.check {
            ConstraintCheck::In(values) => ("IN", values.iter().cloned().collect(), None),
            ConstraintCheck::NotIn(values) => ("NOT_IN", values.iter().cloned().collect(), None),
            ConstraintCheck::StrContains(values) => ("STR_CONTAINS", values.clone(), None),
            ConstraintCheck::StrStartsWith(values) => ("STR_STARTS_WITH", values.clone(), None),
            ConstraintCheck::StrEndsWith(values) => ("STR_ENDS_WITH", values.clone(), None),
            ConstraintCheck::Numeric(op, number) => {
                let operator = match op {
                    NumericOperator::Eq => "NUM_EQ",
                    NumericOperator::Gt => "NUM_GT",
                    NumericOperator::Gte => "NUM_GTE",
                    NumericOperator::Lt => "NUM_LT",
                    NumericOperator::Lte => "NUM_LTE",
                };
                (operator, Vec::new(), Some(number.to_string()))
            }
            ConstraintCheck::Date(op, date) => {
                let operator = match op {
                    DateOperator::After => "DATE_AFTER",
                    DateOperator::Before => "DATE_BEFORE",
                };
                (
                    operator,
                    Vec::new(),
                    Some(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
                )
            }
            ConstraintCheck::Semver(op, version) => {
                let operator = match op {
                    SemverOperator::Eq => "SEMVER_EQ",
                    SemverOperator::Gt => "SEMVER_GT",
                    SemverOperator::Lt => "SEMVER_LT",
                };
                (operator, Vec::new(), Some(version.to_string()))
            }
        };
        ConstraintDefinition {
            context_name: self.context_name.clone(),
            operator: operator.to_string(),
            values,
            value,
            inverted: self.inverted,
            case_insensitive: self.case_insensitive,
        }
    }
}

impl ConstraintCheck {
    fn matches(&self, actual: &str, case_insensitive: bool) -> bool {
        let fold = |s: &str| {
            if case_insensitive {
                s.to_lowercase()
            } else {
                s.to_string()
            }
        };
        match self {
            ConstraintCheck::In(values) => values.contains(actual),
            ConstraintCheck::NotIn(values) => !values.contains(actual),
            ConstraintCheck::StrContains(values) => {
                let actual = fold(actual);
                values.iter().any(|v| actual.contains(&fold(v)))
            }
            ConstraintCheck::StrStartsWith(values) => {
                let actual = fold(actual);
                values.iter().any(|v| actual.starts_with(&fold(v)))
            }
            ConstraintCheck::StrEndsWith(values) => {
                let actual = fold(actual);
                values.iter().any(|v| actual.ends_with(&fold(v)))
            }
            ConstraintCheck::Numeric(op, expected) => match actual.trim().parse::<f64>() {
                Ok(actual) => match op {
                    NumericOperator::Eq => actual == *expected,
                    NumericOperator::Gt => actual > *expected,
                    NumericOperator::Gte => actual >= *expected,
                    NumericOperator::Lt => actual < *expected,
                    NumericOperator::Lte => actual <= *expected,
                },
                Err(_) => false,
            },
            ConstraintCheck::Date(op, expected) => match DateTime::parse_from_rfc3339(actual) {
                Ok(actual) => {
                    let actual = actual.with_timezone(&Utc);
                    match op {
                        DateOperator::After => actual > *expected,
                        DateOperator::Before => actual < *expected,
                    }
                }
                Err(_) => false,
            },
            ConstraintCheck::Semver(op, expected) => match Version::parse(actual.trim()) {
                Ok(actual) => match op {
                    SemverOperator::Eq => actual == *expected,
                    SemverOperator::Gt => actual > *expected,
                    SemverOperator::Lt => actual < *expected,
                },
                Err(_) => false,
            },
        }
    }
}

impl TryFrom<ConstraintDefinition> for Constraint {
    type Error = DefinitionError;

    fn try_from(definition: ConstraintDefinition) -> Result<Self, Self::Error> {
        if definition.context_name.trim().is_empty() {
            return Err(DefinitionError::MissingContextName);
        }

        let operator = definition.operator.to_uppercase();
        let single_value = || {
            definition
                .value
                .clone()
                .or_else(|| definition.values.first().cloned())
                .ok_or_else(|| DefinitionError::MissingValue(operator.clone()))
        };
        let number = || {
            let raw = single_value()?;
            match raw.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => Ok(number),
                _ => Err(DefinitionError::InvalidNumber(raw)),
            }
        };
        let date = || {
            let raw = single_value()?;
            DateTime::parse_from_rfc3339(&raw)
                .map(|date| date.with_timezone(&Utc))
                .map_err(|_| DefinitionError::InvalidDate(raw))
        };
        let version = || {
            let raw = single_value()?;
            Version::parse(raw.trim()).map_err(|_| DefinitionError::InvalidSemver(raw))
        };

        let check = match operator.as_str() {
            "IN" => ConstraintCheck::In(definition.values.iter().cloned().collect()),
            "NOT_IN" => ConstraintCheck::NotIn(definition.values.iter().cloned().collect()),
            "STR_CONTAINS" => ConstraintCheck::StrContains(definition.values.clone()),
            "STR_STARTS_WITH" => ConstraintCheck::StrStartsWith(definition.values.clone()),
            "STR_ENDS_WITH" => ConstraintCheck::StrEndsWith(definition.values.clone()),
            "NUM_EQ" => ConstraintCheck::Numeric(NumericOperator::Eq, number()?),
            "NUM_GT" => ConstraintCheck::Numeric(NumericOperator::Gt, number()?),
            "NUM_GTE" => ConstraintCheck::Numeric(NumericOperator::Gte, number()?),
            "NUM_LT" => ConstraintCheck::Numeric(NumericOperator::Lt, number()?),
            "NUM_LTE" => ConstraintCheck::Numeric(NumericOperator::Lte, number()?),
            "DATE_AFTER" => ConstraintCheck::Date(DateOperator::After, date()?),
            "DATE_BEFORE" => ConstraintCheck::Date(DateOperator::Before, date()?),
            "SEMVER_EQ" => ConstraintCheck::Semver(SemverOperator::Eq, version()?),
            "SEMVER_GT" => ConstraintCheck::Semver(SemverOperator::Gt, version()?),
            "SEMVER_LT" => ConstraintCheck::Semver(SemverOperator::Lt, version()?),
            _ => return Err(DefinitionError::UnknownOperator(definition.operator)),
        };

        Ok(Constraint {
            context_name: definition.context_name,
            check,
            inverted: definition.inverted,
            case_insensitive: definition.case_insensitive,
        })
    }
}
