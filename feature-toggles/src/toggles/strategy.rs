use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::toggles::constraint::{Constraint, ConstraintDefinition, DefinitionError};
use crate::toggles::context::EvaluationContext;
use crate::toggles::hashing::normalized_hash;

pub const DEFAULT_STRATEGY: &str = "default";
pub const FLEXIBLE_ROLLOUT_STRATEGY: &str = "flexibleRollout";
pub const USER_WITH_ID_STRATEGY: &str = "userWithId";
pub const REMOTE_ADDRESS_STRATEGY: &str = "remoteAddress";

/// Strategy as it travels over the wire and is stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "parameters_as_strings")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDefinition>,
}

/// SDKs send parameters as strings, numbers or booleans, we keep them all as strings.
fn parameters_as_strings<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Ok((key, s)),
            serde_json::Value::Number(n) => Ok((key, n.to_string())),
            serde_json::Value::Bool(b) => Ok((key, b.to_string())),
            serde_json::Value::Null => Ok((key, String::new())),
            other => Err(serde::de::Error::custom(format!(
                "parameter {key} must be a scalar, got {other}"
            ))),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stickiness {
    Default,
    UserId,
    SessionId,
    Random,
    Custom(String),
}

impl Stickiness {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | "default" => Stickiness::Default,
            "userId" => Stickiness::UserId,
            "sessionId" => Stickiness::SessionId,
            "random" => Stickiness::Random,
            other => Stickiness::Custom(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Stickiness::Default => "default",
            Stickiness::UserId => "userId",
            Stickiness::SessionId => "sessionId",
            Stickiness::Random => "random",
            Stickiness::Custom(field) => field,
        }
    }

    /// The value a sticky hash is computed from, `None` when the context lacks it.
    pub fn identifier(&self, context: &EvaluationContext) -> Option<String> {
        match self {
            Stickiness::Default => context
                .user_id
                .clone()
                .or_else(|| context.session_id.clone())
                .or_else(|| Some(random_identifier())),
            Stickiness::UserId => context.user_id.clone(),
            Stickiness::SessionId => context.session_id.clone(),
            Stickiness::Random => Some(random_identifier()),
            Stickiness::Custom(field) => context.field(field).map(|v| v.into_owned()),
        }
    }
}

fn random_identifier() -> String {
    rand::thread_rng().gen::<u32>().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    network: IpAddr,
    prefix: u8,
}

impl AddressRange {
    fn parse(raw: &str) -> Option<Self> {
        let (address, prefix) = match raw.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix.parse::<u8>().ok()?)),
            None => (raw, None),
        };
        let network: IpAddr = address.parse().ok()?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max_prefix);
        (prefix <= max_prefix).then_some(AddressRange { network, prefix })
    }

    fn contains(&self, address: &IpAddr) -> bool {
        match (self.network, address) {
            (IpAddr::V4(network), IpAddr::V4(address)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(network) & mask == u32::from(*address) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(address)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(network) & mask == u128::from(*address) & mask
            }
            _ => false,
        }
    }

    fn render(&self) -> String {
        let max_prefix = if self.network.is_ipv4() { 32 } else { 128 };
        if self.prefix == max_prefix {
            self.network.to_string()
        } else {
            format!("{}/{}", self.network, self.prefix)
        }
    }
}

/// A strategy with its parameters validated into the shape its algorithm needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Default,
    FlexibleRollout {
        rollout: u8,
        stickiness: Stickiness,
        group_id: Option<String>,
    },
    UserWithId {
        user_ids: BTreeSet<String>,
    },
    RemoteAddress {
        ranges: Vec<AddressRange>,
    },
    /// A strategy this service has no algorithm for. Only its constraints gate it.
    Unknown {
        name: String,
        parameters: BTreeMap<String, String>,
    },
}

impl Strategy {
    pub fn name(&self) -> &str {
        match self {
            Strategy::Default => DEFAULT_STRATEGY,
            Strategy::FlexibleRollout { .. } => FLEXIBLE_ROLLOUT_STRATEGY,
            Strategy::UserWithId { .. } => USER_WITH_ID_STRATEGY,
            Strategy::RemoteAddress { .. } => REMOTE_ADDRESS_STRATEGY,
            Strategy::Unknown { name, .. } => name,
        }
    }

    pub fn parse(
        name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Strategy, DefinitionError> {
        let invalid = |parameter: &str, reason: &str| DefinitionError::InvalidParameter {
            strategy: name.to_string(),
            parameter: parameter.to_string(),
            reason: reason.to_string(),
        };
        let list = |parameter: &str| -> Vec<String> {
            parameters
                .get(parameter)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        match name {
            "" => Err(DefinitionError::MissingStrategyName),
            DEFAULT_STRATEGY => Ok(Strategy::Default),
            FLEXIBLE_ROLLOUT_STRATEGY => {
                let raw = parameters
                    .get("rollout")
                    .ok_or_else(|| invalid("rollout", "missing"))?;
                let rollout = raw
                    .trim()
                    .parse::<u8>()
                    .ok()
                    .filter(|rollout| *rollout <= 100)
                    .ok_or_else(|| invalid("rollout", "must be an integer between 0 and 100"))?;
                let stickiness = Stickiness::parse(
                    parameters.get("stickiness").map(String::as_str).unwrap_or(""),
                );
                let group_id = parameters
                    .get("groupId")
                    .filter(|group| !group.is_empty())
                    .cloned();
                Ok(Strategy::FlexibleRollout {
                    rollout,
                    stickiness,
                    group_id,
                })
            }
            USER_WITH_ID_STRATEGY => Ok(Strategy::UserWithId {
                user_ids: list("userIds").into_iter().collect(),
            }),
            REMOTE_ADDRESS_STRATEGY => {
                let ranges = list("IPs")
                    .iter()
                    .map(|raw| {
                        AddressRange::parse(raw)
                            .ok_or_else(|| invalid("IPs", &format!("{raw} is not an address")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Strategy::RemoteAddress { ranges })
            }
            other => Ok(Strategy::Unknown {
                name: other.to_string(),
                parameters: parameters.clone(),
            }),
        }
    }

    pub fn parameters(&self) -> BTreeMap<String, String> {
        match self {
            Strategy::Default => BTreeMap::new(),
            Strategy::FlexibleRollout {
                rollout,
                stickiness,
                group_id,
            } => {
                let mut parameters = BTreeMap::from([
                    ("rollout".to_string(), rollout.to_string()),
                    ("stickiness".to_string(), stickiness.as_str().to_string()),
                ]);
                if let Some(group_id) = group_id {
                    parameters.insert("groupId".to_string(), group_id.clone());
                }
                parameters
            }
            Strategy::UserWithId { user_ids } => BTreeMap::from([(
                "userIds".to_string(),
                user_ids.iter().cloned().collect::<Vec<_>>().join(","),
            )]),
            Strategy::RemoteAddress { ranges } => BTreeMap::from([(
                "IPs".to_string(),
                ranges
                    .iter()
                    .map(AddressRange::render)
                    .collect::<Vec<_>>()
                    .join(","),
            )]),
            Strategy::Unknown { parameters, .. } => parameters.clone(),
        }
    }

    /// Runs the strategy's own algorithm. Constraints are checked separately.
    pub fn is_enabled(&self, toggle_name: &str, context: &EvaluationContext) -> bool {
        match self {
            Strategy::Default => true,
            Strategy::FlexibleRollout {
                rollout,
                stickiness,
                group_id,
            } => {
                if *rollout == 0 {
                    return false;
                }
                let group = group_id.as_deref().unwrap_or(toggle_name);
                match stickiness.identifier(context) {
                    Some(identifier) => {
                        normalized_hash(group, &identifier, 100) <= u32::from(*rollout)
                    }
                    None => false,
                }
            }
            Strategy::UserWithId { user_ids } => context
                .user_id
                .as_ref()
                .is_some_and(|user_id| user_ids.contains(user_id)),
            Strategy::RemoteAddress { ranges } => context
                .remote_address
                .as_deref()
                .and_then(|raw| raw.trim().parse::<IpAddr>().ok())
                .is_some_and(|address| ranges.iter().any(|range| range.contains(&address))),
            Strategy::Unknown { .. } => true,
        }
    }
}

/// A strategy attached to one environment of a toggle.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStrategy {
    pub id: Uuid,
    pub strategy: Strategy,
    pub constraints: Vec<Constraint>,
}

impl FeatureStrategy {
    pub fn from_definition(
        id: Uuid,
        definition: StrategyDefinition,
    ) -> Result<FeatureStrategy, DefinitionError> {
        let strategy = Strategy::parse(definition.name.trim(), &definition.parameters)?;
        let constraints = definition
            .constraints
            .into_iter()
            .map(Constraint::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureStrategy {
            id,
            strategy,
            constraints,
        })
    }

    pub fn to_definition(&self) -> StrategyDefinition {
        StrategyDefinition {
            name: self.strategy.name().to_string(),
            parameters: self.strategy.parameters(),
            constraints: self
                .constraints
                .iter()
                .map(Constraint::to_definition)
                .collect(),
        }
    }

    /// AND across constraints, then the strategy's own algorithm.
    pub fn is_enabled(&self, toggle_name: &str, context: &EvaluationContext) -> bool {
        self.constraints
            .iter()
            .all(|constraint| constraint.is_satisfied(context))
            && self.strategy.is_enabled(toggle_name, context)
    }
}
