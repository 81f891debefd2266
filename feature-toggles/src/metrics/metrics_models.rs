use std::collections::BTreeMap;
use std::ops::AddAssign;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

pub const USAGE_MATURITY: &str = "stable";
pub const USAGE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToggleCounts {
    #[serde(default)]
    pub yes: u64,
    #[serde(default)]
    pub no: u64,
}

impl ToggleCounts {
    pub fn is_empty(&self) -> bool {
        self.yes == 0 && self.no == 0
    }
}

impl AddAssign for ToggleCounts {
    fn add_assign(&mut self, other: Self) {
        self.yes = self.yes.saturating_add(other.yes);
        self.no = self.no.saturating_add(other.no);
    }
}

/// A time window of evaluation counts reported by one SDK instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsBucket {
    pub app_name: String,
    pub instance_id: String,
    pub environment: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub toggles: BTreeMap<String, ToggleCounts>,
}

/// Identifies one hourly aggregate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourlyKey {
    pub feature_name: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HourlyUsage {
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    pub yes: u64,
    pub no: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureUsage {
    pub feature_name: String,
    pub last_hour_usage: Vec<HourlyUsage>,
    pub maturity: String,
    pub seen_applications: Vec<String>,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub app_name: String,
    pub instance_id: String,
    pub sdk_version: Option<String>,
    pub environment: String,
    pub interval: u64,
    pub started: DateTime<Utc>,
    pub strategies: Vec<String>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInstance {
    pub instance_id: String,
    pub sdk_version: Option<String>,
    pub environment: String,
    pub started: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientApplication {
    pub app_name: String,
    pub strategies: Vec<String>,
    pub instances: Vec<ClientInstance>,
}

/// Truncates a timestamp to the start of its hour.
pub fn hour_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    // Truncating to whole hours cannot overflow for any representable timestamp.
    timestamp
        .duration_trunc(Duration::hours(1))
        .unwrap_or(timestamp)
}
