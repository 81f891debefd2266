use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tracing::instrument;

use crate::metrics::metrics_models::{
    hour_start, FeatureUsage, HourlyKey, MetricsBucket, USAGE_MATURITY, USAGE_VERSION,
};
use crate::metrics_utils::{METRICS_BUCKETS_COUNTER, METRICS_ENTRIES_COUNTER};
use crate::store::{MetricsStore, StoreError};
use crate::time::TimeSource;

pub const DEFAULT_HOURS_BACK: u32 = 1;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("bucket stop {stop} precedes start {start}")]
    InvalidWindow { start: String, stop: String },
    #[error("hoursBack {0} reaches before the earliest representable time")]
    InvalidHoursBack(u32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Merges posted buckets into hourly aggregates and reads them back.
pub struct MetricsAggregator {
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn TimeSource + Send + Sync>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn MetricsStore>, clock: Arc<dyn TimeSource + Send + Sync>) -> Self {
        MetricsAggregator { store, clock }
    }

    /// Adds every non-empty entry of the bucket to the aggregate for its hour.
    /// Returns the number of entries merged.
    #[instrument(skip_all, fields(app_name = %bucket.app_name, environment = %bucket.environment))]
    pub async fn ingest(&self, bucket: &MetricsBucket) -> Result<usize, MetricsError> {
        if bucket.stop < bucket.start {
            return Err(MetricsError::InvalidWindow {
                start: bucket.start.to_rfc3339(),
                stop: bucket.stop.to_rfc3339(),
            });
        }

        let timestamp = hour_start(bucket.start);
        let mut merged = 0;
        for (feature_name, counts) in &bucket.toggles {
            if counts.is_empty() {
                continue;
            }
            let key = HourlyKey {
                feature_name: feature_name.clone(),
                environment: bucket.environment.clone(),
                timestamp,
            };
            self.store.increment_hourly(&key, *counts).await?;
            self.store
                .add_seen_application(feature_name, &bucket.app_name)
                .await?;
            merged += 1;
        }

        metrics::counter!(METRICS_BUCKETS_COUNTER).increment(1);
        metrics::counter!(METRICS_ENTRIES_COUNTER).increment(merged as u64);
        tracing::debug!(merged, "ingested metrics bucket");
        Ok(merged)
    }

    /// Usage of one feature for the hours starting at or after `hours_back` hours ago.
    #[instrument(skip(self))]
    pub async fn feature_usage(
        &self,
        feature_name: &str,
        hours_back: u32,
    ) -> Result<FeatureUsage, MetricsError> {
        let since = self
            .clock
            .now()
            .checked_sub_signed(Duration::hours(i64::from(hours_back)))
            .map(hour_start)
            .ok_or(MetricsError::InvalidHoursBack(hours_back))?;
        let last_hour_usage = self.store.hourly_usage(feature_name, since).await?;
        let seen_applications = self.store.seen_applications(feature_name).await?;

        Ok(FeatureUsage {
            feature_name: feature_name.to_string(),
            last_hour_usage,
            maturity: USAGE_MATURITY.to_string(),
            seen_applications,
            version: USAGE_VERSION,
        })
    }
}
