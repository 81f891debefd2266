pub mod aggregator;
pub mod metrics_models;
pub mod registry;
