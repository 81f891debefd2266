pub mod api;
pub mod config;
pub mod metrics;
pub mod metrics_utils;
pub mod router;
pub mod server;
pub mod store;
pub mod time;
pub mod toggles;
pub mod tokens;

// Shared by unit tests and the integration tests under tests/.
pub mod test_utils;
