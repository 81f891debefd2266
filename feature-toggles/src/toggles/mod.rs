pub mod constraint;
pub mod context;
pub mod hashing;
pub mod strategy;
pub mod toggle_filter;
pub mod toggle_models;
