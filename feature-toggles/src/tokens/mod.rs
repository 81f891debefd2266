pub mod token_models;
pub mod token_resolver;
