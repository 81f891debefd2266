pub mod admin;
pub mod client;
pub mod errors;
pub mod frontend;
pub mod reporting;
pub mod types;
