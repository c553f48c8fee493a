pub mod api;
pub mod collection;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod observability;
pub mod staging;
pub mod storage;
pub mod types;
pub mod utils;

// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "LINE_INFRA";
