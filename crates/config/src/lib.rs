//! Configuration schema and discovery for the gateway.
//!
//! Supported formats: `tradeclaw.toml`, `tradeclaw.yaml` / `.yml`,
//! `tradeclaw.json`. `${ENV_VAR}` placeholders are substituted before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config},
    schema::TradeclawConfig,
};
