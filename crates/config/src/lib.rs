//! Configuration loading and env substitution.
//!
//! Config files: `dingbot.toml`, `dingbot.yaml`, `dingbot.yml` or
//! `dingbot.json`, searched in `./` then `~/.config/dingbot/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in the raw
//! file text.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, discover_and_load, find_or_default_config_path, load_config_value,
        save_config_value,
    },
    schema::{ChannelsConfig, DingbotConfig, LoggingConfig},
};
