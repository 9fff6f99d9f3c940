use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::TradeclawConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "tradeclaw.toml",
    "tradeclaw.yaml",
    "tradeclaw.yml",
    "tradeclaw.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<TradeclawConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let config = parse_config(&raw, path)?;
    config.validate()?;
    Ok(config)
}

/// Discover and load config.
///
/// Search order:
/// 1. `explicit` when given (errors are returned, not swallowed)
/// 2. `./tradeclaw.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/tradeclaw/tradeclaw.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `TradeclawConfig::default()` when nothing is found or a
/// discovered file fails to load.
pub fn discover_and_load(explicit: Option<&Path>) -> anyhow::Result<TradeclawConfig> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading explicit config");
        return load_config(path);
    }

    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return Ok(TradeclawConfig::default());
    };

    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            Ok(TradeclawConfig::default())
        },
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns `~/.config/tradeclaw/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("tradeclaw"))
}

/// Returns the data directory: `~/.tradeclaw/` on all platforms.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".tradeclaw"))
        .unwrap_or_else(|| PathBuf::from(".tradeclaw"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<TradeclawConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
