use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "dingbot.toml",
    "dingbot.yaml",
    "dingbot.yml",
    "dingbot.json",
];

/// Load a config file (any supported format) with env substitution applied,
/// as a JSON value tree.
pub fn load_config_value(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config_value(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./dingbot.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/dingbot/dingbot.{toml,yaml,yml,json}` (user-global)
///
/// Returns `Value::Null` with no path when no config file exists.
pub fn discover_and_load() -> Result<(Option<PathBuf>, serde_json::Value)> {
    match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            let value = load_config_value(&path)?;
            Ok((Some(path), value))
        },
        None => {
            debug!("no config file found, using defaults");
            Ok((None, serde_json::Value::Null))
        },
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    find_in(Path::new(".")).or_else(|| config_dir().and_then(|dir| find_in(&dir)))
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/dingbot/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "dingbot").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dingbot.toml")
}

/// Write a config tree to `path` in the format its extension names.
///
/// Creates parent directories if needed.
pub fn save_config_value(path: &Path, value: &serde_json::Value) -> Result<()> {
    let write_err = |source| Error::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = serialize_config_value(value, path)?;
    std::fs::write(path, raw).map_err(write_err)?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("toml")
}

fn parse_config_value(raw: &str, path: &Path) -> Result<serde_json::Value> {
    match extension(path) {
        "toml" => {
            let v: toml::Value = toml::from_str(raw).map_err(|e| Error::parse(path, e))?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value =
                serde_yaml::from_str(raw).map_err(|e| Error::parse(path, e))?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => serde_json::from_str(raw).map_err(|e| Error::parse(path, e)),
        ext => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}

fn serialize_config_value(value: &serde_json::Value, path: &Path) -> Result<String> {
    let serialize_err = |e: &dyn std::fmt::Display| Error::Serialize {
        message: e.to_string(),
    };
    match extension(path) {
        "toml" => toml::to_string_pretty(value).map_err(|e| serialize_err(&e)),
        "yaml" | "yml" => serde_yaml::to_string(value).map_err(|e| serialize_err(&e)),
        "json" => serde_json::to_string_pretty(value).map_err(|e| serialize_err(&e)),
        ext => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_env_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dingbot.toml");
        std::fs::write(
            &path,
            r#"
[channels.dingtalk]
appKey = "ding123"
appSecret = "${DINGBOT_TEST_UNSET_SECRET:-s3cret}"
requireMention = false
"#,
        )
        .unwrap();
        let value = load_config_value(&path).unwrap();
        assert_eq!(value["channels"]["dingtalk"]["appKey"], "ding123");
        assert_eq!(value["channels"]["dingtalk"]["appSecret"], "s3cret");
        assert_eq!(value["channels"]["dingtalk"]["requireMention"], false);
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dingbot.yaml");
        std::fs::write(
            &path,
            "channels:\n  dingtalk:\n    accounts:\n      ops:\n        appKey: k\n",
        )
        .unwrap();
        let value = load_config_value(&path).unwrap();
        assert_eq!(value["channels"]["dingtalk"]["accounts"]["ops"]["appKey"], "k");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dingbot.ini");
        std::fs::write(&path, "a=b").unwrap();
        assert!(matches!(
            load_config_value(&path),
            Err(Error::UnsupportedFormat { extension }) if extension == "ini"
        ));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dingbot.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_value(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("dingbot.json"));
    }

    #[test]
    fn save_then_load_preserves_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dingbot.toml");
        let value = serde_json::json!({
            "channels": { "dingtalk": { "appKey": "k", "allowFrom": ["u1"] } },
        });
        save_config_value(&path, &value).unwrap();
        assert_eq!(load_config_value(&path).unwrap(), value);
    }
}
