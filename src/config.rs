//! JSON-schema-shaped configuration loading: `conf.json`, and per-plugin
//! main/device config files. Creates defaults on first run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ConfigError;

fn default_port() -> u16 {
    5040
}

fn default_log_size() -> u64 {
    1 << 20
}

fn default_log_count() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfSection {
    pub uin: u32,
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_log_size")]
    pub size: u64,
    #[serde(default = "default_log_count")]
    pub count: u32,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            path: None,
            size: default_log_size(),
            count: default_log_count(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "self")]
    pub self_: SelfSection,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
}

impl Config {
    fn default_for(hostname: &str) -> Self {
        Self {
            self_: SelfSection {
                uin: rand::random::<u32>() & 0x0FFF_FFFF | 1,
                name: hostname.to_string(),
                password: String::new(),
            },
            port: default_port(),
            log: LogSection::default(),
            pidfile: None,
        }
    }

    /// Load `conf.json` from `config_dir`, creating a default file (with a
    /// freshly generated UIN and hostname-derived name) if it doesn't exist.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join("conf.json");
        if !path.exists() {
            fs::create_dir_all(config_dir).map_err(|e| ConfigError::Io {
                path: config_dir.display().to_string(),
                source: e,
            })?;
            let hostname = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "dcnnt-host".to_string());
            let default = Self::default_for(&hostname);
            let contents =
                serde_json::to_string_pretty(&default).map_err(|e| ConfigError::Malformed {
                    path: path.display().to_string(),
                    source: e,
                })?;
            fs::write(&path, contents).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            return Ok(default);
        }
        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Malformed {
                path: path.display().to_string(),
                source: e,
            })?;
        if config.self_.name.is_empty() || config.self_.name.len() > 60 {
            return Err(ConfigError::MissingField("self.name".to_string()));
        }
        if config.self_.uin == 0 {
            return Err(ConfigError::MissingField("self.uin".to_string()));
        }
        Ok(config)
    }

    pub fn doc() -> &'static str {
        "conf.json schema:\n\
         {\n\
         \x20 \"self\": { \"uin\": <1..2^28-1>, \"name\": <1..60 chars>, \"password\": <string> },\n\
         \x20 \"port\": <u16, default 5040>,\n\
         \x20 \"log\": { \"path\": <string|null>, \"size\": <bytes, default 1048576>, \"count\": <default 3>, \"level\": <string, default \"info\"> },\n\
         \x20 \"pidfile\": <string|null>\n\
         }"
    }
}

/// Load a plugin's main configuration file (`plugins/{mark}.conf.json`),
/// writing `T::default()` if the file doesn't exist yet.
pub fn load_plugin_config<T>(plugins_dir: &Path, mark: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Serialize + Default,
{
    let path = plugins_dir.join(format!("{}.conf.json", mark));
    load_or_default(&path)
}

/// Load a plugin's per-device configuration override
/// (`plugins/{uin}.{mark}.conf.json`), returning `None` if absent.
pub fn load_device_plugin_config<T>(
    plugins_dir: &Path,
    uin: u32,
    mark: &str,
) -> Result<Option<T>, ConfigError>
where
    T: DeserializeOwned,
{
    let path = plugins_dir.join(format!("{}.{}.conf.json", uin, mark));
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let value = serde_json::from_str(&contents).map_err(|e| ConfigError::Malformed {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(Some(value))
}

fn load_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Serialize + Default,
{
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let default = T::default();
        let contents =
            serde_json::to_string_pretty(&default).map_err(|e| ConfigError::Malformed {
                path: path.display().to_string(),
                source: e,
            })?;
        fs::write(path, contents).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        return Ok(default);
    }
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::Malformed {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_creates_default_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.port, 5040);
        assert!(dir.path().join("conf.json").exists());
    }

    #[test]
    fn load_reads_back_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let uin = config.self_.uin;
        let reloaded = Config::load(dir.path()).unwrap();
        assert_eq!(reloaded.self_.uin, uin);
    }
}
