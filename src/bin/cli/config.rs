use super::{BackendArg, ModeArg, OrderArg};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub backend: Option<BackendArg>,
    pub mode: Option<ModeArg>,
    pub workers: Option<usize>,
    pub channels: Option<usize>,
    pub reserve_channels: Option<bool>,
    pub batch_size: Option<i64>,
    pub concurrent_batching: Option<bool>,
    pub max_passes: Option<u32>,
    pub frame_size: Option<usize>,
    pub order_mismatch: Option<OrderArg>,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
    profiles: BTreeMap<String, Profile>,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        let profiles = parse_profiles(&data)?;
        Ok(Self {
            path,
            data,
            profiles,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.data
            .default_profile
            .as_deref()
            .filter(|name| self.profiles.contains_key(*name))
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn set_default_profile(&mut self, name: Option<&str>) -> Result<(), ConfigError> {
        if let Some(name) = name {
            if !self.profiles.contains_key(name) {
                return Err(ConfigError::ProfileNotFound {
                    name: name.to_string(),
                });
            }
            self.data.default_profile = Some(name.to_string());
        } else {
            self.data.default_profile = None;
        }
        Ok(())
    }

    pub fn upsert_profile(&mut self, name: &str, update: ProfileUpdate) -> Result<(), ConfigError> {
        let entry = self.data.profiles.entry(name.to_string()).or_default();
        if let Some(backend) = update.backend {
            entry.backend = Some(value_name(backend));
        }
        if let Some(mode) = update.mode {
            entry.mode = Some(value_name(mode));
        }
        if let Some(workers) = update.workers {
            entry.workers = Some(workers);
        }
        if let Some(channels) = update.channels {
            entry.channels = Some(channels);
        }
        if let Some(reserve) = update.reserve_channels {
            entry.reserve_channels = Some(reserve);
        }
        if let Some(batch_size) = update.batch_size {
            entry.batch_size = Some(batch_size);
        }
        if let Some(concurrent) = update.concurrent_batching {
            entry.concurrent_batching = Some(concurrent);
        }
        if let Some(passes) = update.max_passes {
            entry.max_passes = Some(passes);
        }
        if let Some(frame_size) = update.frame_size {
            entry.frame_size = Some(frame_size);
        }
        if let Some(policy) = update.order_mismatch {
            entry.order_mismatch = Some(value_name(policy));
        }
        self.profiles = parse_profiles(&self.data)?;
        Ok(())
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.data.profiles.remove(name).is_none() {
            return Err(ConfigError::ProfileNotFound {
                name: name.to_string(),
            });
        }
        if self.data.default_profile.as_deref() == Some(name) {
            self.data.default_profile = None;
        }
        self.profiles = parse_profiles(&self.data)?;
        Ok(())
    }

    pub fn persist(&self) -> Result<PathBuf, ConfigError> {
        let target = match &self.path {
            Some(path) => path.clone(),
            None => default_config_path().ok_or(ConfigError::NoConfigPath)?,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized = toml::to_string_pretty(&self.data)
            .map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

fn value_name<T: ValueEnum>(value: T) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_profiles(data: &RawConfig) -> Result<BTreeMap<String, Profile>, ConfigError> {
    let mut profiles = BTreeMap::new();
    for (name, raw) in &data.profiles {
        profiles.insert(name.clone(), convert_profile(name, raw)?);
    }
    if let Some(default_name) = data.default_profile.as_ref() {
        if !profiles.contains_key(default_name) {
            return Err(ConfigError::ProfileNotFound {
                name: default_name.clone(),
            });
        }
    }
    Ok(profiles)
}

fn parse_value<T: ValueEnum>(
    profile: &str,
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|value| {
            T::from_str(value, true).map_err(|_| ConfigError::InvalidValue {
                profile: profile.to_string(),
                field,
                value: value.to_string(),
            })
        })
        .transpose()
}

fn convert_profile(name: &str, raw: &RawProfile) -> Result<Profile, ConfigError> {
    Ok(Profile {
        name: name.to_string(),
        backend: parse_value(name, "backend", raw.backend.as_deref())?,
        mode: parse_value(name, "mode", raw.mode.as_deref())?,
        workers: raw.workers,
        channels: raw.channels,
        reserve_channels: raw.reserve_channels,
        batch_size: raw.batch_size,
        concurrent_batching: raw.concurrent_batching,
        max_passes: raw.max_passes,
        frame_size: raw.frame_size,
        order_mismatch: parse_value(name, "order_mismatch", raw.order_mismatch.as_deref())?,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    default_profile: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawProfile {
    backend: Option<String>,
    mode: Option<String>,
    workers: Option<usize>,
    channels: Option<usize>,
    reserve_channels: Option<bool>,
    batch_size: Option<i64>,
    concurrent_batching: Option<bool>,
    max_passes: Option<u32>,
    frame_size: Option<usize>,
    order_mismatch: Option<String>,
}

#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub backend: Option<BackendArg>,
    pub mode: Option<ModeArg>,
    pub workers: Option<usize>,
    pub channels: Option<usize>,
    pub reserve_channels: Option<bool>,
    pub batch_size: Option<i64>,
    pub concurrent_batching: Option<bool>,
    pub max_passes: Option<u32>,
    pub frame_size: Option<usize>,
    pub order_mismatch: Option<OrderArg>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize CLI config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write CLI config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },
    #[error("profile '{profile}' {field} value '{value}' is invalid")]
    InvalidValue {
        profile: String,
        field: &'static str,
        value: String,
    },
    #[error("no config directory found; pass --config or set PAGEX_CONFIG")]
    NoConfigPath,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("pagex").join("cli.toml"))
}
