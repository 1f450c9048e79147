use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

use crate::{mode, session, store};

pub const PROJECT_CONFIG_FILE: &str = "sqlreplay.toml";
pub const HOME_CONFIG_DIR: &str = ".sqlreplay";
pub const HOME_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    #[serde(default)]
    pub record: bool,
    #[serde(default = "default_recording_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_recording_size")]
    pub max_recording_size: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            record: false,
            path: default_recording_path(),
            max_recording_size: default_max_recording_size(),
        }
    }
}

fn default_recording_path() -> PathBuf {
    PathBuf::from(session::DEFAULT_RECORDING_PATH)
}

fn default_max_recording_size() -> usize {
    store::DEFAULT_MAX_RECORDING_SIZE
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads `override_path` if given, else the first of `./sqlreplay.toml`
    /// and `~/.sqlreplay/config.toml` that exists, else defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path)
                .with_context(|| format!("load config from --config {}", path.display()));
        }

        for (label, path) in discovery_candidates() {
            if path.is_file() {
                tracing::debug!(source = %label, "loading config");
                return Self::from_path(&path)
                    .with_context(|| format!("load config from {label}"));
            }
        }

        Ok(Self::default())
    }

    /// Makes the recording settings the process-wide defaults.
    pub fn apply(&self) -> anyhow::Result<()> {
        if self.recording.max_recording_size == 0 {
            anyhow::bail!("`recording.max_recording_size` must be greater than zero");
        }
        store::set_max_recording_size(self.recording.max_recording_size);
        session::set_default_recording_path(&self.recording.path);
        mode::set_config_default(self.recording.record);
        Ok(())
    }
}

fn discovery_candidates() -> Vec<(String, PathBuf)> {
    let mut candidates = vec![(
        format!("project ./{PROJECT_CONFIG_FILE}"),
        PathBuf::from(PROJECT_CONFIG_FILE),
    )];
    if let Some(home) = std::env::var_os("HOME").filter(|home| !home.is_empty()) {
        let path = PathBuf::from(home).join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE);
        candidates.push((format!("home {}", path.display()), path));
    }
    candidates
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}
