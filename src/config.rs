//! Configuration file handling.
//!
//! The configuration file is stored at `$BANKLINK_HOME/config.json` and holds the tunables of the
//! connection wizard and the sync tracker. The library itself does not need a configuration file:
//! `WizardSettings::default()` and `TrackerSettings::default()` carry the same defaults.

use crate::error::{ErrorType, IntoResult};
use crate::tracker::TrackerSettings;
use crate::wizard::WizardSettings;
use crate::{utils, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "banklink";
const CONFIG_VERSION: u8 = 1;
const CONFIG_JSON: &str = "config.json";

pub(crate) const ROUTING_CODE_LENGTH: usize = 8;
pub(crate) const DEFAULT_SYNC_DAYS: u32 = 90;
pub(crate) const MAX_SYNC_DAYS: u32 = 730;
pub(crate) const RESULT_TIMEOUT_SECS: u64 = 30;

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to `$BANKLINK_HOME` and from there it loads `$BANKLINK_HOME/config.json`.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
}

impl Config {
    /// Creates the home directory, if needed, and writes an initial `config.json` with default
    /// settings. An existing `config.json` is left alone and loaded instead.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let maybe_relative = dir.into();
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the banklink home directory")
            .pub_result(ErrorType::Io)?;
        let root = utils::canonicalize(&maybe_relative)
            .await
            .pub_result(ErrorType::Io)?;
        let config_path = root.join(CONFIG_JSON);
        if config_path.is_file() {
            return Self::load(root).await;
        }
        let config_file = ConfigFile::default();
        config_file
            .save(&config_path)
            .await
            .pub_result(ErrorType::Io)?;
        Ok(Self {
            root,
            config_path,
            config_file,
        })
    }

    /// Validates that the home directory and the config file exist, then loads the config file.
    pub async fn load(home: impl Into<PathBuf>) -> Result<Self> {
        let maybe_relative = home.into();
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("The banklink home directory is missing, run 'banklink init'")
            .pub_result(ErrorType::Config)?;
        let config_path = root.join(CONFIG_JSON);
        let config_file = ConfigFile::load(&config_path)
            .await
            .pub_result(ErrorType::Config)?;
        Ok(Self {
            root,
            config_path,
            config_file,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn default_sync_days(&self) -> u32 {
        self.config_file.default_sync_days
    }

    pub fn max_sync_days(&self) -> u32 {
        self.config_file.max_sync_days
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.config_file.result_timeout_secs)
    }

    /// Settings for a `SyncTracker`.
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            default_days: self.config_file.default_sync_days,
            max_days: self.config_file.max_sync_days,
            result_timeout: self.result_timeout(),
        }
    }

    /// Settings for a `ConnectionWizard`.
    pub fn wizard_settings(&self) -> WizardSettings {
        WizardSettings {
            routing_code_length: self.config_file.routing_code_length,
            default_sync_days: self.config_file.default_sync_days,
            max_sync_days: self.config_file.max_sync_days,
        }
    }
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "banklink",
///   "config_version": 1,
///   "routing_code_length": 8,
///   "default_sync_days": 90,
///   "max_sync_days": 730,
///   "result_timeout_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "banklink"
    app_name: String,

    /// Configuration file version
    config_version: u8,

    /// Number of digits in a bank routing code (BLZ)
    #[serde(default = "default_routing_code_length")]
    routing_code_length: usize,

    /// The historical window, in days, offered for a first sync
    #[serde(default = "default_sync_days")]
    default_sync_days: u32,

    /// The largest historical window, in days, a user may choose
    #[serde(default = "default_max_sync_days")]
    max_sync_days: u32,

    /// How long to wait for a run's result once the run reported `complete`
    #[serde(default = "default_result_timeout_secs")]
    result_timeout_secs: u64,
}

fn default_routing_code_length() -> usize {
    ROUTING_CODE_LENGTH
}

fn default_sync_days() -> u32 {
    DEFAULT_SYNC_DAYS
}

fn default_max_sync_days() -> u32 {
    MAX_SYNC_DAYS
}

fn default_result_timeout_secs() -> u64 {
    RESULT_TIMEOUT_SECS
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            routing_code_length: ROUTING_CODE_LENGTH,
            default_sync_days: DEFAULT_SYNC_DAYS,
            max_sync_days: MAX_SYNC_DAYS,
            result_timeout_secs: RESULT_TIMEOUT_SECS,
        }
    }
}

impl ConfigFile {
    /// Loads a ConfigFile from the specified path and validates it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if its values make no sense.
    async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("The config file is missing '{}'", path.display())
        }
        let config: ConfigFile = utils::deserialize(path).await?;

        anyhow::ensure!(
            config.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            config.app_name
        );
        anyhow::ensure!(
            config.default_sync_days >= 1 && config.default_sync_days <= config.max_sync_days,
            "Invalid default_sync_days {}: must be between 1 and max_sync_days ({})",
            config.default_sync_days,
            config.max_sync_days
        );
        anyhow::ensure!(
            config.routing_code_length > 0,
            "Invalid routing_code_length: must be greater than zero"
        );

        Ok(config)
    }

    /// Saves the ConfigFile to the specified path.
    async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let p = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(p, data)
            .await
            .context("Unable to write config file")
    }
}
