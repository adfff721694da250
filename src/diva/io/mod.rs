use std::fs::{read_to_string, write};
use std::io;
use std::path::Path;
use std::process::exit;

use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string_pretty};
use thiserror::Error;

/// Name of the configuration file.
pub(crate) const CONFIG_NAME: &str = "config.json";

/// Errors raised while loading or writing the configuration file.
#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Config that is used to do general setup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct Config {
    /// The location of the download directory.
    #[serde(rename = "downloadDirectory", default = "default_download_directory")]
    download_directory: String,
    /// Number of parallel download workers.
    #[serde(rename = "workerCount", default = "default_worker_count")]
    worker_count: usize,
    /// Task queue bound as a multiple of the worker count.
    #[serde(rename = "queueFactor", default = "default_queue_factor")]
    queue_factor: usize,
    /// Retry attempts for transient network failures.
    #[serde(rename = "retryCount", default = "default_retry_count")]
    retry_count: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(rename = "retryDelayMs", default = "default_retry_delay_ms")]
    retry_delay_ms: u64,
    /// Whether to warn before downloading very large files.
    #[serde(rename = "sizeWarning", default = "default_size_warning")]
    size_warning: bool,
    /// Size in bytes above which the large-file warning fires.
    #[serde(rename = "sizeWarningThreshold", default = "default_size_warning_threshold")]
    size_warning_threshold: u64,
    /// Whether to skip downloads whose destination file already exists.
    #[serde(rename = "skipExisting", default = "default_skip_existing")]
    skip_existing: bool,
    /// Whether the terminal log shows debug output (applies on next launch).
    #[serde(rename = "verbose", default = "default_verbose")]
    verbose: bool,
    /// Reddit application client id.
    #[serde(rename = "clientId", default)]
    client_id: String,
    /// Reddit application client secret.
    #[serde(rename = "clientSecret", default)]
    client_secret: String,
}

fn default_download_directory() -> String {
    String::from("downloads/")
}
fn default_worker_count() -> usize {
    4
}
fn default_queue_factor() -> usize {
    2
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_size_warning() -> bool {
    true
}
fn default_size_warning_threshold() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_skip_existing() -> bool {
    false
}
fn default_verbose() -> bool {
    false
}

impl Config {
    /// The location of the download directory.
    pub(crate) fn download_directory(&self) -> &str {
        &self.download_directory
    }

    /// Number of parallel download workers.
    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Task queue bound as a multiple of the worker count.
    pub(crate) fn queue_factor(&self) -> usize {
        self.queue_factor
    }

    /// Retry attempts for transient network failures.
    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Base delay in milliseconds for exponential backoff.
    pub(crate) fn retry_delay_ms(&self) -> u64 {
        self.retry_delay_ms
    }

    /// Whether to warn before downloading very large files.
    pub(crate) fn size_warning(&self) -> bool {
        self.size_warning
    }

    /// Size in bytes above which the large-file warning fires.
    pub(crate) fn size_warning_threshold(&self) -> u64 {
        self.size_warning_threshold
    }

    /// Whether to skip downloads whose destination file already exists.
    pub(crate) fn skip_existing(&self) -> bool {
        self.skip_existing
    }

    /// Whether the terminal log shows debug output.
    pub(crate) fn verbose(&self) -> bool {
        self.verbose
    }

    /// Reddit application client id.
    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Reddit application client secret.
    pub(crate) fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Whether both halves of the application identity are present.
    pub(crate) fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub(crate) fn set_download_directory(&mut self, dir: String) {
        self.download_directory = dir;
    }

    pub(crate) fn set_worker_count(&mut self, count: usize) {
        self.worker_count = count;
    }

    pub(crate) fn set_size_warning(&mut self, enabled: bool) {
        self.size_warning = enabled;
    }

    pub(crate) fn set_skip_existing(&mut self, enabled: bool) {
        self.skip_existing = enabled;
    }

    pub(crate) fn set_verbose(&mut self, enabled: bool) {
        self.verbose = enabled;
    }

    pub(crate) fn set_credentials(&mut self, client_id: String, client_secret: String) {
        self.client_id = client_id;
        self.client_secret = client_secret;
    }

    /// Checks config and ensure it isn't missing.
    pub(crate) fn config_exists() -> bool {
        if !Path::new(CONFIG_NAME).exists() {
            trace!("config.json: does not exist!");
            return false;
        }

        true
    }

    /// Creates config file.
    pub(crate) fn create_config() -> Result<(), ConfigError> {
        let json = to_string_pretty(&Config::default())?;
        write(Path::new(CONFIG_NAME), json)?;

        Ok(())
    }

    /// Loads the config file, creating it with defaults when absent.
    pub(crate) fn load_or_create() -> Result<Self, ConfigError> {
        if !Self::config_exists() {
            info!("Creating config file...");
            Self::create_config()?;
        }

        Self::load_from(Path::new(CONFIG_NAME))
    }

    /// Saves the current settings back to the config file.
    pub(crate) fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Path::new(CONFIG_NAME))
    }

    fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_to_string(path)?;
        let config: Config = from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = to_string_pretty(self)?;
        write(path, json)?;

        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(String::from(
                "workerCount must be at least 1",
            )));
        }
        if self.queue_factor == 0 {
            return Err(ConfigError::Invalid(String::from(
                "queueFactor must be at least 1",
            )));
        }
        if self.download_directory.trim().is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "downloadDirectory must not be empty",
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            download_directory: default_download_directory(),
            worker_count: default_worker_count(),
            queue_factor: default_queue_factor(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            size_warning: default_size_warning(),
            size_warning_threshold: default_size_warning_threshold(),
            skip_existing: default_skip_existing(),
            verbose: default_verbose(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

/// Exits the program after message explaining the error and prompting the user to press `ENTER`.
///
/// # Arguments
///
/// * `error`: The error message to print.
pub(crate) fn emergency_exit(error: &str) -> ! {
    error!("{}", error);
    println!("Press ENTER to close the application...");

    let mut line = String::new();
    io::stdin().read_line(&mut line).unwrap_or_default();

    exit(0x00FF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::default();
        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();

        assert_eq!(loaded.worker_count(), 4);
        assert_eq!(loaded.retry_count(), 3);
        assert_eq!(loaded.download_directory(), "downloads/");
        assert!(loaded.size_warning());
        assert!(!loaded.skip_existing());
        assert!(!loaded.has_credentials());
    }

    #[test]
    fn file_keys_are_camel_case() {
        let json = to_string_pretty(&Config::default()).unwrap();
        assert!(json.contains("\"downloadDirectory\""));
        assert!(json.contains("\"workerCount\""));
        assert!(json.contains("\"sizeWarningThreshold\""));
        assert!(json.contains("\"clientSecret\""));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write(&path, r#"{ "clientId": "abc", "clientSecret": "def" }"#).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.has_credentials());
        assert_eq!(loaded.worker_count(), 4);
        assert_eq!(loaded.retry_delay_ms(), 1000);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write(&path, r#"{ "workerCount": 0 }"#).unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
