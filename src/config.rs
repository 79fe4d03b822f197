//! Configuration for billmail, loaded from a YAML file.

use log::LevelFilter;
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// A problem with the configuration. These are always fatal, and are raised before any network
/// activity takes place.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to open config file {0}: {1}")]
    OpenFailed(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    ParseFailed(serde_yaml::Error),
    #[error("imap.username must be an email address, got '{0}'")]
    InvalidUsername(String),
    #[error("imap.domain is not a valid host name: '{0}'")]
    InvalidDomain(String),
    #[error("imap.password must not be empty")]
    EmptyPassword,
    #[error("notion.{0} must not be empty")]
    EmptyNotionField(&'static str),
    #[error("failed to create directory {0}: {1}")]
    DirectoryCreationFailed(PathBuf, std::io::Error),
}

#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
enum LogLevel {
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "error")]
    Error,
}

#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Config {
    #[serde(default = "defaults::log_level")]
    log_level: LogLevel,
    #[serde(default)]
    log_file: Option<PathBuf>,
    imap: IMAP,
    #[serde(default)]
    notion: Option<Notion>,
    #[serde(default)]
    directories: Directories,
    #[serde(default)]
    platforms: BTreeMap<String, PlatformOptions>,
}

#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct IMAP {
    domain: String,
    #[serde(default = "defaults::port")]
    port: u16,
    username: String,
    password: String,
    // unfortunately, we can't configure tls because async_imap requires it
}

#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Notion {
    token: String,
    data_source_id: String,
    #[serde(default = "defaults::time_zone")]
    time_zone: String,
}

/// The on-disk layout used while retrieving a bill.
#[derive(Clone, Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Directories {
    /// Where attachments and downloaded files are written.
    #[serde(default = "defaults::attachments")]
    attachments: PathBuf,
    /// Where archives are extracted to.
    #[serde(default = "defaults::archives")]
    archives: PathBuf,
    /// Where the canonical `{platform}_raw.{ext}` file lands.
    #[serde(default = "defaults::staging")]
    staging: PathBuf,
}

/// Per-platform row filtering and column pruning, applied during normalization.
#[derive(Clone, Debug, Default, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct PlatformOptions {
    /// Maps a native column name to the values that cause a row to be dropped.
    #[serde(default)]
    exclude: BTreeMap<String, Vec<String>>,
    /// Native column names removed from every row.
    #[serde(default)]
    prune: Vec<String>,
}

impl Config {
    /// Load and validate the configuration at the given path.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_file =
            File::open(path).map_err(|err| ConfigError::OpenFailed(path.to_path_buf(), err))?;
        let config = serde_yaml::from_reader::<_, Self>(config_file)
            .map_err(ConfigError::ParseFailed)?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable before anything touches the network.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.imap.validate()?;
        if let Some(notion) = &self.notion {
            notion.validate()?;
        }

        Ok(())
    }

    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        match &self.log_level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }

    #[must_use]
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    #[must_use]
    pub fn imap(&self) -> &IMAP {
        &self.imap
    }

    #[must_use]
    pub fn notion(&self) -> Option<&Notion> {
        self.notion.as_ref()
    }

    #[must_use]
    pub fn directories(&self) -> &Directories {
        &self.directories
    }

    /// Get the options for a platform, falling back to no filtering at all.
    #[must_use]
    pub fn platform_options(&self, platform_id: &str) -> PlatformOptions {
        self.platforms.get(platform_id).cloned().unwrap_or_default()
    }
}

impl IMAP {
    #[must_use]
    pub fn new<S: Into<String>>(domain: S, port: u16, username: S, password: S) -> Self {
        Self {
            domain: domain.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // If these are malformed it's programmer error
        let email_regexp = Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("failed to create regex for email");
        let domain_regexp =
            Regex::new(r"^[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("failed to create regex for domain");

        if !email_regexp.is_match(&self.username) {
            return Err(ConfigError::InvalidUsername(self.username.clone()));
        } else if !domain_regexp.is_match(&self.domain) {
            return Err(ConfigError::InvalidDomain(self.domain.clone()));
        } else if self.password.is_empty() {
            return Err(ConfigError::EmptyPassword);
        }

        Ok(())
    }
}

impl Notion {
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn data_source_id(&self) -> &str {
        &self.data_source_id
    }

    #[must_use]
    pub fn time_zone(&self) -> &str {
        &self.time_zone
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::EmptyNotionField("token"));
        } else if self.data_source_id.trim().is_empty() {
            return Err(ConfigError::EmptyNotionField("data_source_id"));
        }

        Ok(())
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            attachments: defaults::attachments(),
            archives: defaults::archives(),
            staging: defaults::staging(),
        }
    }
}

impl Directories {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(attachments: P, archives: P, staging: P) -> Self {
        Self {
            attachments: attachments.into(),
            archives: archives.into(),
            staging: staging.into(),
        }
    }

    #[must_use]
    pub fn attachments(&self) -> &Path {
        &self.attachments
    }

    #[must_use]
    pub fn archives(&self) -> &Path {
        &self.archives
    }

    #[must_use]
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Create every directory in the layout if it does not exist yet.
    ///
    /// # Errors
    /// Returns [`ConfigError::DirectoryCreationFailed`] naming the directory that could not be made.
    pub fn ensure(&self) -> Result<(), ConfigError> {
        for dir in [&self.attachments, &self.archives, &self.staging] {
            std::fs::create_dir_all(dir)
                .map_err(|err| ConfigError::DirectoryCreationFailed(dir.clone(), err))?;
        }

        Ok(())
    }
}

impl PlatformOptions {
    #[must_use]
    pub fn exclude(&self) -> &BTreeMap<String, Vec<String>> {
        &self.exclude
    }

    #[must_use]
    pub fn prune(&self) -> &[String] {
        &self.prune
    }
}

mod defaults {
    use std::path::PathBuf;

    pub(super) fn log_level() -> super::LogLevel {
        super::LogLevel::Info
    }

    pub(super) fn port() -> u16 {
        993
    }

    pub(super) fn time_zone() -> String {
        "Asia/Shanghai".to_string()
    }

    pub(super) fn attachments() -> PathBuf {
        PathBuf::from("data/raw/attachments")
    }

    pub(super) fn archives() -> PathBuf {
        PathBuf::from("data/raw/bills")
    }

    pub(super) fn staging() -> PathBuf {
        PathBuf::from("data")
    }
}
