// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proxy configuration.
//!
//! Values are layered as built-in defaults, then an optional TOML file, then
//! `PRIVFS_*` environment variables (`PRIVFS_PRIMARY_TIMEOUT_MS=5000` sets
//! `primary-timeout-ms`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PRIMARY_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_SECONDARY_TIMEOUT_MS: u64 = 2_500;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_ELEVATION_COMMAND: &str = "su";
pub const DEFAULT_HELPER_PATH: &str = "privfs-helper";

const ENV_PREFIX: &str = "PRIVFS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    /// Program that runs `-c <command>` with elevated privileges.
    pub elevation_command: String,
    pub helper_path: PathBuf,
    /// Bound on waiting for a request to be accepted by the dispatch thread.
    pub primary_timeout_ms: u64,
    /// Bound on waiting for a reply, for publishing it, and for draining.
    pub secondary_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Only a helper connecting with this uid is accepted.
    pub expected_uid: u32,
    /// Log every request and reply.
    pub debug: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            elevation_command: DEFAULT_ELEVATION_COMMAND.to_string(),
            helper_path: PathBuf::from(DEFAULT_HELPER_PATH),
            primary_timeout_ms: DEFAULT_PRIMARY_TIMEOUT_MS,
            secondary_timeout_ms: DEFAULT_SECONDARY_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            expected_uid: 0,
            debug: false,
        }
    }
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder {
            config: ProxyConfig::default(),
        }
    }

    /// Load defaults, then `file` if given, then the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_with_env(file, None)
    }

    /// As [`load`](Self::load), reading variables from `env` instead of the
    /// process environment when provided.
    pub fn load_with_env(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .convert_case(config::Case::Kebab)
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;
        built.try_deserialize()
    }

    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }

    pub fn secondary_timeout(&self) -> Duration {
        Duration::from_millis(self.secondary_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Builder for [`ProxyConfig`].
#[derive(Debug)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    pub fn elevation_command(mut self, command: impl Into<String>) -> Self {
        self.config.elevation_command = command.into();
        self
    }

    pub fn helper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.helper_path = path.into();
        self
    }

    pub fn primary_timeout(mut self, timeout: Duration) -> Self {
        self.config.primary_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn secondary_timeout(mut self, timeout: Duration) -> Self {
        self.config.secondary_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn expected_uid(mut self, uid: u32) -> Self {
        self.config.expected_uid = uid;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.primary_timeout(), Duration::from_secs(20));
        assert_eq!(config.secondary_timeout(), Duration::from_millis(2500));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(15));
        assert_eq!(config.elevation_command, "su");
        assert_eq!(config.expected_uid, 0);
        assert!(!config.debug);
    }

    #[test]
    fn empty_sources_yield_defaults() {
        let config = ProxyConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config, ProxyConfig::default());
    }

    #[test]
    fn file_then_environment_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "primary-timeout-ms = 1000\nsecondary-timeout-ms = 300\nelevation-command = \"sudo\""
        )
        .unwrap();

        let config = ProxyConfig::load_with_env(
            Some(file.path()),
            env(&[("PRIVFS_SECONDARY_TIMEOUT_MS", "750"), ("PRIVFS_DEBUG", "true")]),
        )
        .unwrap();

        assert_eq!(config.primary_timeout_ms, 1000);
        assert_eq!(config.secondary_timeout_ms, 750);
        assert_eq!(config.elevation_command, "sudo");
        assert!(config.debug);
        assert_eq!(config.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = ProxyConfig::load_with_env(Some(Path::new("/nonexistent/privfs.toml")), env(&[]));
        assert!(result.is_err());
    }

    #[test]
    fn builder_overrides_fields() {
        let config = ProxyConfig::builder()
            .elevation_command("sh")
            .helper_path("/usr/libexec/privfs-helper")
            .secondary_timeout(Duration::from_millis(100))
            .expected_uid(1000)
            .debug(true)
            .build();
        assert_eq!(config.elevation_command, "sh");
        assert_eq!(config.secondary_timeout_ms, 100);
        assert_eq!(config.expected_uid, 1000);
        assert!(config.debug);
    }
}
