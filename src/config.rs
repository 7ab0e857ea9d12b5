//! Layered configuration for the orchestrator.
//!
//! Values are read from `.devenv/devenv.toml` in the project directory, then
//! overridden by `DEVENV_*` environment variables. Every field has a default,
//! so a project without a config file runs with the built-in settings.
//!
//! ```toml
//! [sandbox]
//! package_manager = "pnpm"
//! install_args = ["install", "--frozen-lockfile"]
//!
//! [sandbox.env]
//! NODE_ENV = "development"
//!
//! [devserver]
//! port = 5173
//! watchdog_secs = 45
//!
//! [sync]
//! debounce_ms = 250
//! ignore = ["node_modules", ".git", "coverage"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory (relative to the project) that holds devenv state and config.
pub const CONFIG_DIR: &str = ".devenv";

/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "devenv.toml";

/// How the sandbox installs dependencies and which environment it passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub package_manager: String,
    pub install_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            package_manager: "npm".to_string(),
            install_args: vec!["install".to_string()],
            env: BTreeMap::new(),
        }
    }
}

/// Dev-server launch and supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevServerSection {
    pub port: u16,
    pub host: String,
    /// Seconds to wait for a server-ready notification before warning.
    pub watchdog_secs: u64,
    /// Grace period for a killed dev server to exit before its successor spawns.
    pub kill_grace_ms: u64,
    /// Script flags the sandbox cannot honour; stripped from `package.json` scripts.
    pub stripped_flags: Vec<String>,
}

impl Default for DevServerSection {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            watchdog_secs: 30,
            kill_grace_ms: 2000,
            stripped_flags: vec!["--turbopack".to_string(), "--turbo".to_string()],
        }
    }
}

/// Reverse-sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub debounce_ms: u64,
    /// Glob patterns matched against each path segment.
    pub ignore: Vec<String>,
    /// Marker written into directories that become empty.
    pub placeholder: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            ignore: [
                "node_modules",
                ".git",
                ".next",
                ".nuxt",
                ".expo",
                ".cache",
                ".turbo",
                "dist",
                "build",
                ".DS_Store",
                CONFIG_DIR,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            placeholder: ".gitkeep".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSection {
    pub flush_interval_ms: u64,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
        }
    }
}

/// Effective orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevenvConfig {
    pub sandbox: SandboxSection,
    pub devserver: DevServerSection,
    pub sync: SyncSection,
    pub terminal: TerminalSection,
}

impl DevenvConfig {
    /// Path of the config file for a project directory.
    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load config from `.devenv/devenv.toml` and apply environment overrides.
    /// Returns defaults (plus overrides) if the file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_file(project_dir: &Path) -> Result<Self> {
        let config_path = Self::path_for(project_dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Apply `DEVENV_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DEVENV_PORT") {
            self.devserver.port = port
                .parse()
                .with_context(|| format!("DEVENV_PORT is not a valid port: {}", port))?;
        }
        if let Some(host) = lookup("DEVENV_HOST") {
            self.devserver.host = host;
        }
        if let Some(pm) = lookup("DEVENV_PACKAGE_MANAGER") {
            self.sandbox.package_manager = pm;
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.sync.debounce_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.devserver.watchdog_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.devserver.kill_grace_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.terminal.flush_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, body: &str) {
        let config_dir = dir.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILE), body).unwrap();
    }

    #[test]
    fn test_config_defaults() {
        let config = DevenvConfig::default();
        assert_eq!(config.sandbox.package_manager, "npm");
        assert_eq!(config.sandbox.install_args, vec!["install"]);
        assert_eq!(config.devserver.port, 3000);
        assert_eq!(config.devserver.host, "0.0.0.0");
        assert_eq!(config.watchdog(), Duration::from_secs(30));
        assert_eq!(config.kill_grace(), Duration::from_millis(2000));
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert!(config.sync.ignore.iter().any(|p| p == "node_modules"));
        assert_eq!(config.sync.placeholder, ".gitkeep");
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevenvConfig::load_file(dir.path()).unwrap();
        assert_eq!(config, DevenvConfig::default());
    }

    #[test]
    fn test_config_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[sandbox]
package_manager = "pnpm"

[sandbox.env]
NODE_ENV = "development"

[devserver]
port = 5173
"#,
        );

        let config = DevenvConfig::load_file(dir.path()).unwrap();
        assert_eq!(config.sandbox.package_manager, "pnpm");
        assert_eq!(config.sandbox.install_args, vec!["install"]); // default
        assert_eq!(
            config.sandbox.env.get("NODE_ENV").map(String::as_str),
            Some("development")
        );
        assert_eq!(config.devserver.port, 5173);
        assert_eq!(config.devserver.host, "0.0.0.0"); // default
        assert_eq!(config.sync.debounce_ms, 300); // default
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "not valid toml {{{{");
        assert!(DevenvConfig::load_file(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DevenvConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "DEVENV_PORT" => Some("8080".to_string()),
                "DEVENV_PACKAGE_MANAGER" => Some("yarn".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.devserver.port, 8080);
        assert_eq!(config.sandbox.package_manager, "yarn");
        assert_eq!(config.devserver.host, "0.0.0.0");
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = DevenvConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "DEVENV_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }
}
