//! Service configuration.
//!
//! Settings are read from `edocebiv.toml` and then overridden by environment
//! variables (a `.env` file is honoured). Every field has a default, so a
//! missing file yields a fully usable configuration.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! base_url = "http://localhost:8000"
//!
//! [storage]
//! db_path = ".edocebiv/edocebiv.db"
//! data_root = ".edocebiv/projects"
//!
//! [container]
//! default_image = "python:3.11-slim"
//! run_timeout_secs = 60
//!
//! [llm]
//! planning_model = "gpt-4o"
//! execution_model = "gpt-4o"
//! max_follow_up_rounds = 5
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "edocebiv.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL used in robots.txt and sitemap.xml
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Directory served under `/static/`, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: default_base_url(),
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Root under which each project's data directory is created
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            data_root: default_data_root(),
        }
    }
}

/// Settings for project containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Image assigned to newly created projects
    #[serde(default = "default_image")]
    pub default_image: String,
    /// Where the project data directory is mounted inside the container
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_pip_timeout")]
    pub pip_timeout_secs: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            mount_path: default_mount_path(),
            working_dir: default_working_dir(),
            run_timeout_secs: default_run_timeout(),
            pip_timeout_secs: default_pip_timeout(),
        }
    }
}

/// Settings for the chat-completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Model for planning, analysis and conclusion steps
    #[serde(default = "default_model")]
    pub planning_model: String,
    /// Model for code generation, execution, testing and refinement steps
    #[serde(default = "default_model")]
    pub execution_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_follow_up_rounds")]
    pub max_follow_up_rounds: u32,
    /// Tool results fed back to the model are cut to this many characters
    #[serde(default = "default_tool_result_limit")]
    pub tool_result_limit: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            planning_model: default_model(),
            execution_model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_follow_up_rounds: default_max_follow_up_rounds(),
            tool_result_limit: default_tool_result_limit(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from(".edocebiv/edocebiv.db")
}
fn default_data_root() -> PathBuf {
    PathBuf::from(".edocebiv/projects")
}
fn default_image() -> String {
    "python:3.11-slim".to_string()
}
fn default_mount_path() -> String {
    "/app/data".to_string()
}
fn default_working_dir() -> String {
    "/app".to_string()
}
fn default_run_timeout() -> u64 {
    60
}
fn default_pip_timeout() -> u64 {
    120
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_max_follow_up_rounds() -> u32 {
    5
}
fn default_tool_result_limit() -> usize {
    1000
}
fn default_request_timeout() -> u64 {
    120
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the file
    /// doesn't exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse the TOML file only. Returns defaults if the file doesn't exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("EDOCEBIV_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("EDOCEBIV_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid EDOCEBIV_PORT '{}'", port))?;
        }
        if let Some(base_url) = lookup("EDOCEBIV_BASE_URL") {
            self.server.base_url = base_url;
        }
        if let Some(db_path) = lookup("EDOCEBIV_DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }
        if let Some(data_root) = lookup("EDOCEBIV_DATA_ROOT") {
            self.storage.data_root = PathBuf::from(data_root);
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL") {
            self.llm.base_url = base_url;
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.container.default_image, "python:3.11-slim");
        assert_eq!(config.container.mount_path, "/app/data");
        assert_eq!(config.llm.max_follow_up_rounds, 5);
        assert_eq!(config.llm.tool_result_limit, 1000);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("edocebiv.toml")).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.llm.planning_model, "gpt-4o");
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edocebiv.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9100

[llm]
planning_model = "o1"
max_follow_up_rounds = 2
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.llm.planning_model, "o1");
        assert_eq!(config.llm.execution_model, "gpt-4o");
        assert_eq!(config.llm.max_follow_up_rounds, 2);
        assert_eq!(config.container.pip_timeout_secs, 120);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edocebiv.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EDOCEBIV_PORT", "9999"),
            ("EDOCEBIV_DATA_ROOT", "/srv/projects"),
            ("OPENAI_BASE_URL", "http://localhost:11434/v1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.storage.data_root, PathBuf::from("/srv/projects"));
        assert_eq!(config.llm.base_url, "http://localhost:11434/v1");
        assert_eq!(config.storage.db_path, PathBuf::from(".edocebiv/edocebiv.db"));
    }

    #[test]
    fn test_env_invalid_port_is_error() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "EDOCEBIV_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_to_toml_round_trips_port() {
        let mut config = Config::default();
        config.server.port = 4321;
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 4321);
    }
}
