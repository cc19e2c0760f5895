//! Language profiles and sandbox resource limits, loaded from YAML.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::ConfigError;

pub const MIN_MEMORY_MB: u64 = 64;
pub const MAX_MEMORY_MB: u64 = 2048;

fn default_memory_mb() -> u64 { 256 }
fn default_cpu_period_ms() -> u64 { 100 }
fn default_cpu_quota_ms() -> u64 { 100 }
fn default_code_timeout_ms() -> u64 { 10000 }
fn default_service_grace_ms() -> u64 { 10000 }
fn default_tty() -> bool { true }

/// One argv/env template. Entries may contain placeholder tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_tty")]
    pub tty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: String,
    #[serde(default)]
    pub ext: String,
    pub image: String,
    #[serde(default)]
    pub service: Option<CommandTemplate>,
    #[serde(default)]
    pub repl: Option<CommandTemplate>,
    #[serde(default)]
    pub run: Option<CommandTemplate>,
}

/// Limits applied to every sandboxed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_period_ms")]
    pub cpu_period_ms: u64,
    #[serde(default = "default_cpu_quota_ms")]
    pub cpu_quota_ms: u64,
    #[serde(default = "default_code_timeout_ms")]
    pub code_timeout_ms: u64,
    #[serde(default = "default_service_grace_ms")]
    pub service_grace_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_period_ms: default_cpu_period_ms(),
            cpu_quota_ms: default_cpu_quota_ms(),
            code_timeout_ms: default_code_timeout_ms(),
            service_grace_ms: default_service_grace_ms(),
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        let mb = self.memory_mb.clamp(MIN_MEMORY_MB, MAX_MEMORY_MB);
        (mb * 1024 * 1024) as i64
    }

    pub fn cpu_period_us(&self) -> i64 {
        (self.cpu_period_ms * 1000) as i64
    }

    pub fn cpu_quota_us(&self) -> i64 {
        (self.cpu_quota_ms * 1000) as i64
    }
}

#[derive(Debug, Deserialize)]
struct LangConfigFile {
    #[serde(default)]
    languages: Vec<LanguageProfile>,
    #[serde(default)]
    docker: ResourceLimits,
}

/// All language profiles keyed by name, plus the shared resource limits.
#[derive(Debug, Clone, Default)]
pub struct LangConfig {
    pub languages: HashMap<String, LanguageProfile>,
    pub limits: ResourceLimits,
}

impl LangConfig {
    pub fn new(languages: Vec<LanguageProfile>, limits: ResourceLimits) -> Self {
        let languages = languages
            .into_iter()
            .map(|lang| (lang.name.clone(), lang))
            .collect();
        Self { languages, limits }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        info!(
            path = %path.display(),
            languages = config.languages.len(),
            "Language config loaded"
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: LangConfigFile = serde_yaml::from_str(content)?;
        Ok(Self::new(file.languages, file.docker))
    }

    pub fn profile(&self, name: &str) -> Option<&LanguageProfile> {
        let profile = self.languages.get(name);
        debug!(language = name, found = profile.is_some(), "Language lookup");
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
docker:
  memory_mb: 4096
  cpu_period_ms: 100
  cpu_quota_ms: 50
  code_timeout_ms: 5000
languages:
  - name: python
    ext: .py
    image: yeditor/python:latest
    repl:
      cmd: ["python3", "-i"]
    run:
      cmd: ["yscript", "<YE_REQUEST_FILE>"]
      env: ["LANG=C.UTF-8"]
  - name: postgres
    ext: .sql
    image: yeditor/postgres:latest
    service:
      cmd: ["postgres"]
    repl:
      cmd: ["psql", "-h", "<YE_SERVICE_NAME>"]
"#;

    #[test]
    fn loads_profiles_and_limits() {
        let config = LangConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.languages.len(), 2);

        let python = config.profile("python").unwrap();
        assert_eq!(python.ext, ".py");
        assert!(python.service.is_none());
        let run = python.run.as_ref().unwrap();
        assert!(run.tty);
        assert_eq!(run.env, vec!["LANG=C.UTF-8".to_string()]);

        let postgres = config.profile("postgres").unwrap();
        assert_eq!(postgres.service.as_ref().unwrap().cmd, vec!["postgres"]);
        assert!(postgres.run.is_none());

        assert!(config.profile("cobol").is_none());
        assert_eq!(config.limits.code_timeout_ms, 5000);
        assert_eq!(config.limits.service_grace_ms, 10000);
    }

    #[test]
    fn clamps_memory_and_converts_cpu_units() {
        let mut limits = ResourceLimits {
            memory_mb: 4096,
            cpu_period_ms: 100,
            cpu_quota_ms: 50,
            ..Default::default()
        };
        assert_eq!(limits.memory_bytes(), 2048 * 1024 * 1024);
        limits.memory_mb = 1;
        assert_eq!(limits.memory_bytes(), 64 * 1024 * 1024);
        assert_eq!(limits.cpu_period_us(), 100_000);
        assert_eq!(limits.cpu_quota_us(), 50_000);
    }

    #[test]
    fn missing_docker_section_uses_defaults() {
        let config = LangConfig::from_yaml("languages: []").unwrap();
        assert!(config.languages.is_empty());
        assert_eq!(config.limits, ResourceLimits::default());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = LangConfig::load("/nonexistent/langs.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("langs.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = LangConfig::load(&path).unwrap();
        assert!(config.profile("python").is_some());
    }
}
