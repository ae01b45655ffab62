use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use docshift::Target;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "docshift.toml";

/// Project context for docshift commands
pub struct ProjectContext {
    /// Directory holding docshift.toml, or the working directory without one
    pub project_root: PathBuf,
    /// Path to the config file, if one was found
    pub config_path: Option<PathBuf>,
    /// Loaded configuration (defaults when no file exists)
    pub config: DocshiftConfig,
}

/// Configuration stored in docshift.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocshiftConfig {
    #[serde(default)]
    pub docshift: DocshiftSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocshiftSettings {
    #[serde(default = "default_changesets_dir")]
    pub changesets_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
}

impl Default for DocshiftSettings {
    fn default() -> Self {
        Self {
            changesets_dir: default_changesets_dir(),
            default_target: None,
        }
    }
}

fn default_changesets_dir() -> String {
    "changesets".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "${REDIS_URL}".to_string()
}

fn default_key_prefix() -> String {
    "docshift".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_lease_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSettings {
    /// Contexts applied to this target; defaults to the target name
    #[serde(default)]
    pub contexts: Vec<String>,
}

impl ProjectContext {
    /// Find and load project context from current directory or ancestors
    pub fn find() -> Result<Self> {
        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::find_from(&current_dir)
    }

    /// Find project context starting from the given directory.
    ///
    /// Without a docshift.toml anywhere above `start`, defaults apply and
    /// paths resolve against `start`.
    pub fn find_from(start: &Path) -> Result<Self> {
        match Self::find_config(start) {
            Some(config_path) => Self::from_config(config_path),
            None => Ok(Self {
                project_root: start.to_path_buf(),
                config_path: None,
                config: DocshiftConfig::default(),
            }),
        }
    }

    fn from_config(config_path: PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: DocshiftConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", config_path.display()))?;
        let project_root = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(Self {
            project_root,
            config_path: Some(config_path),
            config,
        })
    }

    fn find_config(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();
        loop {
            let candidate = current.join(CONFIG_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    /// Changeset directory, relative paths resolved against the project root
    pub fn changesets_dir(&self, override_path: Option<&Path>) -> PathBuf {
        match override_path {
            Some(path) => path.to_path_buf(),
            None => self.project_root.join(&self.config.docshift.changesets_dir),
        }
    }

    /// Resolve the target by name, falling back to `default_target`
    pub fn target(&self, name: Option<&str>) -> Result<Target> {
        let name = name
            .or(self.config.docshift.default_target.as_deref())
            .context("No target given. Pass --target or set [docshift].default_target")?;

        let target = Target::new(name);
        match self.config.targets.get(name) {
            Some(settings) if !settings.contexts.is_empty() => Ok(target.with_contexts(settings.contexts.iter().cloned())),
            _ => Ok(target),
        }
    }

    /// Lock lease from [lock], `None` when locking is disabled
    pub fn lock_lease(&self) -> Option<Duration> {
        self.config
            .lock
            .enabled
            .then(|| Duration::from_secs(self.config.lock.lease_secs))
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.redis.key_prefix
    }

    /// Get the Redis URL, expanding environment variables
    pub fn redis_url(&self) -> Result<String> {
        expand_env(&self.config.redis.url)
    }
}

/// Replace every `${VAR}` in `value` with the variable's value.
fn expand_env(value: &str) -> Result<String> {
    let mut expanded = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .with_context(|| format!("Unterminated variable reference in '{value}'"))?;
        let var_name = &after[..end];
        let var = std::env::var(var_name).with_context(|| format!("Environment variable {var_name} not set"))?;
        expanded.push_str(&var);
        rest = &after[end + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}
