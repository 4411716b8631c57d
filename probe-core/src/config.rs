//! # Configuration Module
//!
//! Handles loading and managing probe configuration from `probe.toml` files.
//! Supports project-specific configurations (one project per target
//! environment), environment variables and `.env` files.
//!
//! ## Configuration Loading Flow (block diagram)
//!
//! ```text
//! +-------------------+     +-------------------+     +-------------------+
//! | PROBE_CONFIG env  | --> | Path resolution   | --> | probe.toml file   |
//! | (optional)        |     | or default ./     |     |                   |
//! +-------------------+     +-------------------+     +-------------------+
//!                                                              |
//!                                                              v
//! +-------------------+     +-------------------+     +-------------------+
//! | .env (dotenv)     | --> | PROBE_* prefix    | --> | Merged into       |
//! | PROBE_KEY=value   |     | PROBE_PROJECT_*   |     | project.data      |
//! +-------------------+     +-------------------+     +-------------------+
//!                                                              |
//!                                                              v
//!                           +-------------------+     +-------------------+
//!                           | Task-local        | <-- | get_config()      |
//!                           | PROJECT context   |     | per-test access   |
//!                           +-------------------+     +-------------------+
//! ```
//!
//! ## Configuration Structure
//!
//! ```toml
//! [[projects]]
//! name = "staging"
//! base_url = "https://api.staging.krishivaas.ai"
//! web_url = "https://staging.krishivaas.ai"
//! token_scope = "run"
//! timeout = 10000
//! ```
//!
//! Credentials are never written into `probe.toml`. They come from
//! `PROBE_EMAIL`/`PROBE_PASSWORD` (or `PROBE_STAGING_EMAIL` for a single
//! project), typically through a `.env` file.

use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{collections::HashMap, io::Read, path::Path, sync::Arc, time::Duration};
use toml::Value as TomlValue;
use tracing::*;
use url::Url;

use crate::{report::DuplicatePolicy, session::TokenScope, Error, Result};

/// Environment variable name for specifying the config file path.
const PROBE_CONFIG_ENV: &str = "PROBE_CONFIG";

/// Prefix of the environment variables merged into the configuration.
const PREFIX: &str = "PROBE";

/// Request timeout used when neither the caller nor the project specifies one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

static CONFIG: Lazy<Result<Config>> = Lazy::new(|| {
    let _ = dotenv::dotenv();
    Config::load()
});

tokio::task_local! {
    pub static PROJECT: Arc<ProjectConfig>;
}

/// Loaded configuration, or the fault that prevented loading it.
pub fn load_probe_config() -> Result<&'static Config> {
    CONFIG.as_ref().map_err(Clone::clone)
}

/// Get configuration for the current project. This function has to be called in the tokio
/// task created by probe runner. Otherwise, calling this function will panic.
pub fn get_config() -> Arc<ProjectConfig> {
    PROJECT.get()
}

/// probe's configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub projects: Vec<Arc<ProjectConfig>>,
    pub report: ReportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            projects: vec![Arc::new(ProjectConfig {
                name: "default".to_string(),
                ..Default::default()
            })],
            report: ReportConfig::default(),
        }
    }
}

/// `[report]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "ReportConfig::default_title")]
    pub title: String,
    /// Where the html reporter writes its document.
    #[serde(default = "ReportConfig::default_path")]
    pub path: String,
    /// How attachments sharing a name within one test are stored.
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
}

impl ReportConfig {
    fn default_title() -> String {
        "Website Test Report".to_string()
    }

    fn default_path() -> String {
        "probe-report.html".to_string()
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            title: ReportConfig::default_title(),
            path: ReportConfig::default_path(),
            duplicates: DuplicatePolicy::default(),
        }
    }
}

impl Config {
    /// Load probe configuration from path.
    fn load_from(path: &Path) -> Result<Config> {
        let Ok(mut file) = std::fs::File::open(path) else {
            let mut cfg = Config::default();
            cfg.load_env();
            return Ok(cfg);
        };

        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|e| Error::LoadError(e.to_string()))?;

        let mut cfg = Config::parse(&buf)?;
        debug!("probe.toml was successfully loaded: {cfg:#?}");

        cfg.load_env();

        Ok(cfg)
    }

    /// Parse configuration from a toml document without looking at the environment.
    pub fn parse(s: &str) -> Result<Config> {
        #[derive(Deserialize)]
        struct ConfigHelper {
            #[serde(default)]
            projects: Vec<ProjectConfig>,
            #[serde(default)]
            report: ReportConfig,
        }

        let helper: ConfigHelper = toml::from_str(s).map_err(|e| {
            Error::LoadError(format!(
                "failed to deserialize probe.toml into probe::Config: {e}"
            ))
        })?;

        let projects = if helper.projects.is_empty() {
            Config::default().projects
        } else {
            helper.projects.into_iter().map(Arc::new).collect()
        };

        Ok(Config {
            projects,
            report: helper.report,
        })
    }

    /// Load probe configuration.
    ///
    /// Loading order:
    /// 1. If `PROBE_CONFIG` env var is set, load from that path
    /// 2. Otherwise, load from `probe.toml` in the current directory
    fn load() -> Result<Config> {
        match std::env::var(PROBE_CONFIG_ENV) {
            Ok(path) => {
                let path = Path::new(&path);

                if path.extension().is_none_or(|ext| ext != "toml")
                    && !path.to_string_lossy().contains(std::path::MAIN_SEPARATOR)
                    && !path.to_string_lossy().contains('/')
                {
                    return Err(Error::LoadError(format!(
                        "{PROBE_CONFIG_ENV} should be a path to a config file, not a config value. \
                         Got: {path:?}. Use PROBE_<KEY>=value for config values instead."
                    )));
                }

                if !path.exists() {
                    return Err(Error::LoadError(format!(
                        "Config file specified by {PROBE_CONFIG_ENV} not found: {path:?}"
                    )));
                }

                debug!("Loading config from {PROBE_CONFIG_ENV}={path:?}");
                Config::load_from(path)
            }
            Err(_) => Config::load_from(Path::new("probe.toml")),
        }
    }

    /// Merge environment variables into project data.
    ///
    /// `PROBE_XXX` is visible to every project as "xxx". `PROBE_ZZZ_XXX` is visible only to
    /// project "zzz" and takes precedence over the global variable.
    fn load_env(&mut self) {
        self.merge_vars(std::env::vars());
    }

    fn merge_vars(&mut self, vars: impl Iterator<Item = (String, String)>) {
        let global_prefix = format!("{PREFIX}_");
        let project_prefixes: Vec<_> = self
            .projects
            .iter()
            .map(|p| format!("{PREFIX}_{}_", p.name.to_uppercase()))
            .collect();

        let vars: Vec<(String, String)> = vars
            .filter(|(k, _)| k != PROBE_CONFIG_ENV && k.starts_with(&global_prefix))
            .collect();

        let global_vars: HashMap<_, _> = vars
            .iter()
            .filter(|(k, _)| !project_prefixes.iter().any(|pp| k.starts_with(pp)))
            .map(|(k, v)| {
                (
                    k[global_prefix.len()..].to_lowercase(),
                    TomlValue::String(v.clone()),
                )
            })
            .collect();

        for (project_arc, project_prefix) in self.projects.iter_mut().zip(&project_prefixes) {
            let project_vars: HashMap<_, _> = vars
                .iter()
                .filter_map(|(k, v)| {
                    let key = k.strip_prefix(project_prefix.as_str())?;
                    Some((key.to_lowercase(), TomlValue::String(v.clone())))
                })
                .collect();
            let project = Arc::make_mut(project_arc);
            project.data.extend(global_vars.clone());
            project.data.extend(project_vars);
        }

        debug!(
            "probe configuration loaded from env: {} variable(s)",
            vars.len()
        );
    }
}

/// probe's project configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    /// Project name specified by user.
    pub name: String,
    /// Keys and values specified by user.
    #[serde(flatten)]
    pub data: HashMap<String, TomlValue>,
    /// List of tests to ignore in the project.
    #[serde(default)]
    pub test_ignore: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ProjectConfig {
    pub fn get(&self, key: impl AsRef<str>) -> Result<&TomlValue> {
        let key = key.as_ref();
        self.data
            .get(key)
            .ok_or_else(|| Error::ValueNotFound(key.to_string()))
    }

    pub fn get_str(&self, key: impl AsRef<str>) -> Result<&str> {
        let key = key.as_ref();
        self.get(key)?
            .as_str()
            .ok_or_else(|| value_error(key, "expected a string"))
    }

    pub fn get_int(&self, key: impl AsRef<str>) -> Result<i64> {
        let key = key.as_ref();
        match self.get(key)? {
            TomlValue::Integer(i) => Ok(*i),
            TomlValue::String(s) => s.trim().parse().map_err(|e| value_error(key, e)),
            _ => Err(value_error(key, "expected an integer")),
        }
    }

    pub fn get_bool(&self, key: impl AsRef<str>) -> Result<bool> {
        let key = key.as_ref();
        match self.get(key)? {
            TomlValue::Boolean(b) => Ok(*b),
            TomlValue::String(s) => s.trim().parse().map_err(|e| value_error(key, e)),
            _ => Err(value_error(key, "expected a boolean")),
        }
    }

    /// Reads a duration expressed in milliseconds. Absent keys yield `default`.
    pub fn get_millis(&self, key: impl AsRef<str>, default: Duration) -> Result<Duration> {
        let key = key.as_ref();
        if !self.data.contains_key(key) {
            return Ok(default);
        }
        let ms = self.get_int(key)?;
        let ms = u64::try_from(ms).map_err(|e| value_error(key, e))?;
        Ok(Duration::from_millis(ms))
    }

    pub fn get_url(&self, key: impl AsRef<str>) -> Result<Url> {
        let key = key.as_ref();
        let raw = self.get_str(key)?;
        if raw.trim().is_empty() {
            return Err(Error::ValueNotFound(key.to_string()));
        }
        Url::parse(raw).map_err(|e| value_error(key, e))
    }

    /// Base URL of the API under test.
    pub fn base_url(&self) -> Result<Url> {
        self.get_url("base_url")
    }

    /// Base URL of the website under test.
    pub fn web_url(&self) -> Result<Url> {
        self.get_url("web_url")
    }

    /// Endpoint `path` below `base_url`. A path prefix of `base_url` is kept.
    pub fn api_url(&self, path: &str) -> Result<Url> {
        join_path(&self.base_url()?, path).map_err(|e| value_error("base_url", e))
    }

    /// Page `path` below `web_url`.
    pub fn page_url(&self, path: &str) -> Result<Url> {
        join_path(&self.web_url()?, path).map_err(|e| value_error("web_url", e))
    }

    /// Request timeout for the project, 10 seconds unless configured.
    pub fn timeout(&self) -> Result<Duration> {
        self.get_millis("timeout", DEFAULT_TIMEOUT)
    }

    /// Lifetime of the session token. Defaults to one login per run.
    pub fn token_scope(&self) -> Result<TokenScope> {
        match self.data.get("token_scope") {
            None => Ok(TokenScope::default()),
            Some(_) => {
                let raw = self.get_str("token_scope")?;
                raw.parse()
                    .map_err(|_| value_error("token_scope", format!("unknown scope {raw:?}")))
            }
        }
    }

    /// Checks the values every test of this project depends on.
    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        self.timeout()?;
        self.token_scope()?;
        Ok(())
    }
}

fn join_path(base: &Url, path: &str) -> std::result::Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(path.trim_start_matches('/'))
}

fn value_error(key: &str, reason: impl std::fmt::Display) -> Error {
    Error::ValueError {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Number of retries. Zero keeps the suite fail-fast.
    #[serde(default)]
    pub count: Option<usize>,
    /// Factor to multiply the delay between retries.
    #[serde(default)]
    pub factor: Option<f32>,
    /// Whether to add jitter to the delay between retries.
    #[serde(default)]
    pub jitter: Option<bool>,
    /// Minimum delay between retries.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub min_delay: Option<Duration>,
    /// Maximum delay between retries.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            count: Some(0),
            factor: Some(2.0),
            jitter: Some(false),
            min_delay: Some(Duration::from_secs(1)),
            max_delay: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> backon::ExponentialBuilder {
        let builder = backon::ExponentialBuilder::new()
            .with_max_times(self.count.unwrap_or_default())
            .with_factor(self.factor.unwrap_or(2.0))
            .with_min_delay(self.min_delay.unwrap_or(Duration::from_secs(1)))
            .with_max_delay(self.max_delay.unwrap_or(Duration::from_secs(60)));

        if self.jitter.unwrap_or_default() {
            builder.with_jitter()
        } else {
            builder
        }
    }
}
