use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

use crate::cache::{Cache, CacheBackend, ChainedCache, DiskCache, MemoryCache, RemoteCache, RemoteCacheConfig};
use crate::environment::{EnvironmentOptions, EnvironmentRegistry};
use crate::error::ConfigError;
use crate::executor::ExecutorConfig;
use crate::hostname::HostnameSpec;
use crate::result::{CheckState, OutputFormat};
use crate::time::Clock;
use crate::utils::{parse_duration, serde_duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Disk,
    Remote,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown cache backend `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    /// Root directory of the disk backend
    pub directory: PathBuf,

    // remote backend
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_infix: Option<String>,
    #[serde(with = "serde_duration")]
    pub retention: Duration,
    #[serde(with = "serde_duration")]
    pub operation_timeout: Duration,

    /// Refuse to start when the remote backend cannot be reached.
    pub mandatory: bool,
    /// Put a process-local tier in front of the disk or remote backend.
    pub memory_front: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let remote = RemoteCacheConfig::default();
        Self {
            backend: CacheBackendKind::Memory,
            directory: PathBuf::from(".watchpost-cache"),
            url: remote.url,
            namespace: remote.namespace,
            database: remote.database,
            username: None,
            password: None,
            key_infix: None,
            retention: remote.retention,
            operation_timeout: remote.operation_timeout,
            mandatory: false,
            memory_front: false,
        }
    }
}

impl CacheConfig {
    pub fn remote(&self) -> RemoteCacheConfig {
        RemoteCacheConfig {
            url: self.url.clone(),
            namespace: self.namespace.clone(),
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            key_infix: self.key_infix.clone(),
            retention: self.retention,
            operation_timeout: self.operation_timeout,
        }
    }

    /// Open the configured backend.
    ///
    /// An unreachable remote store falls back to memory unless `mandatory`.
    pub async fn open(&self, clock: Arc<dyn Clock>) -> anyhow::Result<Cache> {
        let backend: Arc<dyn CacheBackend> = match self.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCache::new()),
            CacheBackendKind::Disk => {
                fs::create_dir_all(&self.directory)?;
                info!(directory = %self.directory.display(), "Using disk cache");
                Arc::new(DiskCache::new(&self.directory))
            }
            CacheBackendKind::Remote => match RemoteCache::connect(self.remote()).await {
                Ok(remote) => Arc::new(remote),
                Err(err) if self.mandatory => {
                    return Err(err.context(format!("remote cache at {} is mandatory", self.url)));
                }
                Err(err) => {
                    warn!(url = %self.url, "Remote cache unavailable, using memory: {:#}", err);
                    return Ok(Cache::new(Arc::new(MemoryCache::new()), clock));
                }
            },
        };

        let backend: Arc<dyn CacheBackend> = if self.memory_front && self.backend != CacheBackendKind::Memory {
            Arc::new(ChainedCache::new(
                vec![Arc::new(MemoryCache::new()), backend],
                clock.clone(),
            ))
        } else {
            backend
        };
        Ok(Cache::new(backend, clock))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Hostname template for results about this environment
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutState {
    #[default]
    Unknown,
    Crit,
}

impl From<TimeoutState> for CheckState {
    fn from(state: TimeoutState) -> Self {
        match state {
            TimeoutState::Unknown => CheckState::Unknown,
            TimeoutState::Crit => CheckState::Crit,
        }
    }
}

fn default_expect_status() -> u16 {
    200
}

/// An HTTP probe check defined in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub name: String,
    pub url: String,
    /// Target environments. Empty means the execution environment.
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default, with = "serde_duration::option")]
    pub cache_for: Option<Duration>,
    #[serde(default, with = "serde_duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchpostConfig {
    pub execution_environment: String,
    pub environments: Vec<EnvironmentConfig>,
    /// Application-wide hostname template
    pub hostname: Option<String>,
    pub cache: CacheConfig,
    #[serde(with = "serde_duration")]
    pub default_ttl: Duration,
    pub max_concurrency: usize,
    #[serde(with = "serde_duration")]
    pub invocation_timeout: Duration,
    pub timeout_state: TimeoutState,
    pub output_format: OutputFormat,
    pub bind: String,
    pub probes: Vec<ProbeConfig>,
}

impl Default for WatchpostConfig {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        Self {
            execution_environment: "local".to_string(),
            environments: Vec::new(),
            hostname: None,
            cache: CacheConfig::default(),
            default_ttl: Duration::ZERO,
            max_concurrency: executor.max_concurrency,
            invocation_timeout: executor.default_timeout,
            timeout_state: TimeoutState::Unknown,
            output_format: OutputFormat::Local,
            bind: "0.0.0.0:8080".to_string(),
            probes: Vec::new(),
        }
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("WATCHPOST_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("watchpost").join("watchpost.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("watchpost.json");
    candidate.exists().then_some(candidate)
}

fn expand_env_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match lookup(&name) {
                Some(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Expand `${VAR}` in every string of a JSON document.
fn expand_value(value: &mut Value, lookup: &impl Fn(&str) -> Option<String>) {
    match value {
        Value::String(text) => *text = expand_env_vars(text, lookup),
        Value::Array(items) => items.iter_mut().for_each(|item| expand_value(item, lookup)),
        Value::Object(map) => map.values_mut().for_each(|item| expand_value(item, lookup)),
        _ => {}
    }
}

fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok()
}

impl WatchpostConfig {
    /// Load from `path`, or the first config file found, or defaults. Then
    /// apply `WATCHPOST_*` overrides from the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(resolve_config_path);

        let mut config = match &path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|err| anyhow::anyhow!("Failed to read {}: {}", path.display(), err))?;
                info!(path = %path.display(), "Loaded configuration");
                Self::from_json_str(&raw, env_lookup)?
            }
            None => {
                info!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(env_lookup)?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut value: Value = serde_json::from_str(raw)?;
        expand_value(&mut value, &lookup);
        Ok(serde_json::from_value(value)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(value) = lookup("WATCHPOST_EXECUTION_ENVIRONMENT") {
            self.execution_environment = value;
        }
        if let Some(value) = lookup("WATCHPOST_CACHE_BACKEND") {
            self.cache.backend = value.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(value) = lookup("WATCHPOST_CACHE_DIR") {
            self.cache.directory = PathBuf::from(value);
        }
        if let Some(value) = lookup("WATCHPOST_CACHE_URL") {
            self.cache.url = value;
        }
        if let Some(value) = lookup("WATCHPOST_DEFAULT_TTL") {
            self.default_ttl = parse_duration(&value)?;
        }
        if let Some(value) = lookup("WATCHPOST_MAX_CONCURRENCY") {
            self.max_concurrency = value
                .parse()
                .map_err(|err| anyhow::anyhow!("WATCHPOST_MAX_CONCURRENCY: {}", err))?;
        }
        if let Some(value) = lookup("WATCHPOST_INVOCATION_TIMEOUT") {
            self.invocation_timeout = parse_duration(&value)?;
        }
        if let Some(value) = lookup("WATCHPOST_BIND") {
            self.bind = value;
        }
        Ok(())
    }

    /// Build the environment registry. Without configured environments the
    /// execution environment is the only one.
    pub fn environment_registry(&self) -> Result<EnvironmentRegistry, ConfigError> {
        let mut registry = EnvironmentRegistry::empty();

        if self.environments.is_empty() {
            registry.new_environment(self.execution_environment.clone())?;
        }
        for environment in &self.environments {
            registry.new_with(
                environment.name.clone(),
                EnvironmentOptions {
                    hostname: environment.hostname.clone().map(HostnameSpec::from),
                    metadata: environment.metadata.clone(),
                },
            )?;
        }

        if registry.get(&self.execution_environment).is_none() {
            return Err(ConfigError::UnknownEnvironment {
                owner: "execution_environment".to_string(),
                environment: self.execution_environment.clone(),
            });
        }
        Ok(registry)
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: self.max_concurrency,
            default_timeout: self.invocation_timeout,
            timeout_state: self.timeout_state.into(),
        }
    }
}
