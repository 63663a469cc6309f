//! Execution and target environments.
//!
//! An [`Environment`] is an opaque, immutable identity with a human name. The
//! same type plays two roles: the *target* a check observes and the
//! *execution* environment the process runs in. Environments are only
//! created through an [`EnvironmentRegistry`], which lets registration-time
//! validation reject references to environments from elsewhere.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ConfigError;
use crate::hostname::HostnameSpec;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

struct EnvironmentInner {
    registry_id: u64,
    index: usize,
    name: String,
    hostname: Option<HostnameSpec>,
    metadata: BTreeMap<String, String>,
}

/// A registered environment. Cheap to clone.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    /// The environment's name (case-sensitive, unique within its registry).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Hostname configuration used for results targeting this environment.
    pub fn hostname(&self) -> Option<&HostnameSpec> {
        self.inner.hostname.as_ref()
    }

    /// Free-form metadata attached at registration.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.inner.metadata
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.inner.registry_id
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.inner.registry_id == other.inner.registry_id && self.inner.index == other.inner.index
    }
}

impl Eq for Environment {}

impl Hash for Environment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.registry_id.hash(state);
        self.inner.index.hash(state);
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Environment").field(&self.inner.name).finish()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

/// Options for [`EnvironmentRegistry::new_with`].
#[derive(Default, Clone)]
pub struct EnvironmentOptions {
    pub hostname: Option<HostnameSpec>,
    pub metadata: BTreeMap<String, String>,
}

/// Registry of all environments known to one watchpost instance.
///
/// Filled once at startup; treated as read-only afterwards.
pub struct EnvironmentRegistry {
    id: u64,
    environments: Vec<Environment>,
}

impl EnvironmentRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            environments: Vec::new(),
        }
    }

    /// Register a new environment with default options.
    pub fn new_environment(&mut self, name: impl Into<String>) -> Result<Environment, ConfigError> {
        self.new_with(name, EnvironmentOptions::default())
    }

    /// Register a new environment.
    ///
    /// Fails with [`ConfigError::DuplicateEnvironment`] if the name is taken.
    pub fn new_with(
        &mut self,
        name: impl Into<String>,
        options: EnvironmentOptions,
    ) -> Result<Environment, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyEnvironmentName);
        }
        if self.get(&name).is_some() {
            return Err(ConfigError::DuplicateEnvironment(name));
        }

        let environment = Environment {
            inner: Arc::new(EnvironmentInner {
                registry_id: self.id,
                index: self.environments.len(),
                name,
                hostname: options.hostname,
                metadata: options.metadata,
            }),
        };
        self.environments.push(environment.clone());
        Ok(environment)
    }

    /// Look up an environment by name.
    pub fn get(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|env| env.name() == name)
    }

    /// Whether `environment` was created by this registry.
    pub fn contains(&self, environment: &Environment) -> bool {
        environment.registry_id() == self.id && self.environments.contains(environment)
    }

    /// Iterate environments in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.environments.iter()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
