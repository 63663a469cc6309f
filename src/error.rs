//! Error types for registration and datasource resolution.
//!
//! Configuration errors are fatal and surface while the application is being
//! assembled. Resolution errors are per-check and end up as UNKNOWN results.

use std::fmt;

/// Errors raised while registering environments, datasources and checks.
///
/// All of these are fatal: a process with an invalid configuration must not
/// start serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment name was registered twice.
    DuplicateEnvironment(String),

    /// An environment name was empty.
    EmptyEnvironmentName,

    /// Two checks share the same identity.
    DuplicateCheck(String),

    /// Two datasource factories provide the same capability type.
    DuplicateDatasource(String),

    /// A check declared no target environments.
    EmptyTargets(String),

    /// A check has no invocable body.
    MissingBody(String),

    /// A check or strategy refers to an environment this registry never created.
    UnknownEnvironment {
        /// Check (or datasource) holding the reference
        owner: String,
        /// Name of the offending environment
        environment: String,
    },

    /// A check depends on a capability type with no registered factory.
    UnknownDatasource {
        /// Check declaring the dependency
        check: String,
        /// Rust type name of the capability
        datasource: String,
    },

    /// The combined scheduling constraints can never be satisfied.
    InvalidCheckConfiguration {
        /// Affected check
        check: String,
        /// Human-readable explanation
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateEnvironment(name) => {
                write!(f, "Environment `{}` is already registered", name)
            }
            Self::EmptyEnvironmentName => write!(f, "Environment names must not be empty"),
            Self::DuplicateCheck(id) => write!(f, "Check `{}` is already registered", id),
            Self::DuplicateDatasource(name) => {
                write!(f, "Datasource `{}` is already registered", name)
            }
            Self::EmptyTargets(id) => {
                write!(f, "Check `{}` declares no target environments", id)
            }
            Self::MissingBody(id) => write!(f, "Check `{}` has no body", id),
            Self::UnknownEnvironment { owner, environment } => write!(
                f,
                "`{}` refers to environment `{}` which is not registered",
                owner, environment
            ),
            Self::UnknownDatasource { check, datasource } => write!(
                f,
                "Check `{}` requires datasource `{}` which is not registered",
                check, datasource
            ),
            Self::InvalidCheckConfiguration { check, reason } => {
                write!(f, "Invalid check configuration for `{}`: {}", check, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors raised while binding a check to its datasources for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A datasource's scheduling strategies reject the current execution environment.
    DatasourceNotAvailable {
        /// Name of the datasource
        datasource: String,
        /// Execution environment that was rejected
        execution_environment: String,
    },

    /// The datasource could not be acquired.
    AcquisitionFailed {
        /// Name of the datasource
        datasource: String,
        /// Error message reported by the factory
        message: String,
    },

    /// The check refers to a capability with no registered factory.
    MissingDatasource(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatasourceNotAvailable {
                datasource,
                execution_environment,
            } => write!(
                f,
                "Datasource `{}` is not available in execution environment `{}`",
                datasource, execution_environment
            ),
            Self::AcquisitionFailed {
                datasource,
                message,
            } => write!(f, "Datasource `{}` could not be acquired: {}", datasource, message),
            Self::MissingDatasource(name) => write!(f, "Datasource `{}` is not registered", name),
        }
    }
}

impl std::error::Error for ResolveError {}
