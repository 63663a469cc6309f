// Core model
pub mod types;
pub mod time;
pub mod utils;
pub mod error;
pub mod environment;
pub mod scheduling;
pub mod hostname;
pub mod result;

// Checks and their dependencies
pub mod datasource;
pub mod check;
pub mod registry;
pub mod probes;

// Execution
pub mod cache;
pub mod executor;
pub mod app;

// Surfaces
pub mod config;
pub mod api;

// Re-export key types
pub use app::{ConfigurationIssue, Disposition, RecordEntry, RunReport, RunRequest, Watchpost};
pub use cache::{Cache, CacheBackend, CacheKey, Memoizer};
pub use check::{Check, CheckBuilder, CheckContext, CheckOutput};
pub use config::{CacheBackendKind, WatchpostConfig};
pub use datasource::{DatasourceFactory, DatasourceLifetime};
pub use environment::{Environment, EnvironmentRegistry};
pub use error::{ConfigError, ResolveError};
pub use executor::{ExecutionKey, ExecutorConfig, KeyAwareExecutor};
pub use registry::CheckRegistry;
pub use result::{CheckResult, CheckState, Metric, OutputFormat, build_result};
pub use scheduling::{SchedulingDecision, SchedulingStrategy};
pub use time::{Clock, SystemClock};
