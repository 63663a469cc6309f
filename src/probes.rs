//! HTTP probe checks declared in configuration.
//!
//! Each probe becomes a regular check requiring the [`HttpClient`]
//! datasource. `{environment}` in the probe URL is replaced by the target
//! environment's name, so one probe can watch the same endpoint everywhere.

use crate::check::Check;
use crate::config::ProbeConfig;
use crate::datasource::http::HttpClient;
use crate::environment::{Environment, EnvironmentRegistry};
use crate::error::ConfigError;

pub const PROBE_NAMESPACE: &str = "probe";

fn targets(
    probe: &ProbeConfig,
    environments: &EnvironmentRegistry,
    execution_environment: &Environment,
) -> Result<Vec<Environment>, ConfigError> {
    if probe.environments.is_empty() {
        return Ok(vec![execution_environment.clone()]);
    }

    probe
        .environments
        .iter()
        .map(|name| {
            environments
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownEnvironment {
                    owner: probe.name.clone(),
                    environment: name.clone(),
                })
        })
        .collect()
}

pub fn probe_check(
    probe: &ProbeConfig,
    environments: &EnvironmentRegistry,
    execution_environment: &Environment,
) -> Result<Check, ConfigError> {
    let targets = targets(probe, environments, execution_environment)?;

    let mut builder = Check::builder(probe.name.clone())
        .namespace(PROBE_NAMESPACE)
        .targets(&targets)
        .requires::<HttpClient>();
    for (key, value) in &probe.labels {
        builder = builder.label(key.clone(), value.clone());
    }
    if let Some(ttl) = probe.cache_for {
        builder = builder.cache_for(ttl);
    }
    if let Some(timeout) = probe.timeout {
        builder = builder.timeout(timeout);
    }

    let url = probe.url.clone();
    let expect_status = probe.expect_status;
    builder
        .run(move |ctx| {
            let url = url.replace("{environment}", ctx.target.name());
            async move {
                let http = ctx.resource::<HttpClient>()?;
                http.probe(&url, expect_status).await
            }
        })
        .build()
}
