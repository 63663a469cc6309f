//! Shared HTTP client datasource and the probe built on top of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use super::{DatasourceFactory, DatasourceLifetime};
use crate::environment::Environment;
use crate::result::{CheckResult, CheckState, Metric};
use crate::scheduling::SchedulingStrategy;

/// A pooled HTTP client handed to checks.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// GET `url` and turn the outcome into a result.
    ///
    /// CRIT on a status other than `expect_status`. Transport errors are
    /// returned as errors so they end up as UNKNOWN.
    pub async fn probe(&self, url: &str, expect_status: u16) -> anyhow::Result<CheckResult> {
        let started = Instant::now();
        let response = self.client.get(url).send().await?;
        let elapsed = started.elapsed().as_secs_f64();
        let status = response.status().as_u16();

        let state = if status == expect_status {
            CheckState::Ok
        } else {
            CheckState::Crit
        };
        let summary = if state == CheckState::Ok {
            format!("HTTP {} in {:.3}s", status, elapsed)
        } else {
            format!("HTTP {} (expected {}) in {:.3}s", status, expect_status, elapsed)
        };

        Ok(CheckResult::new(state, summary)
            .with_details(format!("GET {}", url))
            .with_metric(Metric::new("response_time", elapsed)))
    }
}

/// Builds the shared [`HttpClient`].
pub struct HttpClientFactory {
    timeout: Duration,
    user_agent: String,
    strategies: Vec<Arc<dyn SchedulingStrategy>>,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            user_agent: format!("watchpost/{}", env!("CARGO_PKG_VERSION")),
            strategies: Vec::new(),
        }
    }

    /// Restrict where the client may be used.
    pub fn with_strategy(mut self, strategy: Arc<dyn SchedulingStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }
}

#[async_trait]
impl DatasourceFactory for HttpClientFactory {
    type Resource = HttpClient;

    fn name(&self) -> &str {
        "HttpClient"
    }

    fn scheduling_strategies(&self) -> Vec<Arc<dyn SchedulingStrategy>> {
        self.strategies.clone()
    }

    fn lifetime(&self) -> DatasourceLifetime {
        DatasourceLifetime::Shared
    }

    async fn acquire(&self, _execution_environment: &Environment) -> anyhow::Result<HttpClient> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()?;
        Ok(HttpClient { client })
    }
}
