//! Run coordination.
//!
//! [`Watchpost`] ties the registry, the execution environment and the
//! key-aware executor together. A run evaluates every (check, target) pair,
//! serves the due ones through the executor in parallel and returns the
//! outcomes in registration order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::cache::CacheError;
use crate::check::{Check, FailureKind, Invocation, InvocationFailure};
use crate::config::WatchpostConfig;
use crate::datasource::http::{HttpClient, HttpClientFactory};
use crate::environment::Environment;
use crate::error::ConfigError;
use crate::executor::{ErrorRecord, ExecutionKey, ExecutorStatistics, KeyAwareExecutor, Served, ServedFrom};
use crate::hostname::{HostnameChain, HostnameContext, HostnameSpec, resolve_hostname};
use crate::registry::CheckRegistry;
use crate::result::{CheckResult, CheckState, ExecutionResult, OutputFormat, encode_own_service, render};
use crate::probes::probe_check;
use crate::scheduling::{self, RunMode, SchedulingContext, SchedulingDecision};
use crate::time::Clock;
use crate::types::{CheckId, Hostname};

/// Request timeout of the HTTP client registered for configured probes.
const PROBE_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the service summarising a run.
pub const OWN_SERVICE_NAME: &str = "Watchpost";

/// Which checks a run covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Restrict the run to these check ids. Runs all checks when absent.
    #[serde(default)]
    pub checks: Option<Vec<CheckId>>,
    /// Values for the checks' declared arguments.
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(checks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            checks: Some(checks.into_iter().map(|c| CheckId::new(c)).collect()),
            arguments: BTreeMap::new(),
        }
    }

    /// Explicitly selected checks run on demand, everything else on schedule.
    pub fn mode(&self) -> RunMode {
        if self.checks.is_some() {
            RunMode::OnDemand
        } else {
            RunMode::Scheduled
        }
    }
}

/// How one (check, target) pair was handled in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Fresh cached results
    Cache,
    /// This run invoked the check
    Owned,
    /// Joined an invocation already in flight
    FanIn,
    /// Scheduling said SKIP, the last stored results were reused
    Reused,
    /// Scheduling said SKIP and nothing was stored yet
    Unschedulable,
    /// Scheduling said DONT_SCHEDULE, nothing is reported
    NotScheduled,
}

impl From<ServedFrom> for Disposition {
    fn from(from: ServedFrom) -> Self {
        match from {
            ServedFrom::Cache => Self::Cache,
            ServedFrom::Owned => Self::Owned,
            ServedFrom::FanIn => Self::FanIn,
        }
    }
}

/// Outcome for one (check, target) pair.
#[derive(Debug, Clone, Serialize)]
pub struct RecordEntry {
    pub key: String,
    pub check: CheckId,
    pub environment: String,
    pub disposition: Disposition,
    pub failed: bool,
    pub results: Vec<ExecutionResult>,
}

/// Everything one run produced, in registration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub entries: Vec<RecordEntry>,
}

impl RunReport {
    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.entries.iter().flat_map(|entry| entry.results.iter())
    }

    pub fn count(&self, disposition: Disposition) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.disposition == disposition)
            .count()
    }

    pub fn errors(&self) -> usize {
        self.entries.iter().filter(|entry| entry.failed).count()
    }

    /// State and summary of the synthetic run service.
    pub fn summary(&self) -> (CheckState, String) {
        let reported = self.entries.len() - self.count(Disposition::NotScheduled);
        let errors = self.errors();
        let summary = format!(
            "{} checks reported: {} executed, {} cached, {} joined, {} skipped, {} errors",
            reported,
            self.count(Disposition::Owned),
            self.count(Disposition::Cache),
            self.count(Disposition::FanIn),
            self.count(Disposition::Reused) + self.count(Disposition::Unschedulable),
            errors
        );
        let state = if errors > 0 { CheckState::Warn } else { CheckState::Ok };
        (state, summary)
    }
}

/// A check/target pair that cannot work as configured in this execution environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationIssue {
    pub check: CheckId,
    pub environment: String,
    pub problem: String,
}

/// Result reported when a pair is skipped and nothing was stored before.
pub fn unschedulable_result() -> CheckResult {
    CheckResult::unknown("Check is temporarily unschedulable and no prior results are available")
}

/// The application: one execution environment running a fixed set of checks.
#[derive(Clone)]
pub struct Watchpost {
    registry: Arc<CheckRegistry>,
    execution_environment: Environment,
    executor: Arc<KeyAwareExecutor>,
    hostname: Option<HostnameSpec>,
    default_ttl: Duration,
    output_format: OutputFormat,
}

impl Watchpost {
    pub fn new(
        registry: Arc<CheckRegistry>,
        execution_environment: Environment,
        executor: Arc<KeyAwareExecutor>,
    ) -> Self {
        Self {
            registry,
            execution_environment,
            executor,
            hostname: None,
            default_ttl: Duration::ZERO,
            output_format: OutputFormat::default(),
        }
    }

    /// Assemble the application from configuration.
    ///
    /// `register` adds the application's own datasources and checks; probes
    /// from the configuration are registered after them. Any configuration
    /// error aborts startup.
    pub async fn from_config<R>(config: &WatchpostConfig, clock: Arc<dyn Clock>, register: R) -> anyhow::Result<Self>
    where
        R: FnOnce(&mut CheckRegistry, &Environment) -> Result<(), ConfigError>,
    {
        let environments = Arc::new(config.environment_registry()?);
        let execution_environment = environments
            .get(&config.execution_environment)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                owner: "execution_environment".to_string(),
                environment: config.execution_environment.clone(),
            })?;

        let mut registry = CheckRegistry::new(environments.clone());
        register(&mut registry, &execution_environment)?;

        if !config.probes.is_empty() && !registry.has_datasource::<HttpClient>() {
            registry.register_datasource(HttpClientFactory::new(PROBE_CLIENT_TIMEOUT))?;
        }
        for probe in &config.probes {
            registry.register(probe_check(probe, &environments, &execution_environment)?)?;
        }

        let cache = config.cache.open(clock).await?;
        info!(
            execution_environment = %execution_environment,
            checks = registry.list_checks().len(),
            cache = cache.backend_name(),
            "Watchpost assembled"
        );
        let executor = KeyAwareExecutor::new(cache, config.executor());

        let mut app = Self::new(Arc::new(registry), execution_environment, Arc::new(executor))
            .with_default_ttl(config.default_ttl)
            .with_output_format(config.output_format);
        if let Some(hostname) = &config.hostname {
            app = app.with_hostname(hostname.as_str());
        }
        Ok(app)
    }

    /// Application-wide hostname, lowest precedence.
    pub fn with_hostname(mut self, hostname: impl Into<HostnameSpec>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// TTL for checks that do not set their own.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.registry
    }

    pub fn execution_environment(&self) -> &Environment {
        &self.execution_environment
    }

    pub fn statistics(&self) -> ExecutorStatistics {
        self.executor.statistics()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.executor.errors()
    }

    fn ttl_for(&self, check: &Check) -> Duration {
        check.cache_for().unwrap_or(self.default_ttl)
    }

    fn selected(&self, request: &RunRequest) -> Vec<Check> {
        match &request.checks {
            None => self.registry.list_checks().to_vec(),
            Some(ids) => self
                .registry
                .list_checks()
                .iter()
                .filter(|check| ids.contains(check.id()))
                .cloned()
                .collect(),
        }
    }

    /// Run the requested checks against all their targets.
    ///
    /// Never fails: every pair ends up in the report. Dropping the returned
    /// future aborts the invocations it started.
    pub async fn run(&self, request: &RunRequest) -> RunReport {
        let mode = request.mode();
        let checks = self.selected(request);
        if let Some(ids) = &request.checks {
            for id in ids.iter().filter(|id| self.registry.get(id.as_str()).is_none()) {
                debug!(check = %id, "Requested check is not registered");
            }
        }

        let mut pairs = Vec::new();
        for check in &checks {
            for target in check.targets() {
                pairs.push((check.clone(), target.clone()));
            }
        }

        let mut slots: Vec<Option<RecordEntry>> = vec![None; pairs.len()];
        let mut tasks = JoinSet::new();

        for (index, (check, target)) in pairs.iter().enumerate() {
            let key = ExecutionKey::new(check, target, &request.arguments);
            let ctx = SchedulingContext {
                check: check.id(),
                execution_environment: &self.execution_environment,
                target_environment: target,
                mode,
            };

            match scheduling::decide(check.strategies(), &ctx) {
                SchedulingDecision::DontSchedule => {
                    self.executor.record_skipped();
                    debug!(key = %key, "Not scheduled in this execution environment");
                    slots[index] = Some(RecordEntry {
                        key: key.to_string(),
                        check: check.id().clone(),
                        environment: target.name().to_string(),
                        disposition: Disposition::NotScheduled,
                        failed: false,
                        results: Vec::new(),
                    });
                }
                SchedulingDecision::Skip => {
                    self.executor.record_skipped();
                    let (disposition, results) = match self.executor.last_results(&key).await {
                        Some(results) => (Disposition::Reused, results),
                        None => (Disposition::Unschedulable, vec![unschedulable_result()]),
                    };
                    debug!(key = %key, ?disposition, "Skipped");
                    slots[index] = Some(self.entry(check, target, &key, disposition, false, &results));
                }
                SchedulingDecision::Schedule => {
                    let work = OwnedWork {
                        registry: self.registry.clone(),
                        check: check.clone(),
                        execution_environment: self.execution_environment.clone(),
                        target: target.clone(),
                        arguments: request.arguments.clone(),
                        mode,
                    };
                    let executor = self.executor.clone();
                    let ttl = self.ttl_for(check);
                    let timeout = check.timeout();
                    tasks.spawn(async move {
                        let served = executor.execute(key, ttl, timeout, || work.run()).await;
                        (index, served)
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, served)) => {
                    let (check, target) = &pairs[index];
                    slots[index] = Some(self.served_entry(check, target, &served));
                }
                Err(err) => error!("Check task ended abnormally: {}", err),
            }
        }

        let entries = slots
            .into_iter()
            .zip(&pairs)
            .map(|(slot, (check, target))| {
                slot.unwrap_or_else(|| {
                    let key = ExecutionKey::new(check, target, &request.arguments);
                    let failure = InvocationFailure::new(FailureKind::Panic, "check task ended abnormally");
                    self.entry(check, target, &key, Disposition::Owned, true, &[failure.to_result()])
                })
            })
            .collect();

        let report = RunReport { entries };
        info!(
            pairs = report.entries.len(),
            executed = report.count(Disposition::Owned),
            cached = report.count(Disposition::Cache),
            joined = report.count(Disposition::FanIn),
            errors = report.errors(),
            "Run finished"
        );
        report
    }

    /// Run and encode for the monitoring backend, including the run service.
    pub async fn run_and_render(&self, request: &RunRequest) -> String {
        let report = self.run(request).await;
        self.render(&report)
    }

    pub fn render(&self, report: &RunReport) -> String {
        let results: Vec<ExecutionResult> = report.results().cloned().collect();
        let mut out = render(&results, self.output_format);
        let (state, summary) = report.summary();
        out.push_str(&encode_own_service(state, OWN_SERVICE_NAME, &summary));
        out
    }

    /// Drop the cached results of a check for all its targets.
    pub async fn invalidate(
        &self,
        check: &Check,
        arguments: &BTreeMap<String, String>,
    ) -> Result<(), CacheError> {
        for target in check.targets() {
            let key = ExecutionKey::new(check, target, arguments);
            self.executor.invalidate(&key).await?;
            info!(key = %key, "Invalidated cached results");
        }
        Ok(())
    }

    fn served_entry(&self, check: &Check, target: &Environment, served: &Served) -> RecordEntry {
        self.entry(
            check,
            target,
            &served.key,
            served.from.into(),
            served.failed(),
            served.results(),
        )
    }

    fn entry(
        &self,
        check: &Check,
        target: &Environment,
        key: &ExecutionKey,
        disposition: Disposition,
        failed: bool,
        results: &[CheckResult],
    ) -> RecordEntry {
        RecordEntry {
            key: key.to_string(),
            check: check.id().clone(),
            environment: target.name().to_string(),
            disposition,
            failed,
            results: results
                .iter()
                .map(|result| self.execution_result(check, target, result))
                .collect(),
        }
    }

    /// Attach service name, labels and piggyback host to a check result.
    pub fn execution_result(&self, check: &Check, target: &Environment, result: &CheckResult) -> ExecutionResult {
        let service_name = match result.name_suffix.as_deref() {
            Some(suffix) => format!("{}{}", check.service_name(), suffix),
            None => check.service_name().to_string(),
        };
        let alternative = result.alternative_hostname.clone().map(HostnameSpec::Static);

        ExecutionResult {
            piggyback_host: self.hostname_for(check, target, alternative.as_ref()),
            service_name,
            service_labels: check.labels().clone(),
            environment: target.name().to_string(),
            state: result.state,
            summary: result.summary.clone(),
            details: result.details.clone(),
            metrics: result.metrics.clone(),
        }
    }

    fn hostname_for(&self, check: &Check, target: &Environment, result: Option<&HostnameSpec>) -> Hostname {
        let chain = HostnameChain {
            result,
            check: check.hostname(),
            environment: target.hostname(),
            application: self.hostname.as_ref(),
        };
        let ctx = HostnameContext {
            service_name: check.service_name().as_str(),
            environment: target.name(),
            labels: check.labels(),
        };
        resolve_hostname(chain, &ctx)
    }

    /// Piggyback hosts the checks report under, without result overrides.
    pub fn check_hostnames(&self) -> BTreeSet<Hostname> {
        self.registry
            .list_checks()
            .iter()
            .flat_map(|check| {
                check
                    .targets()
                    .iter()
                    .map(move |target| self.hostname_for(check, target, None))
            })
            .collect()
    }

    /// Scheduled pairs whose datasources cannot be resolved in this
    /// execution environment. Registration cannot catch these.
    pub fn verify(&self) -> Vec<ConfigurationIssue> {
        let mut issues = Vec::new();
        let no_arguments = BTreeMap::new();

        for check in self.registry.list_checks() {
            for target in check.targets() {
                let ctx = SchedulingContext {
                    check: check.id(),
                    execution_environment: &self.execution_environment,
                    target_environment: target,
                    mode: RunMode::Scheduled,
                };
                if scheduling::decide(check.strategies(), &ctx) == SchedulingDecision::Schedule {
                    if let Err(err) = self.registry.resolve(
                        check,
                        &self.execution_environment,
                        target,
                        &no_arguments,
                        RunMode::Scheduled,
                    ) {
                        issues.push(ConfigurationIssue {
                            check: check.id().clone(),
                            environment: target.name().to_string(),
                            problem: err.to_string(),
                        });
                    }
                }
            }
        }

        issues
    }
}

/// Everything an owned invocation needs, moved into its task.
struct OwnedWork {
    registry: Arc<CheckRegistry>,
    check: Check,
    execution_environment: Environment,
    target: Environment,
    arguments: BTreeMap<String, String>,
    mode: RunMode,
}

impl OwnedWork {
    async fn run(self) -> Invocation {
        let resolved = self.registry.resolve(
            &self.check,
            &self.execution_environment,
            &self.target,
            &self.arguments,
            self.mode,
        );
        match resolved {
            Ok(bound) => bound.invoke().await,
            Err(err) => {
                let err = anyhow::Error::new(err);
                Invocation::failed(InvocationFailure::from_error(FailureKind::Resolution, &err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::ProbeConfig;
    use crate::environment::{EnvironmentOptions, EnvironmentRegistry};
    use crate::executor::ExecutorConfig;
    use crate::result::Metric;
    use crate::scheduling::{MustRunInExecutionEnvironments, MustRunInTargetEnvironment, OnDemandOnly};
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        environments: Arc<EnvironmentRegistry>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut environments = EnvironmentRegistry::empty();
            environments.new_environment("prod").unwrap();
            environments
                .new_with(
                    "staging",
                    EnvironmentOptions {
                        hostname: Some(HostnameSpec::from("{service_name}.staging")),
                        ..Default::default()
                    },
                )
                .unwrap();
            Self {
                environments: Arc::new(environments),
                clock: Arc::new(ManualClock::default()),
            }
        }

        fn env(&self, name: &str) -> Environment {
            self.environments.get(name).unwrap().clone()
        }

        fn app(&self, registry: CheckRegistry, execution_environment: &str) -> Watchpost {
            let executor = KeyAwareExecutor::new(
                Cache::new(Arc::new(MemoryCache::new()), self.clock.clone()),
                ExecutorConfig::default(),
            );
            Watchpost::new(Arc::new(registry), self.env(execution_environment), Arc::new(executor))
        }

        fn registry(&self) -> CheckRegistry {
            CheckRegistry::new(self.environments.clone())
        }
    }

    fn counting_check(name: &str, targets: &[&Environment], calls: &Arc<AtomicUsize>) -> Check {
        let calls = calls.clone();
        Check::builder(name)
            .targets(targets.iter().copied())
            .cache_for(Duration::from_secs(300))
            .run(move |ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CheckResult::ok(format!("{} reachable", ctx.target)))
                }
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn ping_example_is_cached_for_its_ttl() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = fixture.registry();
        registry.register(counting_check("ping-example", &[&prod], &calls)).unwrap();
        let app = fixture.app(registry, "prod");

        let first = app.run(&RunRequest::all()).await;
        assert_eq!(first.entries[0].disposition, Disposition::Owned);
        assert_eq!(first.entries[0].results[0].state, CheckState::Ok);

        fixture.clock.advance(Duration::from_secs(10));
        let second = app.run(&RunRequest::all()).await;
        assert_eq!(second.entries[0].disposition, Disposition::Cache);
        assert_eq!(second.entries[0].results[0].summary, first.entries[0].results[0].summary);
        assert_eq!(app.statistics().cache_hits, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        fixture.clock.advance(Duration::from_secs(291));
        let third = app.run(&RunRequest::all()).await;
        assert_eq!(third.entries[0].disposition, Disposition::Owned);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_datasource_reports_one_unknown() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let staging = fixture.env("staging");

        let mut registry = fixture.registry();
        registry
            .register_datasource(
                HttpClientFactory::new(Duration::from_secs(5))
                    .with_strategy(Arc::new(MustRunInExecutionEnvironments::new([prod]))),
            )
            .unwrap();
        registry
            .register(
                Check::builder("api-health")
                    .target(&staging)
                    .requires::<HttpClient>()
                    .run(|ctx| async move {
                        let http = ctx.resource::<HttpClient>()?;
                        http.probe("http://127.0.0.1:9/health", 200).await
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let app = fixture.app(registry, "staging");
        let errors_before = app.statistics().errors;

        let report = app.run(&RunRequest::all()).await;
        assert_eq!(report.entries.len(), 1);
        let results = &report.entries[0].results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, CheckState::Unknown);
        assert!(results[0].summary.contains("HttpClient"));
        assert!(results[0].summary.contains("staging"));
        assert_eq!(app.statistics().errors, errors_before + 1);
        assert_eq!(app.errors()[0].kind, FailureKind::Resolution);
    }

    #[tokio::test]
    async fn verify_lists_unresolvable_pairs_and_hostnames() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let staging = fixture.env("staging");

        let mut registry = fixture.registry();
        registry
            .register_datasource(
                HttpClientFactory::new(Duration::from_secs(5))
                    .with_strategy(Arc::new(MustRunInExecutionEnvironments::new([prod.clone()]))),
            )
            .unwrap();
        registry
            .register(
                Check::builder("api-health")
                    .targets([&prod, &staging])
                    .requires::<HttpClient>()
                    .run(|_| async { Ok(CheckResult::ok("up")) })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let in_staging = fixture.app(registry, "staging");
        let issues = in_staging.verify();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|issue| issue.problem.contains("HttpClient")));

        let hostnames: Vec<_> = in_staging
            .check_hostnames()
            .into_iter()
            .map(|h| h.as_str().to_string())
            .collect();
        assert_eq!(hostnames, vec!["api-health-prod", "api-health.staging"]);
    }

    #[tokio::test]
    async fn verify_is_clean_where_datasources_are_available() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");

        let mut registry = fixture.registry();
        registry
            .register_datasource(
                HttpClientFactory::new(Duration::from_secs(5))
                    .with_strategy(Arc::new(MustRunInExecutionEnvironments::new([prod.clone()]))),
            )
            .unwrap();
        registry
            .register(
                Check::builder("api-health")
                    .target(&prod)
                    .requires::<HttpClient>()
                    .run(|_| async { Ok(CheckResult::ok("up")) })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        assert!(fixture.app(registry, "prod").verify().is_empty());
    }

    #[tokio::test]
    async fn skip_reuses_previous_results_or_reports_unschedulable() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let calls = Arc::new(AtomicUsize::new(0));
        let maintenance = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let check = {
            let maintenance = maintenance.clone();
            let calls = calls.clone();
            Check::builder("db")
                .target(&prod)
                .cache_for(Duration::from_secs(60))
                .scheduling(crate::scheduling::SkipWhen::new("maintenance", move |_| {
                    maintenance.load(Ordering::SeqCst)
                }))
                .run(move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(CheckResult::ok("db fine"))
                    }
                })
                .build()
                .unwrap()
        };
        let mut registry = fixture.registry();
        registry.register(check).unwrap();
        let app = fixture.app(registry, "prod");

        maintenance.store(true, Ordering::SeqCst);
        let report = app.run(&RunRequest::all()).await;
        assert_eq!(report.entries[0].disposition, Disposition::Unschedulable);
        assert_eq!(report.entries[0].results[0].state, CheckState::Unknown);

        maintenance.store(false, Ordering::SeqCst);
        app.run(&RunRequest::all()).await;

        maintenance.store(true, Ordering::SeqCst);
        fixture.clock.advance(Duration::from_secs(120));
        let report = app.run(&RunRequest::all()).await;
        assert_eq!(report.entries[0].disposition, Disposition::Reused);
        assert_eq!(report.entries[0].results[0].summary, "db fine");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(app.statistics().skipped, 2);
    }

    #[tokio::test]
    async fn excluded_targets_are_not_reported_and_on_demand_checks_wait_for_a_request() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let staging = fixture.env("staging");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = fixture.registry();
        registry
            .register(
                Check::builder("local-disk")
                    .targets([&prod, &staging])
                    .scheduling(MustRunInTargetEnvironment)
                    .run(|ctx| async move { Ok(CheckResult::ok(format!("disk ok in {}", ctx.target))) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let on_demand = Check::builder("reindex")
            .target(&prod)
            .scheduling(OnDemandOnly)
            .run({
                let calls = calls.clone();
                move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(CheckResult::ok("reindexed"))
                    }
                }
            })
            .build()
            .unwrap();
        registry.register(on_demand).unwrap();
        let app = fixture.app(registry, "prod");

        let report = app.run(&RunRequest::all()).await;
        let dispositions: Vec<_> = report.entries.iter().map(|e| (e.key.as_str(), e.disposition)).collect();
        assert_eq!(
            dispositions,
            vec![
                ("local-disk@prod", Disposition::Owned),
                ("local-disk@staging", Disposition::NotScheduled),
                ("reindex@prod", Disposition::NotScheduled),
            ]
        );
        assert_eq!(report.results().count(), 1);
        assert_eq!(report.errors(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let report = app.run(&RunRequest::only(["reindex"])).await;
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].disposition, Disposition::Owned);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn results_get_suffix_labels_and_hostname() {
        let fixture = Fixture::new();
        let staging = fixture.env("staging");
        let mut registry = fixture.registry();
        registry
            .register(
                Check::builder("HTTP api")
                    .target(&staging)
                    .label("team", "payments")
                    .run(|_| async {
                        Ok(vec![
                            CheckResult::ok("main fine").with_metric(Metric::new("latency", 0.1)),
                            CheckResult::warn("replica slow")
                                .with_name_suffix(" replica")
                                .with_alternative_hostname("replica-1.example.com"),
                        ])
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let app = fixture.app(registry, "staging").with_hostname("watchpost-{environment}");

        let report = app.run(&RunRequest::all()).await;
        let results: Vec<_> = report.results().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].service_name, "HTTP api");
        assert_eq!(results[0].piggyback_host.as_str(), "http-api.staging");
        assert_eq!(results[0].service_labels.get("team").map(String::as_str), Some("payments"));
        assert_eq!(results[1].service_name, "HTTP api replica");
        assert_eq!(results[1].piggyback_host.as_str(), "replica-1.example.com");

        let out = app.render(&report);
        assert!(out.contains("<<<<http-api.staging>>>>"));
        assert!(out.contains("1 \"HTTP api replica\" - replica slow"));
        assert!(out.ends_with(
            "<<<local:sep(0)>>>\n0 \"Watchpost\" - 1 checks reported: 1 executed, 0 cached, 0 joined, 0 skipped, 0 errors\n"
        ));
    }

    #[tokio::test]
    async fn a_failing_check_does_not_affect_the_others() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = fixture.registry();
        registry
            .register(
                Check::builder("broken")
                    .target(&prod)
                    .run(|_| async { Err::<CheckResult, _>(anyhow::anyhow!("connection refused")) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.register(counting_check("fine", &[&prod], &calls)).unwrap();
        let app = fixture.app(registry, "prod");

        let report = app.run(&RunRequest::all()).await;
        assert_eq!(report.entries[0].results[0].state, CheckState::Unknown);
        assert_eq!(report.entries[0].results[0].summary, "Check failed: connection refused");
        assert!(report.entries[0].failed);
        assert_eq!(report.entries[1].results[0].state, CheckState::Ok);

        let (state, summary) = report.summary();
        assert_eq!(state, CheckState::Warn);
        assert!(summary.ends_with("1 errors"));
        assert_eq!(app.errors()[0].key, "broken@prod");
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_invocation() {
        let fixture = Fixture::new();
        let prod = fixture.env("prod");
        let calls = Arc::new(AtomicUsize::new(0));
        let check = counting_check("ping-example", &[&prod], &calls);
        let mut registry = fixture.registry();
        registry.register(check.clone()).unwrap();
        let app = fixture.app(registry, "prod");

        app.run(&RunRequest::all()).await;
        app.invalidate(&check, &BTreeMap::new()).await.unwrap();
        app.run(&RunRequest::all()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn from_config_registers_application_checks_then_probes() {
        let config = WatchpostConfig {
            execution_environment: "prod".into(),
            environments: vec![
                crate::config::EnvironmentConfig {
                    name: "prod".into(),
                    hostname: None,
                    metadata: BTreeMap::new(),
                },
            ],
            hostname: Some("watchpost-{environment}".into()),
            default_ttl: Duration::from_secs(30),
            probes: vec![ProbeConfig {
                name: "HTTP api".into(),
                url: "http://127.0.0.1:9/health".into(),
                environments: Vec::new(),
                cache_for: None,
                timeout: None,
                labels: BTreeMap::new(),
                expect_status: 200,
            }],
            ..Default::default()
        };

        let app = Watchpost::from_config(&config, Arc::new(ManualClock::default()), |registry, execution| {
            registry.register(
                Check::builder("ping-example")
                    .target(execution)
                    .run(|_| async { Ok(CheckResult::ok("pong")) })
                    .build()?,
            )
        })
        .await
        .unwrap();

        let ids: Vec<_> = app.registry().list_checks().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["ping-example", "probe::HTTP api"]);
        assert!(app.registry().has_datasource::<HttpClient>());
        assert_eq!(app.execution_environment().name(), "prod");
    }

    #[tokio::test]
    async fn from_config_rejects_duplicate_checks() {
        let config = WatchpostConfig::default();
        let result = Watchpost::from_config(&config, Arc::new(ManualClock::default()), |registry, execution| {
            for _ in 0..2 {
                registry.register(
                    Check::builder("twice")
                        .target(execution)
                        .run(|_| async { Ok(CheckResult::ok("x")) })
                        .build()?,
                )?;
            }
            Ok(())
        })
        .await;

        let err = result.err().unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::DuplicateCheck("twice".into()))
        );
    }
}
