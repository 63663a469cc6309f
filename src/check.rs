//! Check definitions.
//!
//! A [`Check`] is built once with [`Check::builder`], handed to the registry
//! and immutable from then on. Its body is either async or blocking; blocking
//! bodies run on tokio's blocking pool so they never stall the runtime.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;

use crate::datasource::{Requirement, Resources};
use crate::environment::Environment;
use crate::error::ConfigError;
use crate::hostname::HostnameSpec;
use crate::result::{CheckResult, ResultBuilder};
use crate::scheduling::{AnyExecutionEnvironment, SchedulingStrategy};
use crate::types::{CheckId, ServiceName};
use crate::utils::truncate_chars;

const SUMMARY_MAX_CHARS: usize = 200;

/// What a check body produced.
pub enum CheckOutput {
    /// Everything at once.
    Results(Vec<CheckResult>),
    /// A lazily produced, finite sequence. Drained on the blocking pool.
    Iter(Box<dyn Iterator<Item = anyhow::Result<CheckResult>> + Send>),
    /// A lazily produced, finite async sequence.
    Stream(BoxStream<'static, anyhow::Result<CheckResult>>),
}

impl CheckOutput {
    pub fn iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<CheckResult>>,
        I::IntoIter: Send + 'static,
    {
        Self::Iter(Box::new(iter.into_iter()))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<CheckResult>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }
}

impl From<CheckResult> for CheckOutput {
    fn from(result: CheckResult) -> Self {
        Self::Results(vec![result])
    }
}

impl From<Vec<CheckResult>> for CheckOutput {
    fn from(results: Vec<CheckResult>) -> Self {
        Self::Results(results)
    }
}

impl From<ResultBuilder> for CheckOutput {
    fn from(builder: ResultBuilder) -> Self {
        Self::Results(vec![builder.finish()])
    }
}

impl fmt::Debug for CheckOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Results(results) => f.debug_tuple("Results").field(&results.len()).finish(),
            Self::Iter(_) => f.write_str("Iter(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Everything a body gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub check: CheckId,
    pub service_name: ServiceName,
    pub target: Environment,
    pub execution_environment: Environment,
    pub arguments: BTreeMap<String, String>,
    pub resources: Resources,
}

impl CheckContext {
    /// The datasource resource of type `T`.
    pub fn resource<T: Any + Send + Sync>(&self) -> anyhow::Result<Arc<T>> {
        self.resources.get::<T>()
    }

    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }
}

type AsyncBody = dyn Fn(CheckContext) -> BoxFuture<'static, anyhow::Result<CheckOutput>> + Send + Sync;
type BlockingBody = dyn Fn(CheckContext) -> anyhow::Result<CheckOutput> + Send + Sync;

#[derive(Clone)]
pub enum CheckBody {
    Async(Arc<AsyncBody>),
    Blocking(Arc<BlockingBody>),
}

/// Why an invocation did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    Acquisition,
    Body,
    Panic,
    Timeout,
}

/// Failure description kept for the error record.
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    pub kind: FailureKind,
    /// Short, single-line message that is safe to show on the dashboard.
    pub message: String,
    /// Full description for operators.
    pub detail: String,
}

impl InvocationFailure {
    pub fn from_error(kind: FailureKind, err: &anyhow::Error) -> Self {
        Self {
            kind,
            message: redact(&err.to_string()),
            detail: format!("{:?}", err),
        }
    }

    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            message: redact(&message),
            detail: message,
        }
    }

    /// The UNKNOWN result reported in place of the failed part.
    pub fn to_result(&self) -> CheckResult {
        let summary = match self.kind {
            FailureKind::Timeout => self.message.clone(),
            _ => format!("Check failed: {}", self.message),
        };
        CheckResult::unknown(summary)
    }
}

/// First line only, bounded length.
fn redact(message: &str) -> String {
    let first = message.lines().next().unwrap_or_default().trim();
    truncate_chars(first, SUMMARY_MAX_CHARS)
}

/// The settled outcome of one invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub results: Vec<CheckResult>,
    pub failure: Option<InvocationFailure>,
}

impl Invocation {
    /// A failed invocation reported as a single UNKNOWN.
    pub fn failed(failure: InvocationFailure) -> Self {
        Self {
            results: vec![failure.to_result()],
            failure: Some(failure),
        }
    }

    fn finish(mut results: Vec<CheckResult>, failure: Option<InvocationFailure>) -> Self {
        if let Some(failure) = &failure {
            results.push(failure.to_result());
        } else if results.is_empty() {
            results.push(CheckResult::no_results());
        }
        Self { results, failure }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("check panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("check panicked: {}", message)
    } else {
        "check panicked".to_string()
    }
}

fn drain_iter(
    iter: impl Iterator<Item = anyhow::Result<CheckResult>>,
) -> (Vec<CheckResult>, Option<InvocationFailure>) {
    let mut results = Vec::new();
    for item in iter {
        match item {
            Ok(result) => results.push(result),
            Err(err) => return (results, Some(InvocationFailure::from_error(FailureKind::Body, &err))),
        }
    }
    (results, None)
}

async fn drain_output(output: CheckOutput) -> (Vec<CheckResult>, Option<InvocationFailure>) {
    match output {
        CheckOutput::Results(results) => (results, None),
        CheckOutput::Iter(iter) => match tokio::task::spawn_blocking(move || drain_iter(iter)).await {
            Ok(drained) => drained,
            Err(err) => (Vec::new(), Some(join_failure(err))),
        },
        CheckOutput::Stream(mut stream) => {
            let mut results = Vec::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        return (results, Some(InvocationFailure::from_error(FailureKind::Body, &err)));
                    }
                }
            }
            (results, None)
        }
    }
}

fn join_failure(err: tokio::task::JoinError) -> InvocationFailure {
    if err.is_panic() {
        InvocationFailure::new(FailureKind::Panic, panic_message(&*err.into_panic()))
    } else {
        InvocationFailure::new(FailureKind::Body, "blocking check task was cancelled")
    }
}

impl CheckBody {
    /// Run the body and drain its output completely.
    ///
    /// Errors and panics never escape: results produced before the failure
    /// are kept and one UNKNOWN describing the failure is appended.
    pub(crate) async fn invoke(&self, ctx: CheckContext) -> Invocation {
        match self {
            Self::Async(body) => {
                let body = body.clone();
                let run = async move {
                    match body(ctx).await {
                        Ok(output) => drain_output(output).await,
                        Err(err) => (Vec::new(), Some(InvocationFailure::from_error(FailureKind::Body, &err))),
                    }
                };
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok((results, failure)) => Invocation::finish(results, failure),
                    Err(payload) => Invocation::failed(InvocationFailure::new(
                        FailureKind::Panic,
                        panic_message(&*payload),
                    )),
                }
            }
            Self::Blocking(body) => {
                let body = body.clone();
                let joined = tokio::task::spawn_blocking(move || match body(ctx) {
                    Ok(CheckOutput::Iter(iter)) => Ok(drain_iter(iter)),
                    Ok(CheckOutput::Results(results)) => Ok((results, None)),
                    Ok(stream @ CheckOutput::Stream(_)) => Err(stream),
                    Err(err) => Ok((Vec::new(), Some(InvocationFailure::from_error(FailureKind::Body, &err)))),
                })
                .await;

                match joined {
                    Ok(Ok((results, failure))) => Invocation::finish(results, failure),
                    Ok(Err(stream)) => {
                        let (results, failure) = drain_output(stream).await;
                        Invocation::finish(results, failure)
                    }
                    Err(err) => Invocation::failed(join_failure(err)),
                }
            }
        }
    }
}

impl fmt::Debug for CheckBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Async(_) => f.write_str("Async(..)"),
            Self::Blocking(_) => f.write_str("Blocking(..)"),
        }
    }
}

struct CheckInner {
    id: CheckId,
    service_name: ServiceName,
    labels: BTreeMap<String, String>,
    targets: Vec<Environment>,
    cache_for: Option<Duration>,
    timeout: Option<Duration>,
    strategies: Vec<Arc<dyn SchedulingStrategy>>,
    requirements: Vec<Requirement>,
    arguments: BTreeMap<String, String>,
    hostname: Option<HostnameSpec>,
    body: CheckBody,
}

/// A registered unit of monitoring logic. Cheap to clone.
#[derive(Clone)]
pub struct Check {
    inner: Arc<CheckInner>,
}

impl Check {
    /// Start building a check reporting under `service_name`.
    pub fn builder(service_name: impl Into<String>) -> CheckBuilder {
        CheckBuilder {
            service_name: service_name.into(),
            namespace: String::new(),
            labels: BTreeMap::new(),
            targets: Vec::new(),
            cache_for: None,
            timeout: None,
            strategies: Vec::new(),
            requirements: Vec::new(),
            arguments: BTreeMap::new(),
            hostname: None,
            body: None,
        }
    }

    pub fn id(&self) -> &CheckId {
        &self.inner.id
    }

    pub fn service_name(&self) -> &ServiceName {
        &self.inner.service_name
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.inner.labels
    }

    pub fn targets(&self) -> &[Environment] {
        &self.inner.targets
    }

    /// Explicit cache lifetime; `None` means the application default.
    pub fn cache_for(&self) -> Option<Duration> {
        self.inner.cache_for
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn strategies(&self) -> &[Arc<dyn SchedulingStrategy>] {
        &self.inner.strategies
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.inner.requirements
    }

    /// Declared disambiguating arguments and their defaults.
    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.inner.arguments
    }

    pub fn hostname(&self) -> Option<&HostnameSpec> {
        self.inner.hostname.as_ref()
    }

    pub fn body(&self) -> &CheckBody {
        &self.inner.body
    }

    /// Effective arguments: declared defaults overridden by caller values.
    /// Undeclared caller arguments are dropped.
    pub fn effective_arguments(&self, supplied: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.inner
            .arguments
            .iter()
            .map(|(name, default)| {
                let value = supplied.get(name).unwrap_or(default);
                (name.clone(), value.clone())
            })
            .collect()
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check")
            .field("id", &self.inner.id)
            .field("targets", &self.inner.targets)
            .field("cache_for", &self.inner.cache_for)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Check`].
pub struct CheckBuilder {
    service_name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    targets: Vec<Environment>,
    cache_for: Option<Duration>,
    timeout: Option<Duration>,
    strategies: Vec<Arc<dyn SchedulingStrategy>>,
    requirements: Vec<Requirement>,
    arguments: BTreeMap<String, String>,
    hostname: Option<HostnameSpec>,
    body: Option<CheckBody>,
}

impl CheckBuilder {
    /// Qualifier separating same-named checks declared in different places.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn target(mut self, environment: &Environment) -> Self {
        if !self.targets.contains(environment) {
            self.targets.push(environment.clone());
        }
        self
    }

    pub fn targets<'a>(mut self, environments: impl IntoIterator<Item = &'a Environment>) -> Self {
        for environment in environments {
            self = self.target(environment);
        }
        self
    }

    /// Results stay fresh this long. Zero disables caching.
    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.cache_for = Some(ttl);
        self
    }

    /// Per-invocation timeout overriding the application default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scheduling(mut self, strategy: impl SchedulingStrategy + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn scheduling_arc(mut self, strategy: Arc<dyn SchedulingStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Declare a datasource dependency by resource type.
    pub fn requires<T: Any + Send + Sync>(mut self) -> Self {
        let requirement = Requirement::of::<T>();
        if !self.requirements.contains(&requirement) {
            self.requirements.push(requirement);
        }
        self
    }

    /// Declare a disambiguating argument with its default value.
    pub fn argument(mut self, name: impl Into<String>, default: impl Into<String>) -> Self {
        self.arguments.insert(name.into(), default.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<HostnameSpec>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn run<F, Fut, O>(mut self, body: F) -> Self
    where
        F: Fn(CheckContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Into<CheckOutput>,
    {
        let body = Arc::new(move |ctx: CheckContext| {
            let fut = body(ctx);
            async move { fut.await.map(Into::into) }.boxed()
        });
        self.body = Some(CheckBody::Async(body));
        self
    }

    pub fn run_blocking<F, O>(mut self, body: F) -> Self
    where
        F: Fn(CheckContext) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<CheckOutput>,
    {
        let body = Arc::new(move |ctx: CheckContext| body(ctx).map(Into::into));
        self.body = Some(CheckBody::Blocking(body));
        self
    }

    pub fn build(self) -> Result<Check, ConfigError> {
        let id = CheckId::qualified(&self.namespace, &self.service_name);

        if self.targets.is_empty() {
            return Err(ConfigError::EmptyTargets(id.into_inner()));
        }
        let Some(body) = self.body else {
            return Err(ConfigError::MissingBody(id.into_inner()));
        };

        let mut strategies = self.strategies;
        if strategies.is_empty() {
            strategies.push(Arc::new(AnyExecutionEnvironment));
        }

        Ok(Check {
            inner: Arc::new(CheckInner {
                id,
                service_name: ServiceName::new(self.service_name),
                labels: self.labels,
                targets: self.targets,
                cache_for: self.cache_for,
                timeout: self.timeout,
                strategies,
                requirements: self.requirements,
                arguments: self.arguments,
                hostname: self.hostname,
                body,
            }),
        })
    }
}
