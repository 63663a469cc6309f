//! Key-aware executor.
//!
//! Every unit of work is identified by an [`ExecutionKey`]. A key is served
//! from the cache while its entry is fresh. Otherwise exactly one caller wins
//! admission and runs the work; callers arriving while it is in flight
//! subscribe to its outcome instead of running it again.
//!
//! ```text
//! caller A ─┐                 ┌─ fresh entry ──────────────► A, B, C
//! caller B ─┼─► cache lookup ─┤
//! caller C ─┘                 └─ miss ─► admission ─► A runs the work
//!                                           │              │
//!                                   B, C subscribe ◄── broadcast outcome
//! ```
//!
//! Settlement order for the winner: store in the cache, drop the admission
//! entry, broadcast. If the winner is cancelled its admission entry is removed
//! on drop, nothing is cached and waiters retry from the lookup.

mod key;
mod stats;

pub use key::{CHECK_NAMESPACE, ExecutionKey};
pub use stats::{ErrorRecord, ExecutorStatistics};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, warn};

use crate::cache::{Cache, CacheError};
use crate::check::{FailureKind, Invocation, InvocationFailure};
use crate::result::{CheckResult, CheckState};
use stats::{ErrorLog, ExecutorCounters};

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Distinct keys allowed to run at the same time.
    pub max_concurrency: usize,
    /// Applied when a check has no timeout of its own.
    pub default_timeout: Duration,
    /// State reported for a timed out invocation.
    pub timeout_state: CheckState,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            default_timeout: Duration::from_secs(30),
            timeout_state: CheckState::Unknown,
        }
    }
}

/// How a key was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    Cache,
    Owned,
    FanIn,
}

/// Outcome handed to a caller of [`KeyAwareExecutor::execute`].
#[derive(Debug, Clone)]
pub struct Served {
    pub key: ExecutionKey,
    pub invocation: Arc<Invocation>,
    pub from: ServedFrom,
}

impl Served {
    pub fn results(&self) -> &[CheckResult] {
        &self.invocation.results
    }

    pub fn failed(&self) -> bool {
        self.invocation.failure.is_some()
    }
}

type Outcome = Arc<Invocation>;
type InFlight = HashMap<ExecutionKey, broadcast::Sender<Outcome>>;

fn lock(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Admission {
    Winner(AdmissionGuard),
    Waiter(broadcast::Receiver<Outcome>),
}

/// Held by the caller that won admission for a key.
struct AdmissionGuard {
    key: ExecutionKey,
    in_flight: Arc<Mutex<InFlight>>,
    sender: Option<broadcast::Sender<Outcome>>,
}

impl AdmissionGuard {
    fn settle(mut self, outcome: Outcome) {
        let sender = self.sender.take();
        lock(&self.in_flight).remove(&self.key);

        if let Some(sender) = sender {
            let waiters = sender.receiver_count();
            let _ = sender.send(outcome);
            if waiters > 0 {
                debug!(key = %self.key, waiters, "Broadcast outcome to waiters");
            }
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            lock(&self.in_flight).remove(&self.key);
            debug!(key = %self.key, "Admission abandoned before settling");
        }
    }
}

/// Runs work at most once per key at a time and at most once per TTL window.
pub struct KeyAwareExecutor {
    cache: Cache,
    in_flight: Arc<Mutex<InFlight>>,
    permits: Semaphore,
    counters: ExecutorCounters,
    errors: ErrorLog,
    config: ExecutorConfig,
}

impl KeyAwareExecutor {
    pub fn new(cache: Cache, config: ExecutorConfig) -> Self {
        Self {
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            permits: Semaphore::new(config.max_concurrency.max(1)),
            counters: ExecutorCounters::default(),
            errors: ErrorLog::default(),
            config,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Serve `key`, running `work` only if this caller wins admission.
    ///
    /// A `ttl` of zero bypasses the cache entirely; concurrent callers are
    /// still deduplicated. `timeout` falls back to the configured default.
    pub async fn execute<F, Fut>(
        &self,
        key: ExecutionKey,
        ttl: Duration,
        timeout: Option<Duration>,
        work: F,
    ) -> Served
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Invocation>,
    {
        let cache_key = key.cache_key();

        let guard = loop {
            if !ttl.is_zero() {
                if let Some(results) = self.lookup(&key).await {
                    self.counters.cache_hit();
                    debug!(key = %key, "Served from cache");
                    return Served {
                        key,
                        invocation: Arc::new(Invocation {
                            results,
                            failure: None,
                        }),
                        from: ServedFrom::Cache,
                    };
                }
            }

            match self.admit(&key) {
                Admission::Winner(guard) => {
                    // A peer may have stored and settled between the lookup and admission.
                    if !ttl.is_zero() {
                        if let Some(results) = self.lookup(&key).await {
                            self.counters.cache_hit();
                            debug!(key = %key, "Served from cache after admission");
                            let invocation = Arc::new(Invocation {
                                results,
                                failure: None,
                            });
                            guard.settle(invocation.clone());
                            return Served {
                                key,
                                invocation,
                                from: ServedFrom::Cache,
                            };
                        }
                    }
                    break guard;
                }
                Admission::Waiter(mut receiver) => match receiver.recv().await {
                    Ok(invocation) => {
                        self.counters.fan_in();
                        debug!(key = %key, "Served by fan-in");
                        return Served {
                            key,
                            invocation,
                            from: ServedFrom::FanIn,
                        };
                    }
                    Err(_) => {
                        debug!(key = %key, "In-flight invocation went away, retrying");
                    }
                },
            }
        };

        let invocation = self.run_owned(&key, timeout, work).await;
        self.counters.owned_invocation();

        match &invocation.failure {
            Some(failure) => {
                self.counters.error();
                self.errors.record(&key, failure, self.cache.clock().now());
                warn!(key = %key, kind = ?failure.kind, "Invocation failed: {}", failure.message);
            }
            None => self.errors.clear(&key),
        }

        if !ttl.is_zero() {
            if let Err(err) = self.cache.set(cache_key, &invocation.results, ttl).await {
                self.cache_warning(&key, "store", &err);
            }
        }

        let invocation = Arc::new(invocation);
        guard.settle(invocation.clone());

        Served {
            key,
            invocation,
            from: ServedFrom::Owned,
        }
    }

    /// Last stored results for `key`, even if no longer fresh.
    pub async fn last_results(&self, key: &ExecutionKey) -> Option<Vec<CheckResult>> {
        match self.cache.get_any::<Vec<CheckResult>>(&key.cache_key()).await {
            Ok(cached) => cached.map(|cached| cached.value),
            Err(err) => {
                self.cache_warning(key, "read", &err);
                None
            }
        }
    }

    pub async fn invalidate(&self, key: &ExecutionKey) -> Result<(), CacheError> {
        self.cache.invalidate(&key.cache_key()).await
    }

    /// Count a check/target pair that scheduling kept from running.
    pub fn record_skipped(&self) {
        self.counters.skipped();
    }

    pub fn statistics(&self) -> ExecutorStatistics {
        self.counters.snapshot(self.in_flight_count())
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.list()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    async fn lookup(&self, key: &ExecutionKey) -> Option<Vec<CheckResult>> {
        match self.cache.get::<Vec<CheckResult>>(&key.cache_key()).await {
            Ok(hit) => hit.map(|cached| cached.value),
            Err(err) => {
                self.cache_warning(key, "read", &err);
                None
            }
        }
    }

    fn cache_warning(&self, key: &ExecutionKey, operation: &str, err: &CacheError) {
        self.counters.cache_warning();
        warn!(
            key = %key,
            backend = self.cache.backend_name(),
            operation,
            "Cache {} failed, continuing without it: {}",
            operation,
            err
        );
    }

    fn admit(&self, key: &ExecutionKey) -> Admission {
        let mut in_flight = lock(&self.in_flight);

        if let Some(sender) = in_flight.get(key) {
            return Admission::Waiter(sender.subscribe());
        }

        let (sender, _) = broadcast::channel(1);
        in_flight.insert(key.clone(), sender.clone());
        debug!(key = %key, in_flight = in_flight.len(), "Admitted");
        Admission::Winner(AdmissionGuard {
            key: key.clone(),
            in_flight: self.in_flight.clone(),
            sender: Some(sender),
        })
    }

    async fn run_owned<F, Fut>(&self, key: &ExecutionKey, timeout: Option<Duration>, work: F) -> Invocation
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Invocation>,
    {
        // The semaphore is never closed, so a permit is always handed out.
        let _permit = self.permits.acquire().await.ok();
        let limit = timeout.unwrap_or(self.config.default_timeout);

        match tokio::time::timeout(limit, work()).await {
            Ok(invocation) => invocation,
            Err(_) => {
                warn!(key = %key, timeout = ?limit, "Invocation timed out");
                let failure = InvocationFailure::new(
                    FailureKind::Timeout,
                    format!("Check timed out after {}", humanize(limit)),
                );
                Invocation {
                    results: vec![CheckResult::new(self.config.timeout_state, failure.message.clone())],
                    failure: Some(failure),
                }
            }
        }
    }

    #[cfg(test)]
    fn waiters(&self, key: &ExecutionKey) -> usize {
        lock(&self.in_flight)
            .get(key)
            .map_or(0, |sender| sender.receiver_count())
    }
}

fn humanize(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
