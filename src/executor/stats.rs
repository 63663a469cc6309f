use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::key::ExecutionKey;
use crate::check::{FailureKind, InvocationFailure};

/// Running counters kept by the executor.
#[derive(Debug, Default)]
pub(crate) struct ExecutorCounters {
    cache_hits: AtomicU64,
    owned_invocations: AtomicU64,
    fan_ins: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    cache_warnings: AtomicU64,
}

impl ExecutorCounters {
    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn owned_invocation(&self) {
        self.owned_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fan_in(&self) {
        self.fan_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_warning(&self) {
        self.cache_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, in_flight: usize) -> ExecutorStatistics {
        ExecutorStatistics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            owned_invocations: self.owned_invocations.load(Ordering::Relaxed),
            fan_ins: self.fan_ins.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cache_warnings: self.cache_warnings.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// Point-in-time view of the executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStatistics {
    pub cache_hits: u64,
    pub owned_invocations: u64,
    pub fan_ins: u64,
    /// Owned invocations that ended in a failure
    pub errors: u64,
    /// Check/target pairs not run because scheduling said no
    pub skipped: u64,
    pub cache_warnings: u64,
    pub in_flight: usize,
}

impl ExecutorStatistics {
    /// Share of served requests that did not need their own invocation.
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.cache_hits + self.owned_invocations + self.fan_ins;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits + self.fan_ins) as f64 / total as f64
        }
    }
}

/// Latest failure for one execution key.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub key: String,
    pub check: String,
    pub environment: String,
    pub kind: FailureKind,
    pub message: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Upper bound on standing error records.
const MAX_ERROR_RECORDS: usize = 1_000;

/// Errors currently standing, one per key. A later success clears the entry.
///
/// When full, recording a new key drops the oldest record.
#[derive(Debug)]
pub(crate) struct ErrorLog {
    records: Mutex<HashMap<String, ErrorRecord>>,
    max_records: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_max_records(MAX_ERROR_RECORDS)
    }
}

impl ErrorLog {
    pub(crate) fn with_max_records(max_records: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_records: max_records.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ErrorRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn record(&self, key: &ExecutionKey, failure: &InvocationFailure, timestamp: DateTime<Utc>) {
        let rendered = key.to_string();
        let record = ErrorRecord {
            key: rendered.clone(),
            check: key.check.to_string(),
            environment: key.environment.clone(),
            kind: failure.kind,
            message: failure.message.clone(),
            detail: failure.detail.clone(),
            timestamp,
        };
        let mut records = self.lock();
        if !records.contains_key(&rendered) && records.len() >= self.max_records {
            let oldest = records
                .values()
                .min_by_key(|standing| standing.timestamp)
                .map(|standing| standing.key.clone());
            if let Some(oldest) = oldest {
                records.remove(&oldest);
            }
        }
        records.insert(rendered, record);
    }

    pub(crate) fn clear(&self, key: &ExecutionKey) {
        self.lock().remove(&key.to_string());
    }

    /// Sorted by key.
    pub(crate) fn list(&self) -> Vec<ErrorRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}
