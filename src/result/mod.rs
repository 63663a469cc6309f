//! Check outcomes and their aggregation.
//!
//! A check invocation yields an ordered list of [`CheckResult`]s. After
//! hostname and service-name resolution each becomes an [`ExecutionResult`],
//! which is what the encoder turns into Checkmk output.

pub mod builder;
pub mod encoder;
#[cfg(test)]
pub(crate) mod parser;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Hostname;

pub use builder::{ResultBuilder, build_result};
pub use encoder::{OutputFormat, encode_own_service, render};

/// Service state, in Checkmk's own numbering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckState {
    Ok,
    Warn,
    Crit,
    Unknown,
}

impl CheckState {
    /// Numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warn => 1,
            Self::Crit => 2,
            Self::Unknown => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Warn),
            2 => Some(Self::Crit),
            3 => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Crit => "CRIT",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn is_determinate(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduce many states to the one reported for a check.
///
/// UNKNOWN means "could not determine" and does not outrank a determinate
/// answer: the most severe of OK/WARN/CRIT wins if any is present, and only
/// an all-UNKNOWN (or empty) input aggregates to UNKNOWN.
pub fn aggregate_state(states: impl IntoIterator<Item = CheckState>) -> CheckState {
    states
        .into_iter()
        .filter(|state| state.is_determinate())
        .max()
        .unwrap_or(CheckState::Unknown)
}

/// Warning and critical levels (or lower/upper boundaries) of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Thresholds {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// A named numeric value attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Thresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundaries: Option<Thresholds>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            levels: None,
            boundaries: None,
        }
    }

    pub fn with_levels(mut self, warning: f64, critical: f64) -> Self {
        self.levels = Some(Thresholds::new(warning, critical));
        self
    }

    pub fn with_boundaries(mut self, min: f64, max: f64) -> Self {
        self.boundaries = Some(Thresholds::new(min, max));
        self
    }

    /// Name restricted to characters Checkmk accepts in metric names.
    pub fn sanitized_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.is_empty() { "_".to_string() } else { name }
    }
}

pub(crate) fn normalize_details(details: Option<String>) -> Option<String> {
    details.filter(|d| !d.trim().is_empty())
}

/// One outcome reported by a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub state: CheckState,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Appended to the check's service name, so one check can report several services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
    /// Hostname template overriding every other hostname source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_hostname: Option<String>,
}

impl CheckResult {
    pub fn new(state: CheckState, summary: impl Into<String>) -> Self {
        Self {
            state,
            summary: summary.into(),
            details: None,
            name_suffix: None,
            metrics: Vec::new(),
            alternative_hostname: None,
        }
    }

    pub fn ok(summary: impl Into<String>) -> Self {
        Self::new(CheckState::Ok, summary)
    }

    pub fn warn(summary: impl Into<String>) -> Self {
        Self::new(CheckState::Warn, summary)
    }

    pub fn crit(summary: impl Into<String>) -> Self {
        Self::new(CheckState::Crit, summary)
    }

    pub fn unknown(summary: impl Into<String>) -> Self {
        Self::new(CheckState::Unknown, summary)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = normalize_details(Some(details.into()));
        self
    }

    pub fn with_name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.name_suffix = Some(suffix.into());
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn with_alternative_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.alternative_hostname = Some(hostname.into());
        self
    }

    /// The placeholder reported when a check body produced nothing.
    pub fn no_results() -> Self {
        Self::unknown("CHECK CODE ERROR: no results returned").with_details(
            "The check returned no results. Verify whether there is a circumstance \
             in which it does not return any results, and remediate this.",
        )
    }
}

/// A result bound to its piggyback host and final service name, ready to encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub piggyback_host: Hostname,
    pub service_name: String,
    pub service_labels: BTreeMap<String, String>,
    pub environment: String,
    pub state: CheckState,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
}
