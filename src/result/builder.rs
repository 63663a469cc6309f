//! Incremental result building.
//!
//! A check that inspects several aspects of one system can record a partial
//! finding per aspect and turn them into one [`CheckResult`] at the end.

use super::{CheckResult, CheckState, Metric, aggregate_state};

#[derive(Debug, Clone)]
struct Partial {
    state: CheckState,
    summary: String,
    details: Option<String>,
}

impl Partial {
    fn render(&self) -> String {
        match &self.details {
            Some(details) => format!("{}:\n{}\n", self.summary, details),
            None => format!("{}\n", self.summary),
        }
    }
}

/// Accumulates partial findings and finalizes into one result.
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    ok_summary: String,
    fail_summary: String,
    base_details: Option<String>,
    name_suffix: Option<String>,
    metrics: Vec<Metric>,
    alternative_hostname: Option<String>,
    partials: Vec<Partial>,
}

/// Start a result that reports `ok_summary` when all partials are OK and
/// `fail_summary` otherwise.
pub fn build_result(ok_summary: impl Into<String>, fail_summary: impl Into<String>) -> ResultBuilder {
    ResultBuilder {
        ok_summary: ok_summary.into(),
        fail_summary: fail_summary.into(),
        base_details: None,
        name_suffix: None,
        metrics: Vec::new(),
        alternative_hostname: None,
        partials: Vec::new(),
    }
}

impl ResultBuilder {
    pub fn base_details(mut self, details: impl Into<String>) -> Self {
        self.base_details = super::normalize_details(Some(details.into()));
        self
    }

    pub fn name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.name_suffix = Some(suffix.into());
        self
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn alternative_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.alternative_hostname = Some(hostname.into());
        self
    }

    fn push(&mut self, state: CheckState, summary: impl Into<String>, details: Option<String>) {
        self.partials.push(Partial {
            state,
            summary: summary.into(),
            details: super::normalize_details(details),
        });
    }

    pub fn ok(&mut self, summary: impl Into<String>) {
        self.push(CheckState::Ok, summary, None);
    }

    pub fn warn(&mut self, summary: impl Into<String>) {
        self.push(CheckState::Warn, summary, None);
    }

    pub fn crit(&mut self, summary: impl Into<String>) {
        self.push(CheckState::Crit, summary, None);
    }

    pub fn unknown(&mut self, summary: impl Into<String>) {
        self.push(CheckState::Unknown, summary, None);
    }

    /// Record a partial with long-form details.
    pub fn add(&mut self, state: CheckState, summary: impl Into<String>, details: impl Into<String>) {
        self.push(state, summary, Some(details.into()));
    }

    /// Record an existing result as a partial (summary and details only).
    pub fn add_result(&mut self, result: CheckResult) {
        self.push(result.state, result.summary, result.details);
    }

    /// Current aggregated state. OK while nothing has been recorded.
    pub fn state(&self) -> CheckState {
        if self.partials.is_empty() {
            return CheckState::Ok;
        }
        aggregate_state(self.partials.iter().map(|p| p.state))
    }

    pub fn finish(self) -> CheckResult {
        let state = self.state();

        let details = if self.base_details.is_some() || !self.partials.is_empty() {
            let base = self.base_details.unwrap_or_default();
            let rendered: Vec<String> = self.partials.iter().map(Partial::render).collect();
            let combined = if rendered.is_empty() {
                base
            } else {
                format!("{}\n\n{}", base, rendered.join("\n"))
            };
            super::normalize_details(Some(combined.trim().to_string()))
        } else {
            None
        };

        let summary = if state == CheckState::Ok {
            self.ok_summary
        } else {
            self.fail_summary
        };

        CheckResult {
            state,
            summary,
            details,
            name_suffix: self.name_suffix,
            metrics: self.metrics,
            alternative_hostname: self.alternative_hostname,
        }
    }
}

impl From<ResultBuilder> for CheckResult {
    fn from(builder: ResultBuilder) -> Self {
        builder.finish()
    }
}
