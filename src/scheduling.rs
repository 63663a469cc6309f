//! Scheduling strategies: may a check run here, against that target, now?
//!
//! Strategies are attached to checks and to datasource factories. At run time
//! every applicable strategy is asked for a [`SchedulingDecision`] and the most
//! restrictive answer wins. At registration time the structural
//! [`StrategyConstraint`]s of all strategies are combined and checked for
//! combinations that can never be satisfied.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::ConfigError;
use crate::types::CheckId;

/// Outcome of a scheduling evaluation, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulingDecision {
    /// Eligible to run now.
    Schedule,
    /// Temporarily unfavourable. Reuse the last stored results, even if stale.
    Skip,
    /// Never report this check from the current execution environment.
    DontSchedule,
}

impl SchedulingDecision {
    /// Combine two decisions, keeping the more restrictive one.
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Whether a run was triggered by the regular schedule or explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Scheduled,
    OnDemand,
}

/// Everything a strategy may look at when deciding.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingContext<'a> {
    pub check: &'a CheckId,
    pub execution_environment: &'a Environment,
    pub target_environment: &'a Environment,
    pub mode: RunMode,
}

/// Structural requirement a strategy imposes, used for registration checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyConstraint {
    None,
    ExecutionEnvironments(Vec<Environment>),
    TargetEnvironments(Vec<Environment>),
    CurrentIsTarget,
}

impl StrategyConstraint {
    /// Environments referenced by this constraint.
    pub fn environments(&self) -> &[Environment] {
        match self {
            Self::ExecutionEnvironments(envs) | Self::TargetEnvironments(envs) => envs,
            Self::None | Self::CurrentIsTarget => &[],
        }
    }
}

/// Pluggable scheduling logic.
pub trait SchedulingStrategy: Send + Sync + fmt::Debug {
    fn schedule(&self, ctx: &SchedulingContext<'_>) -> SchedulingDecision;

    fn constraint(&self) -> StrategyConstraint {
        StrategyConstraint::None
    }
}

/// Run only from the listed execution environments.
#[derive(Debug, Clone)]
pub struct MustRunInExecutionEnvironments {
    environments: Vec<Environment>,
}

impl MustRunInExecutionEnvironments {
    pub fn new(environments: impl IntoIterator<Item = Environment>) -> Self {
        Self {
            environments: environments.into_iter().collect(),
        }
    }
}

impl SchedulingStrategy for MustRunInExecutionEnvironments {
    fn schedule(&self, ctx: &SchedulingContext<'_>) -> SchedulingDecision {
        if self.environments.contains(ctx.execution_environment) {
            SchedulingDecision::Schedule
        } else {
            SchedulingDecision::DontSchedule
        }
    }

    fn constraint(&self) -> StrategyConstraint {
        StrategyConstraint::ExecutionEnvironments(self.environments.clone())
    }
}

/// Run from any execution environment. The default for checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyExecutionEnvironment;

impl SchedulingStrategy for AnyExecutionEnvironment {
    fn schedule(&self, _ctx: &SchedulingContext<'_>) -> SchedulingDecision {
        SchedulingDecision::Schedule
    }
}

/// Never run from the regular schedule; only when explicitly requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnDemandOnly;

impl SchedulingStrategy for OnDemandOnly {
    fn schedule(&self, ctx: &SchedulingContext<'_>) -> SchedulingDecision {
        match ctx.mode {
            RunMode::OnDemand => SchedulingDecision::Schedule,
            RunMode::Scheduled => SchedulingDecision::DontSchedule,
        }
    }
}

/// The execution environment must be the target environment itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct MustRunInTargetEnvironment;

impl SchedulingStrategy for MustRunInTargetEnvironment {
    fn schedule(&self, ctx: &SchedulingContext<'_>) -> SchedulingDecision {
        if ctx.execution_environment == ctx.target_environment {
            SchedulingDecision::Schedule
        } else {
            SchedulingDecision::DontSchedule
        }
    }

    fn constraint(&self) -> StrategyConstraint {
        StrategyConstraint::CurrentIsTarget
    }
}

/// Only observe the listed target environments.
#[derive(Debug, Clone)]
pub struct MustRunAgainstTargetEnvironments {
    environments: Vec<Environment>,
}

impl MustRunAgainstTargetEnvironments {
    pub fn new(environments: impl IntoIterator<Item = Environment>) -> Self {
        Self {
            environments: environments.into_iter().collect(),
        }
    }
}

impl SchedulingStrategy for MustRunAgainstTargetEnvironments {
    fn schedule(&self, ctx: &SchedulingContext<'_>) -> SchedulingDecision {
        if self.environments.contains(ctx.target_environment) {
            SchedulingDecision::Schedule
        } else {
            SchedulingDecision::DontSchedule
        }
    }

    fn constraint(&self) -> StrategyConstraint {
        StrategyConstraint::TargetEnvironments(self.environments.clone())
    }
}

type SkipPredicate = dyn Fn(&SchedulingContext<'_>) -> bool + Send + Sync;

/// Skip (reusing previous results) whenever the predicate holds.
///
/// Useful for maintenance windows or a dependency known to be down.
#[derive(Clone)]
pub struct SkipWhen {
    label: String,
    predicate: Arc<SkipPredicate>,
}

impl SkipWhen {
    pub fn new(
        label: impl Into<String>,
        predicate: impl Fn(&SchedulingContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for SkipWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SkipWhen").field(&self.label).finish()
    }
}

impl SchedulingStrategy for SkipWhen {
    fn schedule(&self, ctx: &SchedulingContext<'_>) -> SchedulingDecision {
        if (self.predicate)(ctx) {
            SchedulingDecision::Skip
        } else {
            SchedulingDecision::Schedule
        }
    }
}

/// Evaluate all strategies and combine their decisions.
///
/// An empty strategy list schedules.
pub fn decide<'a>(
    strategies: impl IntoIterator<Item = &'a Arc<dyn SchedulingStrategy>>,
    ctx: &SchedulingContext<'_>,
) -> SchedulingDecision {
    strategies
        .into_iter()
        .map(|strategy| strategy.schedule(ctx))
        .fold(SchedulingDecision::Schedule, SchedulingDecision::combine)
}

fn intersect(sets: &[&[Environment]]) -> Option<HashSet<Environment>> {
    let (first, rest) = sets.split_first()?;
    let mut acc: HashSet<Environment> = first.iter().cloned().collect();
    for set in rest {
        acc.retain(|env| set.contains(env));
    }
    Some(acc)
}

/// Reject strategy combinations that can never be scheduled anywhere.
///
/// The constraints of the check's own strategies and those of every datasource
/// it requires are combined:
/// * all execution-environment restrictions must share at least one environment,
/// * all target-environment restrictions must admit every declared target,
/// * if execution must equal target, the two allowed sets must overlap.
pub fn validate_constraints<'a>(
    check: &CheckId,
    targets: &[Environment],
    strategies: impl IntoIterator<Item = &'a Arc<dyn SchedulingStrategy>>,
) -> Result<(), ConfigError> {
    let constraints: Vec<StrategyConstraint> =
        strategies.into_iter().map(|s| s.constraint()).collect();

    let invalid = |reason: &str| ConfigError::InvalidCheckConfiguration {
        check: check.to_string(),
        reason: reason.to_string(),
    };

    let execution_sets: Vec<&[Environment]> = constraints
        .iter()
        .filter_map(|c| match c {
            StrategyConstraint::ExecutionEnvironments(envs) => Some(envs.as_slice()),
            _ => None,
        })
        .collect();
    let target_sets: Vec<&[Environment]> = constraints
        .iter()
        .filter_map(|c| match c {
            StrategyConstraint::TargetEnvironments(envs) => Some(envs.as_slice()),
            _ => None,
        })
        .collect();
    let current_is_target = constraints
        .iter()
        .any(|c| matches!(c, StrategyConstraint::CurrentIsTarget));

    let allowed_execution = intersect(&execution_sets);
    if let Some(allowed) = &allowed_execution {
        if allowed.is_empty() {
            return Err(invalid(
                "conflicting execution-environment constraints: no execution environment satisfies all of them",
            ));
        }
    }

    let allowed_targets = intersect(&target_sets);
    if let Some(allowed) = &allowed_targets {
        if let Some(missing) = targets.iter().find(|env| !allowed.contains(*env)) {
            return Err(invalid(&format!(
                "declared target environment `{}` is excluded by a target-environment constraint",
                missing
            )));
        }
    }

    if current_is_target {
        if let Some(execution) = &allowed_execution {
            let candidates: HashSet<&Environment> = match &allowed_targets {
                Some(allowed) => allowed.iter().collect(),
                None => targets.iter().collect(),
            };
            if execution.iter().all(|env| !candidates.contains(env)) {
                return Err(invalid(
                    "execution must equal target, but allowed execution and target environments do not overlap",
                ));
            }
        }
    }

    Ok(())
}
