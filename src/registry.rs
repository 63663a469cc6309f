use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::check::{Check, CheckContext, FailureKind, Invocation, InvocationFailure};
use crate::datasource::{DatasourceFactory, RegisteredDatasource, Resources};
use crate::environment::{Environment, EnvironmentRegistry};
use crate::error::{ConfigError, ResolveError};
use crate::scheduling::{self, RunMode, SchedulingContext, SchedulingDecision, SchedulingStrategy};
use crate::types::CheckId;

/// Source of truth for checks and datasource factories.
///
/// Built at startup, then shared read-only. Checks are kept in registration
/// order, which is the presentation order of every run.
pub struct CheckRegistry {
    environments: Arc<EnvironmentRegistry>,
    checks: Vec<Check>,
    index: HashMap<CheckId, usize>,
    datasources: HashMap<TypeId, Arc<RegisteredDatasource>>,
}

impl CheckRegistry {
    pub fn new(environments: Arc<EnvironmentRegistry>) -> Self {
        Self {
            environments,
            checks: Vec::new(),
            index: HashMap::new(),
            datasources: HashMap::new(),
        }
    }

    pub fn environments(&self) -> &Arc<EnvironmentRegistry> {
        &self.environments
    }

    fn ensure_known(
        &self,
        owner: &str,
        strategies: &[Arc<dyn SchedulingStrategy>],
    ) -> Result<(), ConfigError> {
        for strategy in strategies {
            let constraint = strategy.constraint();
            if let Some(foreign) = constraint
                .environments()
                .iter()
                .find(|env| !self.environments.contains(env))
            {
                return Err(ConfigError::UnknownEnvironment {
                    owner: owner.to_string(),
                    environment: foreign.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Register a datasource factory. One factory per resource type.
    pub fn register_datasource<F: DatasourceFactory>(&mut self, factory: F) -> Result<(), ConfigError> {
        let registered = RegisteredDatasource::new(factory);
        if self.datasources.contains_key(&registered.type_id()) {
            return Err(ConfigError::DuplicateDatasource(registered.name().to_string()));
        }
        self.ensure_known(registered.name(), registered.strategies())?;

        info!(
            "Registered datasource {} ({})",
            registered.name(),
            registered.type_name()
        );
        self.datasources
            .insert(registered.type_id(), Arc::new(registered));
        Ok(())
    }

    pub fn has_datasource<T: std::any::Any>(&self) -> bool {
        self.datasources.contains_key(&TypeId::of::<T>())
    }

    /// Register a check.
    ///
    /// Rejects duplicate identities, targets or strategy environments from
    /// another registry, undeclared datasources and strategy combinations
    /// that can never be scheduled.
    pub fn register(&mut self, check: Check) -> Result<(), ConfigError> {
        let id = check.id().clone();
        if self.index.contains_key(&id) {
            return Err(ConfigError::DuplicateCheck(id.into_inner()));
        }
        if check.targets().is_empty() {
            return Err(ConfigError::EmptyTargets(id.into_inner()));
        }
        if let Some(foreign) = check
            .targets()
            .iter()
            .find(|env| !self.environments.contains(env))
        {
            return Err(ConfigError::UnknownEnvironment {
                owner: id.to_string(),
                environment: foreign.name().to_string(),
            });
        }
        self.ensure_known(id.as_str(), check.strategies())?;

        let mut strategies: Vec<Arc<dyn SchedulingStrategy>> = check.strategies().to_vec();
        for requirement in check.requirements() {
            let datasource = self.datasources.get(&requirement.type_id).ok_or_else(|| {
                ConfigError::UnknownDatasource {
                    check: id.to_string(),
                    datasource: requirement.type_name.to_string(),
                }
            })?;
            strategies.extend(datasource.strategies().iter().cloned());
        }
        scheduling::validate_constraints(&id, check.targets(), &strategies)?;

        debug!(check = %id, targets = check.targets().len(), "Registered check");
        self.index.insert(id, self.checks.len());
        self.checks.push(check);
        Ok(())
    }

    /// All checks in registration order.
    pub fn list_checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn get(&self, id: &str) -> Option<&Check> {
        self.index.get(id).map(|&i| &self.checks[i])
    }

    /// Bind a check to its datasources for one invocation.
    ///
    /// Every required datasource's strategies are evaluated against the
    /// current execution environment; anything but SCHEDULE makes the
    /// datasource unavailable. Resources themselves are acquired lazily by
    /// [`BoundInvocation::invoke`].
    pub fn resolve(
        &self,
        check: &Check,
        execution_environment: &Environment,
        target: &Environment,
        arguments: &BTreeMap<String, String>,
        mode: RunMode,
    ) -> Result<BoundInvocation, ResolveError> {
        let ctx = SchedulingContext {
            check: check.id(),
            execution_environment,
            target_environment: target,
            mode,
        };

        let mut datasources = Vec::with_capacity(check.requirements().len());
        for requirement in check.requirements() {
            let datasource = self
                .datasources
                .get(&requirement.type_id)
                .ok_or_else(|| ResolveError::MissingDatasource(requirement.type_name.to_string()))?;

            if scheduling::decide(datasource.strategies(), &ctx) != SchedulingDecision::Schedule {
                return Err(ResolveError::DatasourceNotAvailable {
                    datasource: datasource.name().to_string(),
                    execution_environment: execution_environment.name().to_string(),
                });
            }
            datasources.push(datasource.clone());
        }

        Ok(BoundInvocation {
            check: check.clone(),
            execution_environment: execution_environment.clone(),
            target: target.clone(),
            arguments: check.effective_arguments(arguments),
            datasources,
        })
    }
}

/// A check with its datasources resolved, ready to call once.
pub struct BoundInvocation {
    check: Check,
    execution_environment: Environment,
    target: Environment,
    arguments: BTreeMap<String, String>,
    datasources: Vec<Arc<RegisteredDatasource>>,
}

impl BoundInvocation {
    /// Acquire resources, run the body, release resources.
    ///
    /// Release happens on both success and failure. If the returned future is
    /// dropped mid-flight, resources are dropped without an explicit release.
    pub async fn invoke(self) -> Invocation {
        let mut resources = Resources::default();
        let mut acquired = Vec::with_capacity(self.datasources.len());

        for (datasource, requirement) in self.datasources.iter().zip(self.check.requirements()) {
            match datasource.acquire(&self.execution_environment).await {
                Ok(resource) => {
                    resources.insert(*requirement, resource.clone());
                    acquired.push((datasource.clone(), resource));
                }
                Err(err) => {
                    let err = anyhow::Error::new(ResolveError::AcquisitionFailed {
                        datasource: datasource.name().to_string(),
                        message: format!("{:#}", err),
                    });
                    release_all(acquired).await;
                    return Invocation::failed(InvocationFailure::from_error(
                        FailureKind::Acquisition,
                        &err,
                    ));
                }
            }
        }

        let ctx = CheckContext {
            check: self.check.id().clone(),
            service_name: self.check.service_name().clone(),
            target: self.target,
            execution_environment: self.execution_environment,
            arguments: self.arguments,
            resources,
        };

        let invocation = self.check.body().invoke(ctx).await;
        release_all(acquired).await;
        invocation
    }
}

async fn release_all(acquired: Vec<(Arc<RegisteredDatasource>, crate::datasource::AnyResource)>) {
    for (datasource, resource) in acquired.into_iter().rev() {
        datasource.release(resource).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DatasourceLifetime;
    use crate::result::{CheckResult, CheckState};
    use crate::scheduling::MustRunInExecutionEnvironments;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Database;

    struct DatabaseFactory {
        strategies: Vec<Arc<dyn SchedulingStrategy>>,
        fail: bool,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatasourceFactory for DatabaseFactory {
        type Resource = Database;

        fn name(&self) -> &str {
            "Database"
        }

        fn scheduling_strategies(&self) -> Vec<Arc<dyn SchedulingStrategy>> {
            self.strategies.clone()
        }

        fn lifetime(&self) -> DatasourceLifetime {
            DatasourceLifetime::PerInvocation
        }

        async fn acquire(&self, _env: &Environment) -> anyhow::Result<Database> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(Database)
        }

        async fn release(&self, _resource: Arc<Database>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        registry: CheckRegistry,
        prod: Environment,
        staging: Environment,
        released: Arc<AtomicUsize>,
    }

    fn fixture(fail: bool) -> Fixture {
        let mut envs = EnvironmentRegistry::empty();
        let prod = envs.new_environment("prod").unwrap();
        let staging = envs.new_environment("staging").unwrap();
        let mut registry = CheckRegistry::new(Arc::new(envs));
        let released = Arc::new(AtomicUsize::new(0));
        registry
            .register_datasource(DatabaseFactory {
                strategies: vec![Arc::new(MustRunInExecutionEnvironments::new([prod.clone()]))],
                fail,
                released: released.clone(),
            })
            .unwrap();
        Fixture {
            registry,
            prod,
            staging,
            released,
        }
    }

    fn db_check(target: &Environment) -> Check {
        Check::builder("db")
            .target(target)
            .requires::<Database>()
            .run(|ctx| async move {
                ctx.resource::<Database>()?;
                Ok(CheckResult::ok("db reachable"))
            })
            .build()
            .unwrap()
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut f = fixture(false);
        f.registry.register(db_check(&f.prod)).unwrap();
        assert_eq!(
            f.registry.register(db_check(&f.prod)).unwrap_err(),
            ConfigError::DuplicateCheck("db".into())
        );

        let err = f
            .registry
            .register_datasource(DatabaseFactory {
                strategies: Vec::new(),
                fail: false,
                released: f.released.clone(),
            })
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateDatasource("Database".into()));
    }

    #[test]
    fn foreign_environments_and_unknown_datasources_are_rejected() {
        let mut f = fixture(false);
        let foreign = EnvironmentRegistry::empty().new_environment("prod").unwrap();
        assert!(matches!(
            f.registry.register(db_check(&foreign)).unwrap_err(),
            ConfigError::UnknownEnvironment { .. }
        ));

        let check = Check::builder("cache")
            .target(&f.prod)
            .requires::<String>()
            .run(|_| async { Ok(CheckResult::ok("x")) })
            .build()
            .unwrap();
        assert!(matches!(
            f.registry.register(check).unwrap_err(),
            ConfigError::UnknownDatasource { .. }
        ));
    }

    #[test]
    fn impossible_datasource_combinations_fail_registration() {
        let mut f = fixture(false);
        let check = Check::builder("pinned")
            .target(&f.prod)
            .scheduling(MustRunInExecutionEnvironments::new([f.staging.clone()]))
            .requires::<Database>()
            .run(|_| async { Ok(CheckResult::ok("x")) })
            .build()
            .unwrap();
        assert!(matches!(
            f.registry.register(check).unwrap_err(),
            ConfigError::InvalidCheckConfiguration { .. }
        ));
    }

    #[test]
    fn listing_follows_registration_order() {
        let mut f = fixture(false);
        for name in ["c", "a", "b"] {
            let check = Check::builder(name)
                .target(&f.prod)
                .run(|_| async { Ok(CheckResult::ok("x")) })
                .build()
                .unwrap();
            f.registry.register(check).unwrap();
        }
        let names: Vec<_> = f.registry.list_checks().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(f.registry.get("a").is_some());
    }

    #[tokio::test]
    async fn datasource_outside_its_environment_is_unavailable() {
        let mut f = fixture(false);
        let check = db_check(&f.staging);
        f.registry.register(check.clone()).unwrap();

        let err = f
            .registry
            .resolve(&check, &f.staging, &f.staging, &BTreeMap::new(), RunMode::Scheduled)
            .err()
            .unwrap();
        assert_eq!(
            err,
            ResolveError::DatasourceNotAvailable {
                datasource: "Database".into(),
                execution_environment: "staging".into(),
            }
        );
    }

    #[tokio::test]
    async fn resources_are_released_after_the_body() {
        let mut f = fixture(false);
        let check = db_check(&f.prod);
        f.registry.register(check.clone()).unwrap();

        let bound = f
            .registry
            .resolve(&check, &f.prod, &f.prod, &BTreeMap::new(), RunMode::Scheduled)
            .unwrap();
        let invocation = bound.invoke().await;

        assert_eq!(invocation.results, vec![CheckResult::ok("db reachable")]);
        assert_eq!(f.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquisition_failure_is_an_unknown() {
        let mut f = fixture(true);
        let check = db_check(&f.prod);
        f.registry.register(check.clone()).unwrap();

        let invocation = f
            .registry
            .resolve(&check, &f.prod, &f.prod, &BTreeMap::new(), RunMode::Scheduled)
            .unwrap()
            .invoke()
            .await;

        assert_eq!(invocation.results.len(), 1);
        assert_eq!(invocation.results[0].state, CheckState::Unknown);
        let failure = invocation.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Acquisition);
        assert!(failure.detail.contains("connection refused"));
    }
}
