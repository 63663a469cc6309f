//! Capability-typed datasources injected into check bodies.
//!
//! A [`DatasourceFactory`] produces resources of one Rust type. Checks declare
//! the resource types they need; the registry looks up the factory by
//! [`TypeId`], validates the factory's scheduling strategies against the
//! current execution environment and acquires a resource right before the
//! check body runs. Per-invocation resources are released after the body
//! settles; shared resources are created once and reused.

pub mod http;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::environment::Environment;
use crate::scheduling::SchedulingStrategy;

/// How long an acquired resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatasourceLifetime {
    /// A fresh resource per check invocation, released afterwards.
    #[default]
    PerInvocation,
    /// One resource for the whole process, shared by concurrent invocations.
    Shared,
}

/// Provider of one capability type.
#[async_trait]
pub trait DatasourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Where resources of this factory may be acquired.
    fn scheduling_strategies(&self) -> Vec<Arc<dyn SchedulingStrategy>> {
        Vec::new()
    }

    fn lifetime(&self) -> DatasourceLifetime {
        DatasourceLifetime::PerInvocation
    }

    async fn acquire(&self, execution_environment: &Environment) -> anyhow::Result<Self::Resource>;

    /// Called once the check body settled. Not called for shared resources.
    async fn release(&self, _resource: Arc<Self::Resource>) {}
}

pub(crate) type AnyResource = Arc<dyn Any + Send + Sync>;

#[async_trait]
trait ErasedFactory: Send + Sync {
    async fn acquire(&self, execution_environment: &Environment) -> anyhow::Result<AnyResource>;
    async fn release(&self, resource: AnyResource);
}

struct FactoryAdapter<F: DatasourceFactory> {
    factory: F,
    lifetime: DatasourceLifetime,
    shared: OnceCell<Arc<F::Resource>>,
}

#[async_trait]
impl<F: DatasourceFactory> ErasedFactory for FactoryAdapter<F> {
    async fn acquire(&self, execution_environment: &Environment) -> anyhow::Result<AnyResource> {
        match self.lifetime {
            DatasourceLifetime::Shared => {
                let resource = self
                    .shared
                    .get_or_try_init(|| async {
                        self.factory.acquire(execution_environment).await.map(Arc::new)
                    })
                    .await?;
                Ok(resource.clone() as AnyResource)
            }
            DatasourceLifetime::PerInvocation => {
                let resource = self.factory.acquire(execution_environment).await?;
                Ok(Arc::new(resource) as AnyResource)
            }
        }
    }

    async fn release(&self, resource: AnyResource) {
        if self.lifetime == DatasourceLifetime::Shared {
            return;
        }
        if let Ok(resource) = resource.downcast::<F::Resource>() {
            self.factory.release(resource).await;
        }
    }
}

/// A factory as stored in the registry.
pub struct RegisteredDatasource {
    type_id: TypeId,
    type_name: &'static str,
    name: String,
    strategies: Vec<Arc<dyn SchedulingStrategy>>,
    factory: Box<dyn ErasedFactory>,
}

impl RegisteredDatasource {
    pub fn new<F: DatasourceFactory>(factory: F) -> Self {
        let name = factory.name().to_string();
        let strategies = factory.scheduling_strategies();
        let lifetime = factory.lifetime();
        Self {
            type_id: TypeId::of::<F::Resource>(),
            type_name: std::any::type_name::<F::Resource>(),
            name,
            strategies,
            factory: Box::new(FactoryAdapter {
                factory,
                lifetime,
                shared: OnceCell::new(),
            }),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategies(&self) -> &[Arc<dyn SchedulingStrategy>] {
        &self.strategies
    }

    pub(crate) async fn acquire(&self, execution_environment: &Environment) -> anyhow::Result<AnyResource> {
        self.factory.acquire(execution_environment).await
    }

    pub(crate) async fn release(&self, resource: AnyResource) {
        self.factory.release(resource).await
    }
}

impl fmt::Debug for RegisteredDatasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredDatasource")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .finish()
    }
}

/// A dependency declared by a check: one capability type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl Requirement {
    pub fn of<T: Any + Send + Sync>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Resources acquired for one invocation, looked up by type.
#[derive(Clone, Default)]
pub struct Resources {
    entries: Vec<(TypeId, &'static str, AnyResource)>,
}

impl Resources {
    pub(crate) fn insert(&mut self, requirement: Requirement, resource: AnyResource) {
        self.entries.push((requirement.type_id, requirement.type_name, resource));
    }

    /// Fetch the resource of type `T` declared by the check.
    pub fn get<T: Any + Send + Sync>(&self) -> anyhow::Result<Arc<T>> {
        let wanted = TypeId::of::<T>();
        let resource = self
            .entries
            .iter()
            .find(|(type_id, _, _)| *type_id == wanted)
            .map(|(_, _, resource)| resource.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Datasource `{}` was not declared by this check",
                    std::any::type_name::<T>()
                )
            })?;
        resource
            .downcast::<T>()
            .map_err(|_| anyhow::anyhow!("Datasource `{}` has an unexpected type", std::any::type_name::<T>()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(_, name, _)| name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counter(usize);

    struct CounterFactory {
        lifetime: DatasourceLifetime,
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatasourceFactory for CounterFactory {
        type Resource = Counter;

        fn name(&self) -> &str {
            "counter"
        }

        fn lifetime(&self) -> DatasourceLifetime {
            self.lifetime
        }

        async fn acquire(&self, _env: &Environment) -> anyhow::Result<Counter> {
            Ok(Counter(self.acquired.fetch_add(1, Ordering::SeqCst)))
        }

        async fn release(&self, _resource: Arc<Counter>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn factory(lifetime: DatasourceLifetime) -> (RegisteredDatasource, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let acquired = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let registered = RegisteredDatasource::new(CounterFactory {
            lifetime,
            acquired: acquired.clone(),
            released: released.clone(),
        });
        (registered, acquired, released)
    }

    #[tokio::test]
    async fn per_invocation_resources_are_fresh_and_released() {
        let mut envs = EnvironmentRegistry::empty();
        let prod = envs.new_environment("prod").unwrap();
        let (ds, acquired, released) = factory(DatasourceLifetime::PerInvocation);

        let first = ds.acquire(&prod).await.unwrap();
        let second = ds.acquire(&prod).await.unwrap();
        assert_eq!(first.downcast_ref::<Counter>().unwrap().0, 0);
        assert_eq!(second.downcast_ref::<Counter>().unwrap().0, 1);

        ds.release(first).await;
        ds.release(second).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 2);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shared_resources_are_created_once() {
        let mut envs = EnvironmentRegistry::empty();
        let prod = envs.new_environment("prod").unwrap();
        let (ds, acquired, released) = factory(DatasourceLifetime::Shared);

        let first = ds.acquire(&prod).await.unwrap();
        let second = ds.acquire(&prod).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        ds.release(first).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resources_lookup_by_type() {
        let mut resources = Resources::default();
        resources.insert(Requirement::of::<Counter>(), Arc::new(Counter(7)));

        assert_eq!(resources.get::<Counter>().unwrap().0, 7);
        let err = resources.get::<String>().unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }
}
