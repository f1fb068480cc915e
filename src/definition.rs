//! Dependency definitions, provisions and the view a builder gets of its
//! resolved sub-dependencies.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use crate::error::DiError;
use crate::placeholder::ConfigValue;
use crate::resolver::{ResolutionPath, ResolverContext};
use crate::scope::Scope;

/// A built instance with its concrete type erased.
pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) type ReleaseHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) type ErasedBuilder =
    Arc<dyn Fn(Dependencies) -> BoxFuture<'static, anyhow::Result<Built>> + Send + Sync>;

/// Output of an erased builder: the instance and its optional teardown.
pub(crate) struct Built {
    pub instance: Instance,
    pub release: Option<ReleaseHook>,
}

/// Recovers the concrete type of an erased instance.
pub(crate) fn downcast<T: Send + Sync + 'static>(
    name: &str,
    instance: Instance,
) -> Result<Arc<T>, DiError> {
    instance.downcast::<T>().map_err(|_| {
        DiError::ManagedInstanceDefinition(format!(
            "dependency '{}' does not provide a value of type {}",
            name,
            std::any::type_name::<T>()
        ))
    })
}

// ============================================================================
// Definitions
// ============================================================================

/// Untyped description of a dependency. Identity is the name.
pub struct Definition {
    name: String,
    scope: Scope,
    depends_on: Vec<String>,
    type_name: &'static str,
    builder: ErasedBuilder,
}

impl Definition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Declared sub-dependency names, in declaration order.
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Rust type name of the provided value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn builder(&self) -> &ErasedBuilder {
        &self.builder
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("depends_on", &self.depends_on)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Typed handle to a [`Definition`].
///
/// Cloning is cheap. The handle is what consumer code passes to
/// `requires`, proxies and `Dependencies::get`.
pub struct DependencyDefinition<T> {
    inner: Arc<Definition>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DependencyDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for DependencyDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T: Send + Sync + 'static> DependencyDefinition<T> {
    /// Creates a standalone definition. Most callers use [`crate::Module::provides`].
    pub fn new<F, Fut>(
        name: impl Into<String>,
        scope: Scope,
        depends_on: Vec<String>,
        builder: F,
    ) -> Self
    where
        F: Fn(Dependencies) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Provision<T>>> + Send + 'static,
    {
        let erased: ErasedBuilder = Arc::new(move |deps: Dependencies| {
            builder(deps)
                .map(|result| result.map(Provision::into_built))
                .boxed()
        });

        Self {
            inner: Arc::new(Definition {
                name: name.into(),
                scope,
                depends_on,
                type_name: std::any::type_name::<T>(),
                builder: erased,
            }),
            _marker: PhantomData,
        }
    }
}

impl<T> DependencyDefinition<T> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.inner
    }
}

// ============================================================================
// Provisions
// ============================================================================

/// Teardown for values that know how to release themselves.
#[async_trait::async_trait]
pub trait Release: Send + Sync + 'static {
    async fn release(&self) -> anyhow::Result<()>;
}

type TypedRelease<T> = Box<dyn FnOnce(Arc<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// What a builder returns: the value plus an optional release hook that runs
/// when the owning scope instance closes.
pub struct Provision<T> {
    value: T,
    release: Option<TypedRelease<T>>,
}

impl<T: Send + Sync + 'static> Provision<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            release: None,
        }
    }

    /// Registers a release hook receiving the shared instance.
    pub fn on_release<F, Fut>(mut self, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.release = Some(Box::new(move |value| release(value).boxed()));
        self
    }

    pub(crate) fn into_built(self) -> Built {
        let value = Arc::new(self.value);
        let release = self.release.map(|hook| {
            let value = value.clone();
            Box::new(move || hook(value)) as ReleaseHook
        });

        Built {
            instance: value,
            release,
        }
    }
}

impl<T: Release> Provision<T> {
    /// Provision whose release hook is [`Release::release`].
    pub fn releasable(value: T) -> Self {
        Self::new(value).on_release(|value: Arc<T>| async move { value.release().await })
    }
}

// ============================================================================
// Dependencies handed to a builder
// ============================================================================

/// Resolved sub-dependencies of the definition being built.
pub struct Dependencies {
    owner: String,
    resolved: HashMap<String, Instance>,
    ctx: ResolverContext,
    path: ResolutionPath,
}

impl Dependencies {
    pub(crate) fn new(
        owner: &str,
        resolved: HashMap<String, Instance>,
        ctx: ResolverContext,
        path: ResolutionPath,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            resolved,
            ctx,
            path,
        }
    }

    /// A declared sub-dependency.
    pub fn get<T: Send + Sync + 'static>(
        &self,
        definition: &DependencyDefinition<T>,
    ) -> Result<Arc<T>, DiError> {
        self.get_by_name(definition.name())
    }

    /// A declared sub-dependency looked up by name.
    pub fn get_by_name<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, DiError> {
        let instance = self.resolved.get(name).cloned().ok_or_else(|| {
            DiError::DependencyDefinition(format!(
                "'{}' is not a declared dependency of '{}'",
                name, self.owner
            ))
        })?;
        downcast(name, instance)
    }

    /// Resolves a dependency that was not declared up front.
    ///
    /// Runs against the same resolution path, so cycles closed through this
    /// call are reported instead of deadlocking on the pending build.
    pub async fn resolve_by_name<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, DiError> {
        let instance = self.ctx.resolve_erased(name, &self.path).await?;
        downcast(name, instance)
    }

    /// Reads a configuration value; `None` when the key is absent.
    pub fn config<T: DeserializeOwned + 'static>(&self, key: &str) -> Result<Option<T>, DiError> {
        ConfigValue::<T>::new(key).lookup(self.ctx.config())
    }

    /// Name of the definition being built.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_provision_release_receives_instance() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let built = Provision::new(41_u32)
            .on_release(move |value| async move {
                assert_eq!(*value, 41);
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .into_built();

        assert_eq!(*downcast::<u32>("n", built.instance).unwrap(), 41);
        (built.release.unwrap())().await.unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_downcast_mismatch_is_definition_error() {
        let instance: Instance = Arc::new(String::from("x"));
        let err = downcast::<u64>("name", instance).unwrap_err();
        assert!(matches!(err, DiError::ManagedInstanceDefinition(_)));
    }

    #[test]
    fn test_definition_records_type_and_scope() {
        let def: DependencyDefinition<String> =
            DependencyDefinition::new("greeting", Scope::Round, vec![], |_| async {
                Ok(Provision::new("hi".to_string()))
            });
        assert_eq!(def.name(), "greeting");
        assert_eq!(def.scope(), Scope::Round);
        assert!(def.definition().type_name().contains("String"));
    }
}
