//! Deferred-resolution markers for managed operations.
//!
//! A managed operation declares what it needs as a struct of placeholders
//! (usually through `#[derive(Injectable)]`). The [`managed`] adapter resolves
//! that struct against the ambient context just before invoking the real
//! call. Dependencies and configuration values share one fallback policy:
//! when the value is unavailable, use `default`, else `default_factory`,
//! else fail.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::config::ConfigProvider;
use crate::definition::DependencyDefinition;
use crate::error::DiError;
use crate::resolver::{self, ResolverContext};

/// Produces a fallback value when the real one is unavailable.
type Supplier<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// `default` takes precedence over `default_factory`.
fn pick<T>(default: &Option<Supplier<T>>, factory: &Option<Supplier<T>>) -> Option<T> {
    default.as_ref().or(factory.as_ref()).map(|supply| supply())
}

// ============================================================================
// Dependency placeholder
// ============================================================================

/// Marker for a dependency resolved at call time.
pub struct DependencyPlaceholder<T> {
    name: String,
    default: Option<Supplier<Arc<T>>>,
    default_factory: Option<Supplier<Arc<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DependencyPlaceholder<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            default: self.default.clone(),
            default_factory: self.default_factory.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for DependencyPlaceholder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyPlaceholder")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .field("has_default_factory", &self.default_factory.is_some())
            .finish()
    }
}

impl<T: Send + Sync + 'static> DependencyPlaceholder<T> {
    pub fn new(definition: &DependencyDefinition<T>) -> Self {
        Self::by_name(definition.name())
    }

    /// Placeholder referring to a definition only by name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            default_factory: None,
            _marker: PhantomData,
        }
    }

    pub fn with_default(mut self, value: T) -> Self {
        let value = Arc::new(value);
        self.default = Some(Arc::new(move || value.clone()));
        self
    }

    pub fn with_default_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.default_factory = Some(Arc::new(move || Arc::new(factory())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves against the ambient context.
    pub async fn resolve(&self) -> Result<Arc<T>, DiError> {
        let result = resolver::resolve_by_name::<T>(&self.name).await;
        self.or_fallback(result)
    }

    /// Resolves against an explicit context.
    pub async fn resolve_in(&self, ctx: &ResolverContext) -> Result<Arc<T>, DiError> {
        let result = ctx.resolve_by_name::<T>(&self.name).await;
        self.or_fallback(result)
    }

    fn or_fallback(&self, result: Result<Arc<T>, DiError>) -> Result<Arc<T>, DiError> {
        match result {
            Err(err) if err.is_out_of_scope() => match pick(&self.default, &self.default_factory) {
                Some(value) => {
                    tracing::warn!(dependency = %self.name, "Dependency out of scope, using default");
                    Ok(value)
                }
                None => Err(err),
            },
            other => other,
        }
    }
}

// ============================================================================
// Config value placeholder
// ============================================================================

/// Marker for a configuration value read from the application's provider.
pub struct ConfigValue<T> {
    key: String,
    default: Option<Supplier<T>>,
    default_factory: Option<Supplier<T>>,
}

impl<T> Clone for ConfigValue<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            default: self.default.clone(),
            default_factory: self.default_factory.clone(),
        }
    }
}

impl<T> fmt::Debug for ConfigValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigValue").field("key", &self.key).finish()
    }
}

impl<T: DeserializeOwned + 'static> ConfigValue<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default: None,
            default_factory: None,
        }
    }

    pub fn with_default(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(move || value.clone()));
        self
    }

    pub fn with_default_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.default_factory = Some(Arc::new(factory));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads and deserialises the key; `None` when absent. No fallback.
    pub fn lookup(&self, provider: &dyn ConfigProvider) -> Result<Option<T>, DiError> {
        provider
            .get(&self.key)
            .map(|value| {
                serde_json::from_value(value).map_err(|err| {
                    DiError::Config(format!("invalid value for '{}': {}", self.key, err))
                })
            })
            .transpose()
    }

    /// Resolves against an explicit provider, applying the fallback policy.
    pub fn resolve_with(&self, provider: &dyn ConfigProvider) -> Result<T, DiError> {
        match self.lookup(provider)? {
            Some(value) => Ok(value),
            None => self.fallback(),
        }
    }

    /// Resolves against the ambient application's provider.
    pub async fn resolve(&self) -> Result<T, DiError> {
        match ResolverContext::current() {
            Some(ctx) => self.resolve_with(ctx.config()),
            None => self.fallback(),
        }
    }

    fn fallback(&self) -> Result<T, DiError> {
        pick(&self.default, &self.default_factory)
            .ok_or_else(|| DiError::Config(format!("missing configuration key '{}'", self.key)))
    }
}

// ============================================================================
// Managed operations
// ============================================================================

/// A set of call-time dependencies, resolved from the ambient context.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(Injectable)]
/// struct SearchDeps {
///     #[inject(dep = "collection")]
///     collection: Arc<DocumentCollection>,
///     #[inject(config = "search.limit", default = 10)]
///     limit: usize,
/// }
/// ```
#[async_trait::async_trait]
pub trait Injectable: Sized + Send {
    async fn inject() -> Result<Self, DiError>;
}

/// Resolves `D` and invokes `operation` with it.
///
/// Callers that already hold the values construct `D` themselves and call
/// the operation directly, overriding injection.
pub async fn managed<D, F, Fut, R>(operation: F) -> Result<R, DiError>
where
    D: Injectable,
    F: FnOnce(D) -> Fut,
    Fut: Future<Output = Result<R, DiError>>,
{
    let deps = D::inject().await?;
    operation(deps).await
}
