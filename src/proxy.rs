//! Scope-adapting dynamic proxy.
//!
//! A proxy is injected once but forwards every operation to whichever
//! instance of its dependency is live in the ambient scope at that moment.
//! It holds no instance itself, so it may be kept for arbitrarily long.
//!
//! Consumer code exposes an interface over the proxy by implementing its own
//! trait for `ScopeAdaptingProxy<T>`, each method re-resolving through
//! [`ScopeAdaptingProxy::current`]:
//!
//! ```ignore
//! #[async_trait]
//! impl Collection for ScopeAdaptingProxy<RoundCollection> {
//!     async fn len(&self) -> Result<usize, DiError> {
//!         self.with(|collection| collection.len()).await
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::definition::DependencyDefinition;
use crate::error::DiError;
use crate::resolver;

pub struct ScopeAdaptingProxy<T> {
    dependency_name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ScopeAdaptingProxy<T> {
    fn clone(&self) -> Self {
        Self {
            dependency_name: self.dependency_name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ScopeAdaptingProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeAdaptingProxy")
            .field("dependency_name", &self.dependency_name)
            .finish()
    }
}

impl<T: Send + Sync + 'static> ScopeAdaptingProxy<T> {
    pub fn new(definition: &DependencyDefinition<T>) -> Self {
        Self {
            dependency_name: definition.name().to_string(),
            _marker: PhantomData,
        }
    }

    pub fn dependency_name(&self) -> &str {
        &self.dependency_name
    }

    /// The instance live in the ambient scope right now. Never memoized.
    pub async fn current(&self) -> Result<Arc<T>, DiError> {
        resolver::resolve_by_name::<T>(&self.dependency_name)
            .await
            .map_err(|cause| {
                tracing::debug!(dependency = %self.dependency_name, error = %cause, "Scope adapter resolution failed");
                DiError::ScopeAdapter {
                    dependency_name: self.dependency_name.clone(),
                    cause: Box::new(cause),
                }
            })
    }

    /// Forwards a synchronous operation to the current instance.
    pub async fn with<R>(&self, op: impl FnOnce(&T) -> R) -> Result<R, DiError> {
        let target = self.current().await?;
        Ok(op(&target))
    }

    /// Forwards an asynchronous operation to the current instance.
    pub async fn call<F, Fut, R>(&self, op: F) -> Result<R, DiError>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let target = self.current().await?;
        Ok(op(target).await)
    }

    /// Iterates a snapshot of the current instance's items.
    pub async fn iter_cloned<I>(&self) -> Result<std::vec::IntoIter<I>, DiError>
    where
        for<'a> &'a T: IntoIterator<Item = &'a I>,
        I: Clone + 'static,
    {
        let target = self.current().await?;
        let items: Vec<I> = (&*target).into_iter().cloned().collect();
        Ok(items.into_iter())
    }
}
