//! Ambient resolver context and the build algorithm.
//!
//! The current [`ResolverContext`] travels with the task through a tokio
//! task-local. It is an immutable snapshot of the active scope stack; entering
//! an inner scope produces a new context for the nested future rather than
//! mutating the outer one.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::app_context::AppState;
use crate::config::ConfigProvider;
use crate::definition::{downcast, Built, Definition, DependencyDefinition, Dependencies, Instance};
use crate::error::DiError;
use crate::instance::{Lookup, ScopeInstance};
use crate::scope::Scope;

tokio::task_local! {
    static CURRENT: ResolverContext;
}

// ============================================================================
// Resolution path (runtime cycle detection)
// ============================================================================

/// Definitions currently being built along one resolution chain, plus the
/// cached build that owns the chain (if any).
#[derive(Debug, Clone, Default)]
pub(crate) struct ResolutionPath {
    names: Vec<String>,
    waiter: Option<BuildKey>,
}

impl ResolutionPath {
    fn enter(&self, name: &str) -> Result<Self, DiError> {
        if let Some(start) = self.names.iter().position(|n| n == name) {
            let mut cycle = self.names[start..].to_vec();
            cycle.push(name.to_string());
            return Err(DiError::CyclicDependency { cycle });
        }
        let mut next = self.clone();
        next.names.push(name.to_string());
        Ok(next)
    }

    /// The same chain, now owned by the cached build `key`.
    fn building(&self, key: BuildKey) -> Self {
        Self {
            names: self.names.clone(),
            waiter: Some(key),
        }
    }
}

// ============================================================================
// Wait-for graph (cross-task cycle detection)
// ============================================================================

/// One cached build: a definition name within a scope instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BuildKey {
    instance: u64,
    name: String,
}

/// Which in-flight builds are awaiting which other builds, across every task
/// of one application.
///
/// A resolution chain only sees its own path. When two tasks start the two
/// halves of a dynamic cycle, each would join the other's pending build; the
/// graph turns that into a cycle error instead of a hang.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
    edges: Mutex<HashMap<BuildKey, Vec<BuildKey>>>,
}

impl WaitGraph {
    fn lock(&self) -> MutexGuard<'_, HashMap<BuildKey, Vec<BuildKey>>> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `waiter` awaits `target`, unless `target` already awaits
    /// `waiter` (directly or transitively).
    fn wait<'g>(&'g self, waiter: &BuildKey, target: &BuildKey) -> Result<WaitEdge<'g>, DiError> {
        let mut edges = self.lock();
        if let Some(chain) = find_chain(&edges, target, waiter) {
            let mut cycle = vec![waiter.name.clone()];
            cycle.extend(chain.into_iter().map(|key| key.name));
            return Err(DiError::CyclicDependency { cycle });
        }
        edges.entry(waiter.clone()).or_default().push(target.clone());

        Ok(WaitEdge {
            graph: self,
            waiter: waiter.clone(),
            target: target.clone(),
        })
    }

    fn release(&self, waiter: &BuildKey, target: &BuildKey) {
        let mut edges = self.lock();
        if let Some(targets) = edges.get_mut(waiter) {
            if let Some(index) = targets.iter().position(|t| t == target) {
                targets.swap_remove(index);
            }
            if targets.is_empty() {
                edges.remove(waiter);
            }
        }
    }
}

/// Keys from `from` to `to` following wait edges, both ends included.
fn find_chain(
    edges: &HashMap<BuildKey, Vec<BuildKey>>,
    from: &BuildKey,
    to: &BuildKey,
) -> Option<Vec<BuildKey>> {
    let mut visited = HashSet::new();
    let mut stack = vec![vec![from.clone()]];
    while let Some(chain) = stack.pop() {
        let Some(last) = chain.last() else {
            continue;
        };
        if last == to {
            return Some(chain);
        }
        if !visited.insert(last.clone()) {
            continue;
        }
        for next in edges.get(last).into_iter().flatten() {
            let mut longer = chain.clone();
            longer.push(next.clone());
            stack.push(longer);
        }
    }
    None
}

/// Removes its edge when the wait ends, including on cancellation.
struct WaitEdge<'g> {
    graph: &'g WaitGraph,
    waiter: BuildKey,
    target: BuildKey,
}

impl Drop for WaitEdge<'_> {
    fn drop(&mut self) {
        self.graph.release(&self.waiter, &self.target);
    }
}

// ============================================================================
// Resolver context
// ============================================================================

/// Snapshot of the active scope stack plus the application it belongs to.
#[derive(Clone)]
pub struct ResolverContext {
    app: Arc<AppState>,
    /// Outermost first.
    stack: Arc<[Arc<ScopeInstance>]>,
}

impl std::fmt::Debug for ResolverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverContext")
            .field("module", &self.app.module_name())
            .field("stack", &self.stack)
            .finish()
    }
}

impl ResolverContext {
    pub(crate) fn root(app: Arc<AppState>, singleton: Arc<ScopeInstance>) -> Self {
        Self {
            app,
            stack: Arc::from(vec![singleton]),
        }
    }

    /// The context ambient to the running task, if any.
    pub fn current() -> Option<ResolverContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Runs `fut` with this context as the ambient one.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Live scope instances, outermost first.
    pub fn scopes(&self) -> &[Arc<ScopeInstance>] {
        &self.stack
    }

    pub(crate) fn config(&self) -> &dyn ConfigProvider {
        self.app.config()
    }

    fn release_timeout(&self) -> Option<Duration> {
        self.app.release_timeout()
    }

    /// Innermost live instance of `scope`. Transient definitions attach to
    /// the innermost instance of any scope.
    fn target_instance(&self, scope: Scope) -> Option<&Arc<ScopeInstance>> {
        if !scope.is_cached() {
            return self.stack.last();
        }
        self.stack.iter().rev().find(|instance| instance.scope() == scope)
    }

    /// This context cut back so that `target` is its innermost scope.
    fn truncated_to(&self, target: &Arc<ScopeInstance>) -> Self {
        let end = self
            .stack
            .iter()
            .position(|instance| Arc::ptr_eq(instance, target))
            .map_or(self.stack.len(), |index| index + 1);

        Self {
            app: self.app.clone(),
            stack: Arc::from(&self.stack[..end]),
        }
    }

    fn push(&self, instance: Arc<ScopeInstance>) -> Self {
        let mut stack = self.stack.to_vec();
        stack.push(instance);
        Self {
            app: self.app.clone(),
            stack: Arc::from(stack),
        }
    }

    /// Resolves a typed definition.
    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        definition: &DependencyDefinition<T>,
    ) -> Result<Arc<T>, DiError> {
        self.resolve_by_name(definition.name()).await
    }

    /// Resolves a definition by name from the application's effective set.
    pub async fn resolve_by_name<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, DiError> {
        let instance = self.resolve_erased(name, &ResolutionPath::default()).await?;
        downcast(name, instance)
    }

    /// Build algorithm: locate the target scope instance, return the cached
    /// entry or join its pending build, otherwise build depth-first.
    pub(crate) fn resolve_erased<'a>(
        &'a self,
        name: &'a str,
        path: &'a ResolutionPath,
    ) -> BoxFuture<'a, Result<Instance, DiError>> {
        async move {
            let definition = self.app.definition(name).ok_or_else(|| {
                DiError::OutOfScopeDependency {
                    name: name.to_string(),
                    scope: "any".to_string(),
                }
            })?;
            let path = path.enter(name)?;

            let scope = definition.scope();
            let target = self
                .target_instance(scope)
                .cloned()
                .ok_or_else(|| DiError::OutOfScopeDependency {
                    name: name.to_string(),
                    scope: scope.to_string(),
                })?;

            // Builders run with their target scope ambient, not the caller's.
            if !scope.is_cached() {
                let ctx = self.truncated_to(&target);
                let Built { instance, release } =
                    ctx.clone().run(build(ctx, definition, path)).await?;
                if let Some(release) = release {
                    target.adopt(name, release).await?;
                }
                return Ok(instance);
            }

            let key = BuildKey {
                instance: target.id(),
                name: name.to_string(),
            };
            let ctx = self.truncated_to(&target);
            let build_path = path.building(key.clone());
            let lookup = target.lookup_or_build(name, move || {
                ctx.clone().run(build(ctx, definition, build_path)).boxed()
            })?;

            match lookup {
                Lookup::Ready(instance) => Ok(instance),
                Lookup::Pending(pending) => {
                    let _edge = match &path.waiter {
                        Some(waiter) => Some(self.app.waits().wait(waiter, &key)?),
                        None => None,
                    };
                    pending.await
                }
            }
        }
        .boxed()
    }

    /// Opens an inner scope instance on top of this context.
    ///
    /// The returned [`OpenScope`] is the only handle with authority to close
    /// the new instance.
    pub fn open_scope(&self, scope: Scope) -> Result<OpenScope, DiError> {
        match scope {
            Scope::Singleton => {
                return Err(DiError::ManagedScope(
                    "the singleton scope is owned by the application context".to_string(),
                ))
            }
            Scope::Transient => {
                return Err(DiError::ManagedScope(
                    "the transient scope has no instances to open".to_string(),
                ))
            }
            Scope::Round => {}
        }

        if let Some(closed) = self
            .stack
            .iter()
            .find(|instance| instance.state() != crate::instance::ScopeState::Open)
        {
            return Err(DiError::ManagedScope(format!(
                "cannot open a {} scope inside {} scope instance {} which is {:?}",
                scope,
                closed.scope(),
                closed.id(),
                closed.state()
            )));
        }

        let instance = ScopeInstance::open(scope);
        tracing::info!(scope = %scope, instance = instance.id(), "Entered scope");

        Ok(OpenScope {
            context: self.push(instance.clone()),
            guard: ScopeGuard {
                instance: Some(instance),
                release_timeout: self.release_timeout(),
            },
        })
    }

    /// Runs `fut` inside a fresh instance of `scope`, then closes it.
    ///
    /// Release errors are never dropped: they are returned on success and
    /// attached to the primary error when `fut` itself failed.
    pub async fn scoped<F, T>(&self, scope: Scope, fut: F) -> Result<T, DiError>
    where
        F: Future<Output = Result<T, DiError>>,
    {
        let open = self.open_scope(scope)?;
        let result = open.context.clone().run(fut).await;
        let closed = open.close().await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release)) => Err(release),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(release)) => Err(primary.with_teardown(release)),
        }
    }
}

/// Builds one definition: resolves its declared sub-dependencies depth-first
/// then invokes the builder.
async fn build(
    ctx: ResolverContext,
    definition: Arc<Definition>,
    path: ResolutionPath,
) -> Result<Built, DiError> {
    let mut resolved = HashMap::with_capacity(definition.depends_on().len());
    for dep in definition.depends_on() {
        let instance = ctx.resolve_erased(dep, &path).await?;
        resolved.insert(dep.clone(), instance);
    }

    tracing::debug!(dependency = %definition.name(), scope = %definition.scope(), "Building provider");
    let deps = Dependencies::new(definition.name(), resolved, ctx.clone(), path);

    // Every builder failure is attributed to this provider. Failures of a
    // sub-dependency keep their own attribution; cycles stay cycle errors.
    (definition.builder())(deps).await.map_err(|err| match err.downcast::<DiError>() {
        Ok(di @ (DiError::ProviderBuild { .. } | DiError::CyclicDependency { .. })) => di,
        Ok(di) => {
            tracing::warn!(dependency = %definition.name(), error = %di, "Provider build failed");
            DiError::ProviderBuild {
                provider_name: definition.name().to_string(),
                cause: Arc::new(di),
            }
        }
        Err(err) => {
            tracing::warn!(dependency = %definition.name(), error = %err, "Provider build failed");
            DiError::provider_build(definition.name(), err)
        }
    })
}

/// Runs `fut` inside a fresh `scope` instance nested in the ambient context.
pub async fn scoped<F, T>(scope: Scope, fut: F) -> Result<T, DiError>
where
    F: Future<Output = Result<T, DiError>>,
{
    let ctx = ResolverContext::current().ok_or_else(|| {
        DiError::ManagedScope(format!(
            "cannot open a {scope} scope outside an application context"
        ))
    })?;
    ctx.scoped(scope, fut).await
}

/// Resolves a definition against the ambient context.
pub async fn resolve<T: Send + Sync + 'static>(
    definition: &DependencyDefinition<T>,
) -> Result<Arc<T>, DiError> {
    resolve_by_name(definition.name()).await
}

/// Resolves a definition by name against the ambient context.
///
/// With no ambient context at all this is an out-of-scope error, so
/// placeholder fallbacks still apply.
pub async fn resolve_by_name<T: Send + Sync + 'static>(name: &str) -> Result<Arc<T>, DiError> {
    match ResolverContext::current() {
        Some(ctx) => ctx.resolve_by_name(name).await,
        None => Err(DiError::OutOfScopeDependency {
            name: name.to_string(),
            scope: "any".to_string(),
        }),
    }
}

// ============================================================================
// Scope ownership
// ============================================================================

/// An inner scope instance together with the context that sees it.
///
/// Dropping an `OpenScope` without calling [`OpenScope::close`] (for example
/// because the owning operation was cancelled) still closes the instance, in
/// the background.
pub struct OpenScope {
    context: ResolverContext,
    guard: ScopeGuard,
}

impl std::fmt::Debug for OpenScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenScope")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl OpenScope {
    /// Context whose innermost scope is this instance.
    pub fn context(&self) -> &ResolverContext {
        &self.context
    }

    pub fn instance(&self) -> Option<&Arc<ScopeInstance>> {
        self.guard.instance.as_ref()
    }

    /// Runs `fut` with this scope ambient. Does not close the scope.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        self.context.clone().run(fut).await
    }

    /// Releases every entry in reverse build order.
    pub async fn close(self) -> Result<(), DiError> {
        let OpenScope { context, guard } = self;
        drop(context);
        guard.close().await
    }
}

struct ScopeGuard {
    instance: Option<Arc<ScopeInstance>>,
    release_timeout: Option<Duration>,
}

impl ScopeGuard {
    async fn close(mut self) -> Result<(), DiError> {
        let Some(instance) = self.instance.take() else {
            return Ok(());
        };
        let result = instance.close(self.release_timeout).await;
        tracing::info!(scope = %instance.scope(), instance = instance.id(), ok = result.is_ok(), "Exited scope");
        result
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let release_timeout = self.release_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(instance = instance.id(), "Scope dropped before close, releasing in background");
                handle.spawn(async move {
                    if let Err(err) = instance.close(release_timeout).await {
                        tracing::error!(instance = instance.id(), error = %err, "Background scope release failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    instance = instance.id(),
                    "Scope dropped outside a tokio runtime; releases skipped"
                );
            }
        }
    }
}
