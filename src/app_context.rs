//! Application context: the root of resolution.
//!
//! The application context owns the fully composed module, opens the
//! singleton scope instance when it is created and closes it on
//! [`ApplicationContext::shutdown`]. It is also the gateway consumer code
//! uses to create placeholders and proxies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{ConfigProvider, EmptyConfig, RuntimeSettings, Settings};
use crate::definition::{Definition, DependencyDefinition, Provision};
use crate::error::DiError;
use crate::instance::{ScopeInstance, ScopeState};
use crate::module::{create_module, EffectiveDefinitions, Module};
use crate::placeholder::{ConfigValue, DependencyPlaceholder};
use crate::proxy::ScopeAdaptingProxy;
use crate::resolver::{OpenScope, ResolutionPath, ResolverContext, WaitGraph};
use crate::scope::Scope;
use crate::tasks::ContextTaskRunner;

/// Name of the builtin task runner definition.
pub const TASK_RUNNER: &str = "task_runner";

static BUILTIN: Lazy<(Module, DependencyDefinition<ContextTaskRunner>)> = Lazy::new(|| {
    let mut module = Module::new("builtin");
    let task_runner = module
        .provides(TASK_RUNNER, Scope::Singleton)
        .build(|_| async { Ok(Provision::new(ContextTaskRunner)) });
    (module, task_runner)
});

/// The module every application context implicitly extends.
pub fn builtin_module() -> Module {
    BUILTIN.0.clone()
}

/// Builtin definition of the context-propagating task runner.
pub fn task_runner() -> DependencyDefinition<ContextTaskRunner> {
    BUILTIN.1.clone()
}

/// Application context over `module` with no configuration values.
pub fn create_app_context(module: Module) -> Result<ApplicationContext, DiError> {
    ApplicationContext::builder(module).build()
}

/// Application context over the builtin module only.
pub fn create_empty_app_context() -> Result<ApplicationContext, DiError> {
    create_app_context(Module::new("empty"))
}

// ============================================================================
// Shared application state
// ============================================================================

/// State shared by every resolver context of one application.
pub(crate) struct AppState {
    module_name: String,
    definitions: EffectiveDefinitions,
    config: Arc<dyn ConfigProvider>,
    runtime: RuntimeSettings,
    waits: WaitGraph,
}

impl AppState {
    pub(crate) fn module_name(&self) -> &str {
        &self.module_name
    }

    pub(crate) fn definition(&self, name: &str) -> Option<Arc<Definition>> {
        self.definitions.get(name).cloned()
    }

    pub(crate) fn config(&self) -> &dyn ConfigProvider {
        self.config.as_ref()
    }

    pub(crate) fn release_timeout(&self) -> Option<Duration> {
        self.runtime.release_timeout()
    }

    pub(crate) fn waits(&self) -> &WaitGraph {
        &self.waits
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and creates an [`ApplicationContext`].
pub struct ApplicationContextBuilder {
    module: Module,
    config: Arc<dyn ConfigProvider>,
    runtime: RuntimeSettings,
}

impl ApplicationContextBuilder {
    /// Provider answering `config` placeholders.
    pub fn config(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.config = Arc::new(provider);
        self
    }

    pub fn runtime(mut self, runtime: RuntimeSettings) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn settings(self, settings: Settings) -> Self {
        self.runtime(settings.runtime)
    }

    /// Validates the composed module and opens the singleton scope.
    ///
    /// Composition errors abort construction; no partial context is returned.
    pub fn build(self) -> Result<ApplicationContext, DiError> {
        let composed = create_module(self.module.name().to_string(), [builtin_module(), self.module]);
        let definitions = composed.effective_definitions()?;

        let state = Arc::new(AppState {
            module_name: composed.name().to_string(),
            definitions,
            config: self.config,
            runtime: self.runtime,
            waits: WaitGraph::default(),
        });
        let singleton = ScopeInstance::open(Scope::Singleton);
        let root = ResolverContext::root(state.clone(), singleton.clone());

        tracing::info!(
            module = %state.module_name,
            definitions = state.definitions.len(),
            "Application context created"
        );

        Ok(ApplicationContext {
            inner: Arc::new(AppInner {
                state,
                singleton,
                root,
            }),
        })
    }

    /// Builds the context and, when `eager_singletons` is set, every
    /// singleton. A singleton build failure shuts the context down and is
    /// returned, making it fatal to startup.
    pub async fn start(self) -> Result<ApplicationContext, DiError> {
        let eager = self.runtime.eager_singletons;
        let app = self.build()?;
        if eager {
            if let Err(err) = app.warm_up().await {
                return Err(match app.shutdown().await {
                    Ok(()) => err,
                    Err(release) => err.with_teardown(release),
                });
            }
        }
        Ok(app)
    }
}

// ============================================================================
// Application context
// ============================================================================

struct AppInner {
    state: Arc<AppState>,
    singleton: Arc<ScopeInstance>,
    root: ResolverContext,
}

impl Drop for AppInner {
    fn drop(&mut self) {
        if self.singleton.state() != ScopeState::Open {
            return;
        }
        tracing::warn!(module = %self.state.module_name, "Application context dropped without shutdown");

        let singleton = self.singleton.clone();
        let release_timeout = self.state.release_timeout();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = singleton.close(release_timeout).await {
                    tracing::error!(error = %err, "Singleton release failed");
                }
            });
        }
    }
}

/// One row of [`ApplicationContext::describe`].
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionSummary {
    pub name: String,
    pub scope: Scope,
    pub depends_on: Vec<String>,
    pub type_name: &'static str,
}

/// Root object owning the composed module and the singleton scope instance.
#[derive(Clone)]
pub struct ApplicationContext {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("module", &self.inner.state.module_name)
            .field("singleton", &self.inner.singleton)
            .finish()
    }
}

impl ApplicationContext {
    pub fn builder(module: Module) -> ApplicationContextBuilder {
        ApplicationContextBuilder {
            module,
            config: Arc::new(EmptyConfig),
            runtime: RuntimeSettings::default(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.inner.state.module_name
    }

    /// Root resolver context: just the singleton scope.
    pub fn context(&self) -> &ResolverContext {
        &self.inner.root
    }

    pub fn singleton_scope(&self) -> &Arc<ScopeInstance> {
        &self.inner.singleton
    }

    /// Runs `fut` with the root context ambient.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        self.inner.root.clone().run(fut).await
    }

    /// Runs `fut` inside a fresh instance of an inner scope.
    pub async fn scoped<F, T>(&self, scope: Scope, fut: F) -> Result<T, DiError>
    where
        F: Future<Output = Result<T, DiError>>,
    {
        self.inner.root.scoped(scope, fut).await
    }

    /// Opens an inner scope whose lifetime the caller manages.
    pub fn open_scope(&self, scope: Scope) -> Result<OpenScope, DiError> {
        self.inner.root.open_scope(scope)
    }

    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        definition: &DependencyDefinition<T>,
    ) -> Result<Arc<T>, DiError> {
        self.inner.root.resolve(definition).await
    }

    // --- Gateway ---

    pub fn requires<T: Send + Sync + 'static>(
        &self,
        definition: &DependencyDefinition<T>,
    ) -> DependencyPlaceholder<T> {
        DependencyPlaceholder::new(definition)
    }

    pub fn requires_by_name<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
    ) -> DependencyPlaceholder<T> {
        DependencyPlaceholder::by_name(name)
    }

    pub fn config<T: DeserializeOwned + 'static>(&self, key: impl Into<String>) -> ConfigValue<T> {
        ConfigValue::new(key)
    }

    /// Proxy forwarding to whichever instance of `definition` is live in the
    /// ambient scope at each use.
    pub fn scope_adapting_dynamic_proxy_dep<T: Send + Sync + 'static>(
        &self,
        definition: &DependencyDefinition<T>,
    ) -> ScopeAdaptingProxy<T> {
        ScopeAdaptingProxy::new(definition)
    }

    // --- Lifecycle ---

    /// Builds every singleton definition in dependency order.
    pub async fn warm_up(&self) -> Result<(), DiError> {
        let path = ResolutionPath::default();
        for definition in self.inner.state.definitions.in_build_order() {
            if definition.scope() != Scope::Singleton {
                continue;
            }
            self.inner
                .root
                .resolve_erased(definition.name(), &path)
                .await?;
        }
        tracing::info!(module = %self.module_name(), "Singletons warmed up");
        Ok(())
    }

    /// Definitions in build order.
    pub fn describe(&self) -> Vec<DefinitionSummary> {
        self.inner
            .state
            .definitions
            .in_build_order()
            .map(|definition| DefinitionSummary {
                name: definition.name().to_string(),
                scope: definition.scope(),
                depends_on: definition.depends_on().to_vec(),
                type_name: definition.type_name(),
            })
            .collect()
    }

    /// Closes the singleton scope, releasing every singleton in reverse
    /// build order. Later resolutions fail with a managed scope error.
    pub async fn shutdown(&self) -> Result<(), DiError> {
        tracing::info!(module = %self.module_name(), "Shutting down application context");
        self.inner
            .singleton
            .close(self.inner.state.release_timeout())
            .await
    }
}
