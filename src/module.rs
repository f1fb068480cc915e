//! Module composition and static validation.
//!
//! A module owns an ordered list of definitions and may extend other modules.
//! The effective definition set is built by overlaying, in order: each
//! extended module's effective set, then the module's own definitions. Later
//! writers win by name, which is how test modules replace production
//! providers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::definition::{Definition, DependencyDefinition, Dependencies, Provision};
use crate::error::DiError;
use crate::scope::Scope;

/// A named, composable set of dependency definitions.
#[derive(Clone, Debug)]
pub struct Module {
    name: String,
    own: Vec<Arc<Definition>>,
    extends: Vec<Module>,
}

/// Creates a module extending `extends` in order.
pub fn create_module(name: impl Into<String>, extends: impl IntoIterator<Item = Module>) -> Module {
    Module {
        name: name.into(),
        own: Vec::new(),
        extends: extends.into_iter().collect(),
    }
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        create_module(name, [])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts registering a provider under this module.
    ///
    /// ```ignore
    /// let db = module
    ///     .provides("db", Scope::Singleton)
    ///     .depends_on(&settings)
    ///     .build(|deps| async move {
    ///         let settings = deps.get(&settings)?;
    ///         Ok(Provision::new(Db::connect(&settings.url).await?))
    ///     });
    /// ```
    pub fn provides(&mut self, name: impl Into<String>, scope: Scope) -> ProviderBuilder<'_> {
        ProviderBuilder {
            module: self,
            name: name.into(),
            scope,
            depends_on: Vec::new(),
        }
    }

    /// Registers an existing definition, overriding any earlier one by name.
    pub fn register<T>(&mut self, definition: &DependencyDefinition<T>) -> &mut Self {
        self.own.push(definition.definition().clone());
        self
    }

    /// Modules this one extends, in extension order.
    pub fn extends(&self) -> &[Module] {
        &self.extends
    }

    /// Overlays extended modules then own definitions. No validation.
    fn flatten(&self) -> HashMap<String, Arc<Definition>> {
        let mut effective = HashMap::new();
        for parent in &self.extends {
            effective.extend(parent.flatten());
        }
        for definition in &self.own {
            if let Some(previous) = effective.insert(definition.name().to_string(), definition.clone())
            {
                tracing::debug!(
                    module = %self.name,
                    dependency = %previous.name(),
                    "Overriding definition"
                );
            }
        }
        effective
    }

    /// Flattens and validates the definition graph.
    ///
    /// Rejects unknown sub-dependency names, outer scopes depending on inner
    /// ones, and cycles, in that order.
    pub fn effective_definitions(&self) -> Result<EffectiveDefinitions, DiError> {
        EffectiveDefinitions::validate(self.flatten())
    }
}

/// In-progress provider registration returned by [`Module::provides`].
pub struct ProviderBuilder<'m> {
    module: &'m mut Module,
    name: String,
    scope: Scope,
    depends_on: Vec<String>,
}

impl ProviderBuilder<'_> {
    pub fn depends_on<U>(mut self, definition: &DependencyDefinition<U>) -> Self {
        self.depends_on.push(definition.name().to_string());
        self
    }

    pub fn depends_on_name(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Finishes registration with the builder function.
    pub fn build<T, F, Fut>(self, builder: F) -> DependencyDefinition<T>
    where
        T: Send + Sync + 'static,
        F: Fn(Dependencies) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Provision<T>>> + Send + 'static,
    {
        let definition = DependencyDefinition::new(self.name, self.scope, self.depends_on, builder);
        self.module.register(&definition);
        definition
    }
}

// ============================================================================
// Validated definition set
// ============================================================================

/// Validated, flattened definitions with a dependency-first build order.
#[derive(Debug, Clone)]
pub struct EffectiveDefinitions {
    definitions: HashMap<String, Arc<Definition>>,
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

impl EffectiveDefinitions {
    fn validate(definitions: HashMap<String, Arc<Definition>>) -> Result<Self, DiError> {
        let mut names: Vec<&String> = definitions.keys().collect();
        names.sort();

        for name in &names {
            let definition = &definitions[*name];
            for dep in definition.depends_on() {
                let Some(target) = definitions.get(dep) else {
                    return Err(DiError::DependencyDefinition(format!(
                        "'{}' depends on '{}', which is not defined",
                        name, dep
                    )));
                };
                if !definition.scope().may_depend_on(target.scope()) {
                    return Err(DiError::ManagedScope(format!(
                        "'{}' ({}) cannot depend on '{}' ({}): the dependency does not live long enough",
                        name,
                        definition.scope(),
                        dep,
                        target.scope()
                    )));
                }
            }
        }

        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(definitions.len());
        for name in names {
            visit(name, &definitions, &mut marks, &mut stack, &mut order)?;
        }

        Ok(Self { definitions, order })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Definition>> {
        self.definitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions with every dependency before its dependents.
    pub fn in_build_order(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.order.iter().filter_map(|name| self.definitions.get(name))
    }
}

fn visit(
    name: &str,
    definitions: &HashMap<String, Arc<Definition>>,
    marks: &mut HashMap<String, Mark>,
    stack: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), DiError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| n == name).unwrap_or_default();
            let mut cycle = stack[start..].to_vec();
            cycle.push(name.to_string());
            return Err(DiError::CyclicDependency { cycle });
        }
        None => {}
    }

    marks.insert(name.to_string(), Mark::Visiting);
    stack.push(name.to_string());

    if let Some(definition) = definitions.get(name) {
        for dep in definition.depends_on() {
            visit(dep, definitions, marks, stack, order)?;
        }
    }

    stack.pop();
    marks.insert(name.to_string(), Mark::Done);
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(module: &mut Module, name: &str, scope: Scope, deps: &[&str]) {
        let mut builder = module.provides(name, scope);
        for dep in deps {
            builder = builder.depends_on_name(*dep);
        }
        let value = name.to_string();
        builder.build(move |_| {
            let value = value.clone();
            async move { Ok(Provision::new(value)) }
        });
    }

    #[test]
    fn test_extension_overrides_by_name() {
        let mut base = Module::new("base");
        constant(&mut base, "a", Scope::Singleton, &[]);
        constant(&mut base, "b", Scope::Singleton, &["a"]);

        let mut test = create_module("test", [base]);
        constant(&mut test, "a", Scope::Round, &[]);

        let effective = test.effective_definitions();
        // b (singleton) now depends on a round-scoped a
        assert!(matches!(effective, Err(DiError::ManagedScope(_))));
    }

    #[test]
    fn test_later_extension_wins() {
        let mut first = Module::new("first");
        constant(&mut first, "x", Scope::Singleton, &[]);
        let mut second = Module::new("second");
        constant(&mut second, "x", Scope::Round, &[]);

        let app = create_module("app", [first, second]);
        let effective = app.effective_definitions().unwrap();
        assert_eq!(effective.get("x").unwrap().scope(), Scope::Round);
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let mut module = Module::new("m");
        constant(&mut module, "a", Scope::Singleton, &["ghost"]);

        let err = module.effective_definitions().unwrap_err();
        assert!(matches!(err, DiError::DependencyDefinition(ref msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_cycle_identifies_edge() {
        let mut module = Module::new("m");
        constant(&mut module, "a", Scope::Singleton, &["b"]);
        constant(&mut module, "b", Scope::Singleton, &["a"]);

        match module.effective_definitions() {
            Err(DiError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_build_order_puts_dependencies_first() {
        let mut module = Module::new("m");
        constant(&mut module, "c", Scope::Round, &["b"]);
        constant(&mut module, "b", Scope::Singleton, &["a"]);
        constant(&mut module, "a", Scope::Singleton, &[]);

        let effective = module.effective_definitions().unwrap();
        let order: Vec<_> = effective.in_build_order().map(|d| d.name().to_string()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
