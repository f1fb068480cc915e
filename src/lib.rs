//! Ambit - scoped dependency resolution runtime
//!
//! Builds, caches, shares and tears down managed objects according to their
//! declared scope, and propagates the active scope stack across async call
//! chains and spawned tasks.

// Lets `di-macros` generated code refer to `::ambit` from inside this crate.
extern crate self as ambit;

pub mod app_context;
pub mod cli;
pub mod config;
pub mod definition;
pub mod error;
pub mod instance;
pub mod module;
pub mod placeholder;
pub mod proxy;
pub mod resolver;
pub mod scope;
pub mod tasks;

pub use app_context::{
    builtin_module, create_app_context, create_empty_app_context, task_runner,
    ApplicationContext, ApplicationContextBuilder, DefinitionSummary, TASK_RUNNER,
};
pub use config::{ConfigProvider, FigmentConfigProvider, MapConfigProvider, Settings};
pub use definition::{Definition, DependencyDefinition, Dependencies, Provision, Release};
pub use error::{DiError, ReleaseFailure};
pub use instance::{ScopeInstance, ScopeState};
pub use module::{create_module, Module};
pub use placeholder::{managed, ConfigValue, DependencyPlaceholder, Injectable};
pub use proxy::ScopeAdaptingProxy;
pub use resolver::{resolve, resolve_by_name, scoped, OpenScope, ResolverContext};
pub use scope::Scope;
pub use tasks::{create_task, ContextTaskRunner, TaskHandle, TaskRunner};

// Derive macro shares its name with the trait, as serde does.
pub use di_macros::Injectable;

#[doc(hidden)]
pub use async_trait::async_trait;
