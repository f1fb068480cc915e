//! Resolution runtime error types.

use std::sync::Arc;

use thiserror::Error;

/// Shared, clonable cause attached to build/release failures.
///
/// One failed build is observed by every waiter of the pending-build token,
/// so causes are reference counted rather than boxed.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Converts an `anyhow` error raised by a builder or release hook.
pub(crate) fn share(err: anyhow::Error) -> SharedError {
    let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = err.into();
    Arc::from(boxed)
}

/// A single failed release, recorded while a scope instance closes.
#[derive(Debug, Clone)]
pub struct ReleaseFailure {
    pub provider_name: String,
    pub cause: SharedError,
}

impl std::fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}': {}", self.provider_name, self.cause)
    }
}

/// Errors raised by module composition, resolution and scope teardown.
#[derive(Error, Debug, Clone)]
pub enum DiError {
    // Composition errors
    #[error("Dependency definition error: {0}")]
    DependencyDefinition(String),

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    // Resolution errors
    #[error("Unable to find definition: {name} (no active '{scope}' scope)")]
    OutOfScopeDependency { name: String, scope: String },

    #[error("Managed scope error: {0}")]
    ManagedScope(String),

    #[error("Managed instance definition error: {0}")]
    ManagedInstanceDefinition(String),

    #[error("Failed to build provider '{provider_name}': {cause}")]
    ProviderBuild {
        provider_name: String,
        #[source]
        cause: SharedError,
    },

    #[error("Failed to release {} provider(s): {}", failures.len(), format_failures(failures))]
    ProviderRelease { failures: Vec<ReleaseFailure> },

    #[error("Scope adapter failed to resolve dep: '{dependency_name}'")]
    ScopeAdapter {
        dependency_name: String,
        #[source]
        cause: Box<DiError>,
    },

    #[error("Round storage error: {0}")]
    RoundStorage(String),

    #[error("Should never reach here: {0}")]
    UnreachableCodeBlock(String),

    // Operation errors
    #[error("{0}")]
    Operation(#[source] SharedError),

    #[error("{primary} (scope teardown also failed: {release})")]
    Teardown {
        #[source]
        primary: Box<DiError>,
        release: Box<DiError>,
    },

    #[error("Task failed: {0}")]
    Task(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_failures(failures: &[ReleaseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DiError {
    /// Wraps an arbitrary error raised by consumer code inside a managed operation.
    pub fn operation(err: impl Into<anyhow::Error>) -> Self {
        DiError::Operation(share(err.into()))
    }

    pub(crate) fn provider_build(provider_name: &str, err: anyhow::Error) -> Self {
        DiError::ProviderBuild {
            provider_name: provider_name.to_string(),
            cause: share(err),
        }
    }

    /// Attaches release errors from a scope close to the error that triggered it.
    pub(crate) fn with_teardown(self, release: DiError) -> Self {
        DiError::Teardown {
            primary: Box::new(self),
            release: Box::new(release),
        }
    }

    pub fn is_out_of_scope(&self) -> bool {
        matches!(self, DiError::OutOfScopeDependency { .. })
    }

    /// Provider names carried by build or release failures, innermost first.
    pub fn provider_names(&self) -> Vec<&str> {
        match self {
            DiError::ProviderBuild { provider_name, .. } => vec![provider_name.as_str()],
            DiError::ProviderRelease { failures } => failures
                .iter()
                .map(|f| f.provider_name.as_str())
                .collect(),
            DiError::ScopeAdapter { cause, .. } => cause.provider_names(),
            DiError::Teardown { primary, release } => {
                let mut names = primary.provider_names();
                names.extend(release.provider_names());
                names
            }
            _ => Vec::new(),
        }
    }
}

impl From<anyhow::Error> for DiError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed runtime errors intact when they travelled through anyhow.
        match err.downcast::<DiError>() {
            Ok(di) => di,
            Err(other) => DiError::Operation(share(other)),
        }
    }
}

impl From<crate::config::ConfigError> for DiError {
    fn from(err: crate::config::ConfigError) -> Self {
        DiError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_edges() {
        let err = DiError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_release_error_names_every_provider() {
        let err = DiError::ProviderRelease {
            failures: vec![
                ReleaseFailure {
                    provider_name: "b".into(),
                    cause: share(anyhow::anyhow!("boom")),
                },
                ReleaseFailure {
                    provider_name: "a".into(),
                    cause: share(anyhow::anyhow!("bang")),
                },
            ],
        };
        assert_eq!(err.provider_names(), vec!["b", "a"]);
        let text = err.to_string();
        assert!(text.contains("'b': boom"));
        assert!(text.contains("'a': bang"));
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_typed_error() {
        let original = DiError::ManagedScope("closed".into());
        let through: anyhow::Error = original.into();
        let back = DiError::from(through);
        assert!(matches!(back, DiError::ManagedScope(msg) if msg == "closed"));
    }

    #[test]
    fn test_teardown_keeps_both_errors() {
        let primary = DiError::operation(anyhow::anyhow!("request failed"));
        let release = DiError::ProviderRelease {
            failures: vec![ReleaseFailure {
                provider_name: "conn".into(),
                cause: share(anyhow::anyhow!("close failed")),
            }],
        };
        let err = primary.with_teardown(release);
        let text = err.to_string();
        assert!(text.contains("request failed"));
        assert!(text.contains("close failed"));
        assert_eq!(err.provider_names(), vec!["conn"]);
    }
}
