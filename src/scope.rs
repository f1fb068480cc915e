//! Scope registry: the fixed set of lifetimes and their containment order.
//!
//! Scopes nest strictly: `Singleton ⊇ Round ⊇ Transient`. A definition may
//! only depend on definitions whose scope lives at least as long as its own,
//! otherwise the outer instance would keep a dangling reference after the
//! inner scope closes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DiError;

/// Lifetime category of a dependency definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Process-wide. Opened by the application context, closed at shutdown.
    Singleton,
    /// Per logical operation (one request or round of work).
    Round,
    /// Never cached; built fresh on every resolution.
    Transient,
}

impl Scope {
    /// All scopes, outermost first.
    pub const ALL: [Scope; 3] = [Scope::Singleton, Scope::Round, Scope::Transient];

    /// Nesting depth, 0 for the outermost scope.
    pub fn depth(self) -> u8 {
        match self {
            Scope::Singleton => 0,
            Scope::Round => 1,
            Scope::Transient => 2,
        }
    }

    /// True if an instance of `self` outlives every instance of `other`.
    pub fn contains(self, other: Scope) -> bool {
        self.depth() <= other.depth()
    }

    /// True if a definition in `self` may depend on a definition in `dependency`.
    pub fn may_depend_on(self, dependency: Scope) -> bool {
        dependency.contains(self)
    }

    /// Transient definitions have no scope instance of their own.
    pub fn is_cached(self) -> bool {
        !matches!(self, Scope::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Singleton => "singleton",
            Scope::Round => "round",
            Scope::Transient => "transient",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = DiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "singleton" => Ok(Scope::Singleton),
            "round" | "request" => Ok(Scope::Round),
            "transient" => Ok(Scope::Transient),
            other => Err(DiError::DependencyDefinition(format!(
                "unknown scope '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment_order() {
        assert!(Scope::Singleton.contains(Scope::Round));
        assert!(Scope::Round.contains(Scope::Transient));
        assert!(Scope::Round.contains(Scope::Round));
        assert!(!Scope::Transient.contains(Scope::Singleton));
    }

    #[test]
    fn test_outer_may_not_depend_on_inner() {
        assert!(Scope::Round.may_depend_on(Scope::Singleton));
        assert!(Scope::Transient.may_depend_on(Scope::Round));
        assert!(!Scope::Singleton.may_depend_on(Scope::Round));
        assert!(!Scope::Round.may_depend_on(Scope::Transient));
    }

    #[test]
    fn test_parse() {
        assert_eq!("request".parse::<Scope>().unwrap(), Scope::Round);
        assert!("forever".parse::<Scope>().is_err());
    }
}
