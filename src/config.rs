//! Runtime settings and the configuration provider seam.
//!
//! Runtime settings use layered resolution with figment (highest priority last):
//! 1. User config: `~/.config/ambit/config.toml` (XDG) or platform config dir
//! 2. Project config: `.ambit.toml`
//! 3. Environment variables: `AMBIT_*`, nested with `__`
//!    (e.g. `AMBIT_RUNTIME__RELEASE_TIMEOUT_MS=500`)
//!
//! ```toml
//! [runtime]
//! release_timeout_ms = 2000
//! eager_singletons = true
//! ```
//!
//! Configuration *values* consumed by managed code are not parsed here. They
//! come from a [`ConfigProvider`], queried by dotted key.

use std::collections::HashMap;
use std::ops::Deref;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

/// Boxed wrapper for figment::Error to reduce Result size on the stack.
#[derive(Debug)]
pub struct ConfigError(Box<figment::Error>);

impl Deref for ConfigError {
    type Target = figment::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}

// ============================================================================
// Runtime settings
// ============================================================================

/// Root settings structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

/// Resolution runtime tuning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSettings {
    /// Upper bound for a single release hook. A timed-out release counts as failed.
    #[serde(default)]
    pub release_timeout_ms: Option<u64>,
    /// Build every singleton when the application context is created.
    #[serde(default)]
    pub eager_singletons: bool,
}

impl RuntimeSettings {
    pub fn release_timeout(&self) -> Option<Duration> {
        self.release_timeout_ms.map(Duration::from_millis)
    }
}

impl Settings {
    /// Load settings with layered resolution (user → project → env).
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment())
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(ConfigError::from)
    }

    /// The layered figment used by [`Settings::load`].
    pub fn figment() -> Figment {
        Figment::new()
            // Layer 1: User config (lowest priority)
            .merge(Toml::file(Self::user_config_path()))
            // Layer 2: Project config
            .merge(Toml::file(".ambit.toml"))
            // Layer 3: Environment variables (highest priority)
            .merge(Env::prefixed("AMBIT_").split("__"))
    }

    /// User config path: ~/.config/ambit/config.toml (XDG) or platform config dir.
    fn user_config_path() -> std::path::PathBuf {
        // Prefer XDG config location (~/.config) on all platforms
        if let Some(home) = dirs::home_dir() {
            let xdg_path = home.join(".config").join("ambit").join("config.toml");
            if xdg_path.exists() {
                return xdg_path;
            }
        }
        // Fall back to platform-specific config dir
        dirs::config_dir()
            .map(|p| p.join("ambit").join("config.toml"))
            .unwrap_or_default()
    }
}

// ============================================================================
// Configuration providers
// ============================================================================

/// Source of already-parsed configuration values, queried by key.
pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
}

/// Provider with no values; every lookup is absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyConfig;

impl ConfigProvider for EmptyConfig {
    fn get(&self, _key: &str) -> Option<serde_json::Value> {
        None
    }
}

/// Dotted-key lookup into a figment (e.g. `"llm.timeout"`).
#[derive(Debug, Clone)]
pub struct FigmentConfigProvider {
    figment: Figment,
}

impl FigmentConfigProvider {
    pub fn new(figment: Figment) -> Self {
        Self { figment }
    }
}

impl ConfigProvider for FigmentConfigProvider {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.figment.extract_inner::<serde_json::Value>(key) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::trace!(key, error = %err, "Config key not available");
                None
            }
        }
    }
}

/// In-memory provider keyed by the full dotted key.
#[derive(Debug, Default, Clone)]
pub struct MapConfigProvider {
    values: HashMap<String, serde_json::Value>,
}

impl MapConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigProvider for MapConfigProvider {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.get(key).cloned()
    }
}
