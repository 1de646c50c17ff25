//! Strategy registry: names to strategy kinds, plus the current selection.
//!
//! Switching only changes which kind resolves for the next cycle. The
//! session and its context are never touched here.

use reasonloop_config::AppConfig;
use reasonloop_core::error::{RegistryError, UnknownStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use super::{Strategy, StrategyKind};

/// What `describe` reports about a registered strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDescription {
    pub name: String,
    pub kind: StrategyKind,
    pub description: String,
    pub is_current: bool,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    entries: BTreeMap<String, StrategyKind>,
    current: String,
    config: AppConfig,
}

impl StrategyRegistry {
    /// Register every kind under its canonical name and select
    /// `config.default_strategy`.
    pub fn new(config: &AppConfig) -> Result<Self, UnknownStrategy> {
        let entries = StrategyKind::ALL
            .iter()
            .map(|k| (k.canonical_name().to_string(), *k))
            .collect();
        let mut registry = Self {
            entries,
            current: String::new(),
            config: config.clone(),
        };
        registry.current = registry.check(&config.default_strategy)?.to_string();
        Ok(registry)
    }

    fn check<'a>(&self, name: &'a str) -> Result<&'a str, UnknownStrategy> {
        if self.entries.contains_key(name) {
            Ok(name)
        } else {
            Err(UnknownStrategy {
                name: name.to_string(),
                available: self.list().join(", "),
            })
        }
    }

    pub fn register(&mut self, name: impl Into<String>, kind: StrategyKind) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        info!(strategy = %name, ?kind, "Registered strategy");
        self.entries.insert(name, kind);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<StrategyKind, RegistryError> {
        self.check(name)?;
        if self.current == name {
            return Err(RegistryError::InUse(name.to_string()));
        }
        let kind = self.entries[name];
        self.entries.remove(name);
        info!(strategy = %name, "Unregistered strategy");
        Ok(kind)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn switch(&mut self, name: &str) -> Result<(), UnknownStrategy> {
        self.check(name)?;
        if self.current != name {
            info!(from = %self.current, to = %name, "Switched strategy");
            self.current = name.to_string();
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Strategy, UnknownStrategy> {
        self.check(name)?;
        let kind = self.entries[name];
        Ok(kind.build(&self.config))
    }

    pub fn resolve_current(&self) -> Result<Strategy, UnknownStrategy> {
        self.resolve(&self.current)
    }

    pub fn describe(&self, name: &str) -> Result<StrategyDescription, UnknownStrategy> {
        let strategy = self.resolve(name)?;
        Ok(StrategyDescription {
            name: name.to_string(),
            kind: strategy.kind(),
            description: strategy.description().to_string(),
            is_current: self.current == name,
            config: strategy.config_json(),
        })
    }
}
