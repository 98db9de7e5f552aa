//! Registry mapping miner type names (and aliases) to constructors.

use crate::registry::VersionRegistry;
use crate::{Miner, MinerError, Result, SimulatedMiner, TtMiner, XmrigMiner};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type Constructor = Arc<dyn Fn() -> Arc<dyn Miner> + Send + Sync>;

struct Registry {
    constructors: HashMap<String, Constructor>,
    aliases: HashMap<String, String>,
}

/// Concurrency-safe miner-type registry. Lookup is case-insensitive;
/// aliases resolve to canonical names before constructor dispatch.
pub struct MinerFactory {
    inner: RwLock<Registry>,
}

impl MinerFactory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry {
                constructors: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    /// Factory with the built-in types registered: `xmrig`, `tt-miner`
    /// (alias `ttminer`), `simulated`.
    pub fn with_defaults(registry: Arc<VersionRegistry>, client: reqwest::Client) -> Self {
        let factory = Self::new();
        {
            let registry = registry.clone();
            let client = client.clone();
            factory.register("xmrig", move || {
                Arc::new(XmrigMiner::new(registry.clone(), client.clone()))
            });
        }
        {
            let registry = registry.clone();
            let client = client.clone();
            factory.register("tt-miner", move || {
                Arc::new(TtMiner::new(registry.clone(), client.clone()))
            });
        }
        factory.register("simulated", || Arc::new(SimulatedMiner::new()));
        factory.register_alias("ttminer", "tt-miner");
        factory
    }

    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Miner> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .constructors
            .insert(name.to_lowercase(), Arc::new(constructor));
    }

    pub fn register_alias(&self, alias: &str, canonical: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .aliases
            .insert(alias.to_lowercase(), canonical.to_lowercase());
    }

    /// Resolve an alias or canonical name to the canonical form, if known.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let lowered = name.to_lowercase();
        if inner.constructors.contains_key(&lowered) {
            return Some(lowered);
        }
        inner.aliases.get(&lowered).cloned()
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn list_types(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = inner.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Fresh instance for `name`, or `UnsupportedType`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn Miner>> {
        let canonical = self
            .resolve(name)
            .ok_or_else(|| MinerError::UnsupportedType(name.to_string()))?;
        let constructor = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner.constructors.get(&canonical).cloned()
        };
        match constructor {
            Some(make) => Ok(make()),
            None => Err(MinerError::UnsupportedType(name.to_string())),
        }
    }
}

impl Default for MinerFactory {
    fn default() -> Self {
        Self::new()
    }
}
