use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};

use super::backend::{DetectorBackend, DetectorOpener};
use super::backends::CpuBackend;

type BackendConstructor = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Registry of detector backend constructors keyed by model reference.
///
/// Every `open` builds a fresh backend so no two pipelines share detector state.
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the backends compiled into this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("cpu", || {
            Ok(Box::new(CpuBackend::new()) as Box<dyn DetectorBackend>)
        });
        registry
    }

    /// Register a constructor. The first registered name becomes the default.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.constructors.insert(name.to_string(), Box::new(constructor));
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// True when `model_ref` names a registered backend (or the default).
    pub fn resolves(&self, model_ref: &str) -> bool {
        self.resolve(model_ref).is_ok_and(|name| self.constructors.contains_key(name))
    }

    fn resolve<'a>(&'a self, model_ref: &'a str) -> Result<&'a str> {
        match model_ref {
            "" | "default" => self
                .default_name
                .as_deref()
                .ok_or_else(|| anyhow!("no detector backends registered")),
            name => Ok(name),
        }
    }
}

impl DetectorOpener for BackendRegistry {
    fn open(&self, model_ref: &str) -> Result<Box<dyn DetectorBackend>> {
        let name = self.resolve(model_ref)?;
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| anyhow!("unknown detector model '{}'", name))?;
        let mut backend = constructor().with_context(|| format!("construct detector '{}'", name))?;
        backend
            .warm_up()
            .with_context(|| format!("warm up detector '{}'", name))?;
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
