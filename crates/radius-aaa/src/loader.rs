//! Name-based module and filter registry
//!
//! Configuration refers to modules and filters by name. A [`Loader`]
//! resolves a name into a fresh, uninitialized instance; the server calls
//! `init` on it afterwards.

use crate::filters::{ClientAllowlistFilter, Filter};
use crate::modules::{LoopbackModule, Module, SessionTrackerModule};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),
}

pub trait Loader: Send + Sync {
    fn load_module(&self, name: &str) -> Result<Box<dyn Module>, LoadError>;

    fn load_filter(&self, name: &str) -> Result<Box<dyn Filter>, LoadError>;
}

type ModuleConstructor = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;
type FilterConstructor = Box<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

/// Loader backed by a table of constructor closures
#[derive(Default)]
pub struct StaticLoader {
    modules: HashMap<String, ModuleConstructor>,
    filters: HashMap<String, FilterConstructor>,
}

impl StaticLoader {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in modules and filters
    pub fn with_builtins() -> Self {
        Self::new()
            .register_module("testloopback", || Box::new(LoopbackModule::new()))
            .register_module("sessiontracker", || Box::new(SessionTrackerModule::new()))
            .register_filter("client_allowlist", || Box::new(ClientAllowlistFilter::new()))
    }

    pub fn register_module<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.modules.insert(name.to_string(), Box::new(constructor));
        self
    }

    pub fn register_filter<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Box::new(constructor));
        self
    }
}

impl Loader for StaticLoader {
    fn load_module(&self, name: &str) -> Result<Box<dyn Module>, LoadError> {
        self.modules
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| LoadError::UnknownModule(name.to_string()))
    }

    fn load_filter(&self, name: &str) -> Result<Box<dyn Filter>, LoadError> {
        self.filters
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| LoadError::UnknownFilter(name.to_string()))
    }
}
