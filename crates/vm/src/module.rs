//! The process-scoped module registry (§4.8). A module is registered as
//! either a native table of constants/functions a host builds directly,
//! or a Python source string compiled and executed on first import — both
//! sit behind the same two-phase "register now, materialize on first
//! `import`" lifecycle so registration order never matters.

use crate::value::{HostFn, PyModule, PyObjectRef};
use indexmap::IndexMap;
use std::rc::Rc;

pub enum ModuleBuilder {
    Native { constants: Vec<(String, PyObjectRef)>, functions: Vec<(String, HostFn)> },
    PythonSource { source: String },
}

#[derive(Default)]
pub struct ModuleRegistry {
    builders: IndexMap<String, ModuleBuilder>,
    materialized: IndexMap<String, Rc<PyModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_native(&mut self, name: &str, constants: Vec<(String, PyObjectRef)>, functions: Vec<(String, HostFn)>) {
        self.builders.insert(name.to_owned(), ModuleBuilder::Native { constants, functions });
        self.materialized.shift_remove(name);
    }

    pub fn register_python_source(&mut self, name: &str, source: &str) {
        self.builders.insert(name.to_owned(), ModuleBuilder::PythonSource { source: source.to_owned() });
        self.materialized.shift_remove(name);
    }

    /// `ResetModules` (§4.8): drops every registration and every
    /// materialized module, as if the registry had just been constructed.
    pub fn reset(&mut self) {
        self.builders.clear();
        self.materialized.clear();
    }

    pub fn get_materialized(&self, name: &str) -> Option<Rc<PyModule>> {
        self.materialized.get(name).cloned()
    }

    /// Removes and returns a module's builder so the caller can consume it
    /// by value while materializing; the builder itself is single-use
    /// (a module is materialized at most once per registration).
    pub fn take_builder(&mut self, name: &str) -> Option<ModuleBuilder> {
        let builder = self.builders.shift_remove(name)?;
        Some(builder)
    }

    pub fn insert_materialized(&mut self, name: &str, module: Rc<PyModule>) {
        self.materialized.insert(name.to_owned(), module);
    }
}
