//! The class-builder DSL side of the host ABI (§4.7): constructs a
//! Python-visible class from the host side without going through the
//! compiler's `class` statement. Mirrors `class::new_class`, just fed
//! from host-registered callbacks instead of an executed class body.

use crate::host::{PyResult, VirtualMachine};
use crate::value::{HostFn, PyClassRef, PyObjectRef, PyProperty};
use indexmap::IndexMap;

pub struct ClassBuilder {
    name: String,
    base: Option<PyClassRef>,
    namespace: IndexMap<String, PyObjectRef>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ClassBuilder { name: name.into(), base: None, namespace: IndexMap::new() }
    }

    pub fn base(mut self, base: PyClassRef) -> Self {
        self.base = Some(base);
        self
    }

    /// An ordinary instance method, or any dunder hook named by `name`
    /// (`__init__`, `__len__`, `__getitem__`, `__add__`, …) — both are
    /// plain entries in the class namespace, found the same way at
    /// dispatch time.
    pub fn method(mut self, vm: &VirtualMachine, name: &str, f: HostFn) -> Self {
        let func = vm.new_host_function(name, f);
        self.namespace.insert(name.to_owned(), func);
        self
    }

    pub fn static_method(mut self, vm: &VirtualMachine, name: &str, f: HostFn) -> Self {
        let func = vm.new_host_function(name, f);
        let wrapped = vm.new_static_method(func);
        self.namespace.insert(name.to_owned(), wrapped);
        self
    }

    pub fn class_method(mut self, vm: &VirtualMachine, name: &str, f: HostFn) -> Self {
        let func = vm.new_host_function(name, f);
        let wrapped = vm.new_class_method(func);
        self.namespace.insert(name.to_owned(), wrapped);
        self
    }

    /// A read-only property when `setter` is `None`, otherwise read/write.
    pub fn property(mut self, vm: &VirtualMachine, name: &str, getter: HostFn, setter: Option<HostFn>) -> Self {
        let getter = vm.new_host_function(name, getter);
        let setter = setter.map(|s| vm.new_host_function(name, s));
        let prop = vm.new_property(PyProperty { getter: Some(getter), setter, deleter: None });
        self.namespace.insert(name.to_owned(), prop);
        self
    }

    /// `Build(state)`: materializes the declared name/base/namespace into
    /// a class value.
    pub fn build(self, vm: &mut VirtualMachine) -> PyResult {
        let bases = self.base.into_iter().collect();
        let class = crate::class::new_class(&self.name, bases, self.namespace, None)
            .map_err(|msg| crate::exceptions::vm_type_error(vm, &msg))?;
        Ok(vm.class_value(class))
    }
}
