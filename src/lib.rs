//! The embedding facade (§4.7 Host ABI, §A crate layout): one `Interpreter`
//! entry point a host links against, wrapping `pylite_vm::VirtualMachine`
//! the way `rustpython-vm` is the thing embedding binaries in the teacher
//! actually hold onto — just exposed as a library here rather than a CLI,
//! since a REPL/CLI binary is out of scope for this system.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

pub use pylite_compiler::{CompileError, CompileErrors, DiagnosticKind, Location};
pub use pylite_vm::dict::PyDict;
pub use pylite_vm::function::CallArgs;
pub use pylite_vm::value::{HostFn, PyPayload, PyProperty, PyUserData};
pub use pylite_vm::{ClassBuilder, HostError, PyClassRef, PyObjectRef, PyResult, VmError};

/// One embeddable Python-subset interpreter instance. Instances share no
/// state (§5): a host running two independent programs constructs two of
/// these.
pub struct Interpreter {
    vm: pylite_vm::VirtualMachine,
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter { vm: pylite_vm::VirtualMachine::new() }
    }

    /// Direct access to the underlying VM for operations this facade
    /// doesn't wrap one-to-one (attribute access, calling a value,
    /// container protocol, …) — the full surface lives on
    /// [`pylite_vm::VirtualMachine`].
    pub fn vm(&mut self) -> &mut pylite_vm::VirtualMachine {
        &mut self.vm
    }

    // ---- execution ----

    pub fn run(&mut self, source: &str) -> Result<PyObjectRef, HostError> {
        self.vm.run(source)
    }

    pub fn run_with_deadline(&mut self, source: &str, deadline: Duration) -> Result<PyObjectRef, HostError> {
        self.vm.run_with_deadline(source, deadline)
    }

    pub fn run_with_cancellation(&mut self, source: &str, cancel: Arc<AtomicBool>) -> Result<PyObjectRef, HostError> {
        self.vm.run_with_cancellation(source, cancel)
    }

    // ---- value construction ----

    pub fn none(&self) -> PyObjectRef {
        self.vm.none()
    }

    pub fn new_int(&self, i: i64) -> PyObjectRef {
        self.vm.new_int(i)
    }

    pub fn new_float(&self, f: f64) -> PyObjectRef {
        self.vm.new_float(f)
    }

    pub fn new_bool(&self, b: bool) -> PyObjectRef {
        self.vm.new_bool(b)
    }

    pub fn new_str(&self, s: impl Into<String>) -> PyObjectRef {
        self.vm.new_str(s)
    }

    pub fn new_bytes(&self, b: Vec<u8>) -> PyObjectRef {
        self.vm.new_bytes(b)
    }

    pub fn new_list(&self, items: Vec<PyObjectRef>) -> PyObjectRef {
        self.vm.new_list(items)
    }

    pub fn new_tuple(&self, items: Vec<PyObjectRef>) -> PyObjectRef {
        self.vm.new_tuple(items)
    }

    /// An empty dict. Populate it through [`Self::vm`]'s container
    /// protocol (`setitem`) so host-supplied keys get the same hashing
    /// and equality rules Python code sees.
    pub fn new_dict(&self) -> PyObjectRef {
        self.vm.new_dict()
    }

    pub fn new_set(&self) -> PyObjectRef {
        self.vm.new_set()
    }

    pub fn new_user_data<T: std::any::Any>(&self, type_tag: &'static str, data: T) -> PyObjectRef {
        self.vm.new_user_data(type_tag, data)
    }

    pub fn downcast_user_data<'a, T: 'static>(&self, v: &'a PyObjectRef, type_tag: &str) -> Option<&'a T> {
        self.vm.downcast_user_data(v, type_tag)
    }

    // ---- global access ----

    pub fn get_global(&mut self, name: &str) -> Option<PyObjectRef> {
        self.vm.get_global(name)
    }

    pub fn set_global(&mut self, name: &str, value: PyObjectRef) {
        self.vm.set_global(name, value)
    }

    // ---- function / module registration ----

    pub fn register(&mut self, name: impl Into<String>, callback: HostFn) {
        self.vm.register(name, callback)
    }

    pub fn register_bulk(&mut self, callbacks: Vec<(String, HostFn)>) {
        self.vm.register_bulk(callbacks)
    }

    pub fn register_native_module(&mut self, name: &str, constants: Vec<(String, PyObjectRef)>, functions: Vec<(String, HostFn)>) {
        self.vm.register_native_module(name, constants, functions)
    }

    pub fn register_python_module(&mut self, name: &str, source: &str) {
        self.vm.register_python_module(name, source)
    }

    /// Clears the whole module registry, builders included (§4.8). Hosts
    /// that call this between test cases must re-register their modules
    /// afterward.
    pub fn reset_modules(&mut self) {
        self.vm.reset_modules()
    }

    // ---- class-builder DSL ----

    pub fn class_builder(&self, name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name)
    }

    /// `NewInstance()`: an instance of `class` without running
    /// `__init__`, so the host can populate attributes directly.
    pub fn new_instance(&self, class: &PyClassRef) -> PyObjectRef {
        self.vm.new_instance(class)
    }

    pub fn object_class(&self) -> PyClassRef {
        self.vm.classes.object.clone()
    }

    pub fn exception_class(&self, name: &str) -> PyClassRef {
        self.vm.exc_class(name)
    }

    // ---- resource caps (§4.7; 0/None means unlimited) ----

    pub fn set_max_recursion_depth(&mut self, n: usize) {
        self.vm.governor_mut().set_max_recursion_depth(n);
    }

    pub fn set_max_memory_bytes(&mut self, n: u64) {
        self.vm.governor_mut().set_max_memory_bytes(if n == 0 { None } else { Some(n) });
    }

    pub fn set_max_collection_size(&mut self, n: usize) {
        self.vm.governor_mut().set_max_collection_size(if n == 0 { None } else { Some(n) });
    }

    pub fn set_check_interval(&mut self, k: u64) {
        self.vm.governor_mut().set_check_interval(k);
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
