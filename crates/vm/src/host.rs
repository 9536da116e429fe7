//! The interpreter engine and the host-extension ABI (§4.7, §4.8, §4.9).
//!
//! [`VirtualMachine`] owns every piece of per-interpreter state: the
//! built-in class table, the exception hierarchy, the builtins namespace,
//! the module registry, per-module globals, and the [`Governor`]. Nothing
//! here is shared between interpreter instances (§5 "instances share no
//! mutable state"); a host embedding two independent programs constructs
//! two `VirtualMachine`s.

use crate::class::new_builtin_class;
use crate::dict::PyDict;
use crate::exceptions;
use crate::function::{Cell, CallArgs, PyFunction};
use crate::governor::Governor;
use crate::module::ModuleRegistry;
use crate::object_protocol;
use crate::value::{
    HostFn, InstanceStorage, PyClass, PyClassRef, PyHostFunction, PyInstance, PyModule, PyObject,
    PyObjectRef, PyPayload, PyProperty, PyRange,
};
use indexmap::IndexMap;
use pylite_bytecode::{BinOp, CodeObject, UnOp};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Internal VM control-flow error: a raised Python exception propagating
/// out of a frame. Distinct from [`HostError`], which is what actually
/// crosses the host boundary once nothing inside the program catches it.
#[derive(Debug, Clone)]
pub enum VmError {
    Raised(PyObjectRef),
}

pub type PyResult<T = PyObjectRef> = Result<T, VmError>;

/// A raised exception that reached the top of a `run`, flattened into
/// something a host can inspect without touching `PyObjectRef` (§7
/// "typed host-level error ... class-name chain, message, notes, and
/// optional traceback").
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class_chain}: {message}")]
pub struct HostError {
    /// The exception's class followed by each of its ancestors, most
    /// derived first, so a host can test membership without touching VM
    /// internals (e.g. `classes.contains("TimeoutError")`).
    pub class_chain: Vec<String>,
    pub message: String,
    pub notes: Vec<String>,
    pub traceback: Option<String>,
}

impl HostError {
    pub fn class_name(&self) -> &str {
        self.class_chain.first().map(String::as_str).unwrap_or("BaseException")
    }
}

/// The bootstrap built-in classes every value's `payload` variant maps to.
/// Cached once at construction rather than looked up by name on every
/// value creation.
pub struct BuiltinClasses {
    pub object: PyClassRef,
    pub type_: PyClassRef,
    pub none_type: PyClassRef,
    pub bool_: PyClassRef,
    pub int: PyClassRef,
    pub float: PyClassRef,
    pub str_: PyClassRef,
    pub bytes: PyClassRef,
    pub list: PyClassRef,
    pub tuple: PyClassRef,
    pub dict: PyClassRef,
    pub set: PyClassRef,
    pub frozenset: PyClassRef,
    pub range: PyClassRef,
    pub function: PyClassRef,
    pub bound_method: PyClassRef,
    pub host_function: PyClassRef,
    pub module: PyClassRef,
    pub code: PyClassRef,
    pub generator: PyClassRef,
    pub iterator: PyClassRef,
    pub slice: PyClassRef,
    pub super_: PyClassRef,
    pub property: PyClassRef,
    pub staticmethod: PyClassRef,
    pub classmethod: PyClassRef,
}

pub struct VirtualMachine {
    pub classes: BuiltinClasses,
    exc_classes: IndexMap<String, PyClassRef>,
    builtins: IndexMap<String, PyObjectRef>,
    module_registry: ModuleRegistry,
    module_globals: IndexMap<String, Rc<RefCell<IndexMap<String, PyObjectRef>>>>,
    governor: Governor,
    none: PyObjectRef,
    true_val: PyObjectRef,
    false_val: PyObjectRef,
}

fn bare_class(name: &str, bases: Vec<PyClassRef>) -> PyClassRef {
    new_builtin_class(name, bases, None)
}

impl VirtualMachine {
    pub fn new() -> Self {
        let object = bare_class("object", vec![]);
        let type_ = bare_class("type", vec![object.clone()]);
        let classes = BuiltinClasses {
            none_type: bare_class("NoneType", vec![object.clone()]),
            bool_: bare_class("bool", vec![object.clone()]),
            int: bare_class("int", vec![object.clone()]),
            float: bare_class("float", vec![object.clone()]),
            str_: bare_class("str", vec![object.clone()]),
            bytes: bare_class("bytes", vec![object.clone()]),
            list: bare_class("list", vec![object.clone()]),
            tuple: bare_class("tuple", vec![object.clone()]),
            dict: bare_class("dict", vec![object.clone()]),
            set: bare_class("set", vec![object.clone()]),
            frozenset: bare_class("frozenset", vec![object.clone()]),
            range: bare_class("range", vec![object.clone()]),
            function: bare_class("function", vec![object.clone()]),
            bound_method: bare_class("method", vec![object.clone()]),
            host_function: bare_class("builtin_function_or_method", vec![object.clone()]),
            module: bare_class("module", vec![object.clone()]),
            code: bare_class("code", vec![object.clone()]),
            generator: bare_class("generator", vec![object.clone()]),
            iterator: bare_class("iterator", vec![object.clone()]),
            slice: bare_class("slice", vec![object.clone()]),
            super_: bare_class("super", vec![object.clone()]),
            property: bare_class("property", vec![object.clone()]),
            staticmethod: bare_class("staticmethod", vec![object.clone()]),
            classmethod: bare_class("classmethod", vec![object.clone()]),
            object: object.clone(),
            type_: type_.clone(),
        };
        let exc_classes = exceptions::build_hierarchy(&object);

        let none = PyObjectRef::new(PyObject { class: classes.none_type.clone(), payload: PyPayload::None });
        let true_val = PyObjectRef::new(PyObject { class: classes.bool_.clone(), payload: PyPayload::Bool(true) });
        let false_val = PyObjectRef::new(PyObject { class: classes.bool_.clone(), payload: PyPayload::Bool(false) });

        let mut vm = VirtualMachine {
            classes,
            exc_classes,
            builtins: IndexMap::new(),
            module_registry: ModuleRegistry::new(),
            module_globals: IndexMap::new(),
            governor: Governor::new(),
            none,
            true_val,
            false_val,
        };

        if let Ok(n) = std::env::var("PYLITE_MAX_RECURSION_DEPTH") {
            if let Ok(n) = n.parse() {
                vm.governor.set_max_recursion_depth(n);
            }
        }
        if let Ok(n) = std::env::var("PYLITE_MAX_MEMORY_BYTES") {
            if let Ok(n) = n.parse::<u64>() {
                vm.governor.set_max_memory_bytes(Some(n));
            }
        }

        let mut table = crate::builtins::install(&mut vm);
        for (name, class) in vm.exc_classes.clone() {
            table.entry(name).or_insert_with(|| vm.class_value(class));
        }
        vm.builtins = table;
        vm
    }

    // ---- value construction (§4.7) ----

    fn wrap(&self, class: PyClassRef, payload: PyPayload) -> PyObjectRef {
        PyObjectRef::new(PyObject { class, payload })
    }

    pub fn none(&self) -> PyObjectRef {
        self.none.clone()
    }

    pub fn new_bool(&self, b: bool) -> PyObjectRef {
        if b { self.true_val.clone() } else { self.false_val.clone() }
    }

    pub fn new_int(&self, i: i64) -> PyObjectRef {
        self.wrap(self.classes.int.clone(), PyPayload::Int(i))
    }

    pub fn new_float(&self, f: f64) -> PyObjectRef {
        self.wrap(self.classes.float.clone(), PyPayload::Float(f))
    }

    pub fn new_str(&self, s: impl Into<String>) -> PyObjectRef {
        self.wrap(self.classes.str_.clone(), PyPayload::Str(s.into()))
    }

    pub fn new_bytes(&self, b: Vec<u8>) -> PyObjectRef {
        self.wrap(self.classes.bytes.clone(), PyPayload::Bytes(RefCell::new(b)))
    }

    pub fn new_list(&self, items: Vec<PyObjectRef>) -> PyObjectRef {
        self.wrap(self.classes.list.clone(), PyPayload::List(RefCell::new(items)))
    }

    pub fn new_tuple(&self, items: Vec<PyObjectRef>) -> PyObjectRef {
        self.wrap(self.classes.tuple.clone(), PyPayload::Tuple(items))
    }

    pub fn new_dict(&self) -> PyObjectRef {
        self.wrap(self.classes.dict.clone(), PyPayload::Dict(RefCell::new(PyDict::new())))
    }

    pub fn new_set(&self) -> PyObjectRef {
        self.wrap(self.classes.set.clone(), PyPayload::Set(RefCell::new(PyDict::new())))
    }

    pub fn new_frozenset(&self, d: PyDict) -> PyObjectRef {
        self.wrap(self.classes.frozenset.clone(), PyPayload::Set(RefCell::new(d)))
    }

    pub fn new_range(&self, range: PyRange) -> PyObjectRef {
        self.wrap(self.classes.range.clone(), PyPayload::Range(range))
    }

    pub fn new_slice(&self, start: PyObjectRef, stop: PyObjectRef, step: Option<PyObjectRef>) -> PyObjectRef {
        let items = vec![start, stop, step.unwrap_or_else(|| self.none())];
        self.wrap(self.classes.slice.clone(), PyPayload::Tuple(items))
    }

    pub fn new_function(&self, f: PyFunction) -> PyObjectRef {
        self.wrap(self.classes.function.clone(), PyPayload::Function(f))
    }

    pub fn new_bound_method(&self, func: PyObjectRef, receiver: PyObjectRef) -> PyObjectRef {
        self.wrap(self.classes.bound_method.clone(), PyPayload::BoundMethod { func, receiver })
    }

    pub fn new_host_function(&self, name: impl Into<String>, func: HostFn) -> PyObjectRef {
        self.wrap(self.classes.host_function.clone(), PyPayload::HostFunction(PyHostFunction { name: name.into(), func }))
    }

    pub fn new_code_value(&self, code: Arc<CodeObject>) -> PyObjectRef {
        self.wrap(self.classes.code.clone(), PyPayload::Code(Rc::new((*code).clone())))
    }

    pub fn code_from_const(&self, v: &PyObjectRef) -> Rc<CodeObject> {
        match &v.payload {
            PyPayload::Code(c) => c.clone(),
            _ => unreachable!("code_from_const called on a non-code value"),
        }
    }

    pub fn new_iterator(&self, state: crate::iterator::IterState) -> PyObjectRef {
        self.wrap(self.classes.iterator.clone(), PyPayload::Iterator(RefCell::new(state)))
    }

    pub fn new_generator(&self, frame: crate::frame::Frame) -> PyObjectRef {
        self.wrap(self.classes.generator.clone(), PyPayload::Generator(RefCell::new(crate::generator::GeneratorState::Created(frame))))
    }

    pub fn new_super(&self, search_from: PyClassRef, instance: PyObjectRef) -> PyObjectRef {
        self.wrap(self.classes.super_.clone(), PyPayload::Super { search_from, instance })
    }

    pub fn new_static_method(&self, func: PyObjectRef) -> PyObjectRef {
        self.wrap(self.classes.staticmethod.clone(), PyPayload::StaticMethod(func))
    }

    pub fn new_class_method(&self, func: PyObjectRef) -> PyObjectRef {
        self.wrap(self.classes.classmethod.clone(), PyPayload::ClassMethod(func))
    }

    pub fn new_property(&self, prop: PyProperty) -> PyObjectRef {
        self.wrap(self.classes.property.clone(), PyPayload::Property(prop))
    }

    /// UserData (§4.7): an opaque host pointer tagged with a static type
    /// name so a later native callback can downcast it safely.
    pub fn new_user_data<T: std::any::Any>(&self, type_tag: &'static str, data: T) -> PyObjectRef {
        self.wrap(self.classes.object.clone(), PyPayload::UserData(crate::value::PyUserData { type_tag, data: Rc::new(data) }))
    }

    pub fn downcast_user_data<'a, T: 'static>(&self, v: &'a PyObjectRef, type_tag: &str) -> Option<&'a T> {
        match &v.payload {
            PyPayload::UserData(u) if u.type_tag == type_tag => u.data.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn class_value(&self, class: PyClassRef) -> PyObjectRef {
        let meta = class.metaclass.clone().unwrap_or_else(|| self.classes.type_.clone());
        self.wrap(meta, PyPayload::Class(class))
    }

    pub fn class_from_value(&mut self, v: &PyObjectRef) -> PyResult<PyClassRef> {
        match &v.payload {
            PyPayload::Class(c) => Ok(c.clone()),
            _ => Err(exceptions::vm_type_error(self, "expected a class")),
        }
    }

    pub fn new_instance(&self, class: &PyClassRef) -> PyObjectRef {
        let storage = if class.has_slots { PyInstance::new_slots(class.slot_names.len()) } else { PyInstance::new_dict() };
        self.wrap(class.clone(), PyPayload::Instance(storage))
    }

    // ---- global / module access ----

    pub fn globals_for_module(&mut self, module_name: &str) -> Rc<RefCell<IndexMap<String, PyObjectRef>>> {
        self.module_globals.entry(module_name.to_owned()).or_insert_with(|| Rc::new(RefCell::new(IndexMap::new()))).clone()
    }

    pub fn get_global(&mut self, name: &str) -> Option<PyObjectRef> {
        self.globals_for_module("__main__").borrow().get(name).cloned()
    }

    pub fn set_global(&mut self, name: &str, value: PyObjectRef) {
        self.globals_for_module("__main__").borrow_mut().insert(name.to_owned(), value);
    }

    pub fn builtin(&self, name: &str) -> Option<PyObjectRef> {
        self.builtins.get(name).cloned()
    }

    pub fn register(&mut self, name: impl Into<String>, callback: HostFn) {
        let name = name.into();
        let f = self.new_host_function(name.clone(), callback);
        self.builtins.insert(name, f);
    }

    pub fn register_bulk(&mut self, callbacks: Vec<(String, HostFn)>) {
        for (name, cb) in callbacks {
            self.register(name, cb);
        }
    }

    pub fn register_native_module(&mut self, name: &str, constants: Vec<(String, PyObjectRef)>, functions: Vec<(String, HostFn)>) {
        self.module_registry.register_native(name, constants, functions);
    }

    pub fn register_python_module(&mut self, name: &str, source: &str) {
        self.module_registry.register_python_source(name, source);
    }

    pub fn reset_modules(&mut self) {
        self.module_registry.reset();
    }

    fn materialize_module(&mut self, name: &str) -> PyResult<Rc<PyModule>> {
        if let Some(m) = self.module_registry.get_materialized(name) {
            return Ok(m);
        }
        let builder = self.module_registry.take_builder(name).ok_or_else(|| {
            exceptions::new_exception(self, "ModuleNotFoundError", &format!("No module named '{name}'"))
        })?;
        let module = Rc::new(PyModule { name: name.to_owned(), dict: RefCell::new(IndexMap::new()) });
        match builder {
            crate::module::ModuleBuilder::Native { constants, functions } => {
                for (k, v) in constants {
                    module.dict.borrow_mut().insert(k, v);
                }
                for (k, f) in functions {
                    let fv = self.new_host_function(k.clone(), f);
                    module.dict.borrow_mut().insert(k, fv);
                }
            }
            crate::module::ModuleBuilder::PythonSource { source } => {
                let code = pylite_compiler::compile(&source, name)
                    .map_err(|errs| exceptions::new_exception(self, "SyntaxError", &errs[0].to_string()))?;
                let globals = self.globals_for_module(name);
                let frame = crate::frame::Frame::new(Rc::new(code), vec![], vec![], globals.clone(), name.to_owned(), None);
                frame.execute(self)?;
                module.dict.borrow_mut().extend(globals.borrow().iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        self.module_registry.insert_materialized(name, module.clone());
        Ok(module)
    }

    pub fn import_module(&mut self, name: &str, _fromlist: &PyObjectRef) -> PyResult {
        log::debug!("importing module '{name}'");
        let module = self.materialize_module(name)?;
        Ok(self.wrap(self.classes.module.clone(), PyPayload::Module(module)))
    }

    pub fn import_from(&mut self, module: &PyObjectRef, name: &str) -> PyResult {
        let PyPayload::Module(m) = &module.payload else {
            return Err(exceptions::vm_type_error(self, "import_from on a non-module value"));
        };
        m.dict.borrow().get(name).cloned().ok_or_else(|| {
            exceptions::new_exception(self, "ImportError", &format!("cannot import name '{name}' from '{}'", m.name))
        })
    }

    pub fn import_star(&mut self, module: &PyObjectRef, globals: &Rc<RefCell<IndexMap<String, PyObjectRef>>>) -> PyResult<()> {
        let PyPayload::Module(m) = &module.payload else {
            return Err(exceptions::vm_type_error(self, "import_star on a non-module value"));
        };
        let dict = m.dict.borrow();
        let names: Vec<String> = match dict.get("__all__") {
            Some(all) => self.iterable_to_vec(all)?.iter().map(|v| self.to_display_string(v)).collect(),
            None => dict.keys().filter(|k| !k.starts_with('_')).cloned().collect(),
        };
        let mut g = globals.borrow_mut();
        for name in names {
            if let Some(v) = dict.get(&name) {
                g.insert(name, v.clone());
            }
        }
        Ok(())
    }

    pub fn exc_class(&self, name: &str) -> PyClassRef {
        self.exc_classes.get(name).cloned().unwrap_or_else(|| self.classes.object.clone())
    }

    pub fn exc_class_opt(&self, name: &str) -> Option<PyClassRef> {
        self.exc_classes.get(name).cloned()
    }

    pub fn ensure_exception_instance(&mut self, v: PyObjectRef) -> PyResult {
        if let PyPayload::Instance(_) = &v.payload {
            if v.class.is_subclass_of(&self.exc_class("BaseException")) {
                return Ok(v);
            }
        }
        if let PyPayload::Class(c) = &v.payload {
            let class = c.clone();
            let class_val = self.class_value(class);
            return self.call_value(&class_val, &CallArgs::default());
        }
        Err(exceptions::vm_type_error(self, "exceptions must derive from BaseException"))
    }

    pub fn set_cause(&mut self, exc: &PyObjectRef, cause: PyObjectRef) {
        if let PyPayload::Instance(inst) = &exc.payload {
            let _ = inst.set(&exc.class, "__cause__", cause);
            let _ = inst.set(&exc.class, "__suppress_context__", self.new_bool(true));
        }
    }

    /// Implicit chaining (§9): set on a freshly raised exception when
    /// another one is already being handled, distinct from `__cause__`
    /// which only `raise X from Y` sets.
    pub fn set_context(&mut self, exc: &PyObjectRef, context: PyObjectRef) {
        if let PyPayload::Instance(inst) = &exc.payload {
            let _ = inst.set(&exc.class, "__context__", context);
        }
    }

    // ---- governor ----

    pub fn governor_mut(&mut self) -> &mut Governor {
        &mut self.governor
    }

    // ---- execution entry points (§4.7 `run`/`run_with_deadline`/`run_with_cancellation`) ----

    fn to_host_error(&mut self, exc: &PyObjectRef) -> HostError {
        let mut class_chain = vec![exc.class.name.clone()];
        class_chain.extend(exc.class.mro.iter().map(|c| c.name.clone()));
        let message = exceptions::attr(exc, "args")
            .map(|a| match &a.payload {
                PyPayload::Tuple(t) if !t.is_empty() => self.to_display_string(&t[0]),
                _ => String::new(),
            })
            .unwrap_or_default();
        let notes = exceptions::attr(exc, "__notes__")
            .map(|n| match &n.payload {
                PyPayload::List(items) => items.borrow().iter().map(|v| self.to_display_string(v)).collect(),
                _ => vec![],
            })
            .unwrap_or_default();
        let traceback = exceptions::format_traceback(self, exc).ok();
        HostError { class_chain, message, notes, traceback }
    }

    fn run_module_source(&mut self, source: &str) -> PyResult {
        let code = pylite_compiler::compile(source, "<string>")
            .map_err(|errs| exceptions::new_exception(self, "SyntaxError", &errs[0].to_string()))?;
        let globals = self.globals_for_module("__main__");
        let frame = crate::frame::Frame::new(Rc::new(code), vec![], vec![], globals, "__main__".to_owned(), None);
        frame.execute(self)
    }

    pub fn run(&mut self, source: &str) -> Result<PyObjectRef, HostError> {
        self.governor.reset_for_run();
        self.run_module_source(source).map_err(|VmError::Raised(exc)| self.to_host_error(&exc))
    }

    pub fn run_with_deadline(&mut self, source: &str, deadline: Duration) -> Result<PyObjectRef, HostError> {
        self.governor.reset_for_run();
        self.governor.set_deadline(deadline);
        self.run_module_source(source).map_err(|VmError::Raised(exc)| self.to_host_error(&exc))
    }

    pub fn run_with_cancellation(&mut self, source: &str, cancel: Arc<AtomicBool>) -> Result<PyObjectRef, HostError> {
        self.governor.reset_for_run();
        self.governor.set_cancellation_handle(cancel);
        self.run_module_source(source).map_err(|VmError::Raised(exc)| self.to_host_error(&exc))
    }

    // ---- calling convention ----

    pub fn call_value(&mut self, callee: &PyObjectRef, args: &CallArgs) -> PyResult {
        match &callee.payload {
            PyPayload::HostFunction(f) => (f.func)(self, args),
            PyPayload::Function(func) => {
                if func.code.is_generator() {
                    let frame = crate::frame::Frame::for_call(self, func, args)?;
                    Ok(self.new_generator(frame))
                } else {
                    let frame = crate::frame::Frame::for_call(self, func, args)?;
                    frame.execute(self)
                }
            }
            PyPayload::BoundMethod { func, receiver } => {
                let mut full = CallArgs { positional: Vec::with_capacity(args.positional.len() + 1), keywords: args.keywords.clone() };
                full.positional.push(receiver.clone());
                full.positional.extend(args.positional.iter().cloned());
                self.call_value(func, &full)
            }
            PyPayload::StaticMethod(f) => self.call_value(&f.clone(), args),
            PyPayload::ClassMethod(f) => self.call_value(&f.clone(), args),
            PyPayload::Class(class) => self.construct_instance(class.clone(), args),
            _ => {
                if let Some(result) = object_protocol::call_dunder(self, callee, "__call__", args.positional.clone())? {
                    Ok(result)
                } else {
                    Err(exceptions::vm_type_error(self, &format!("'{}' object is not callable", callee.class.name)))
                }
            }
        }
    }

    fn construct_instance(&mut self, class: PyClassRef, args: &CallArgs) -> PyResult {
        let instance = if let Some(new_fn) = class.get_dunder("__new__") {
            let mut new_args = args.clone();
            new_args.positional.insert(0, self.class_value(class.clone()));
            self.call_value(&new_fn, &new_args)?
        } else {
            self.new_instance(&class)
        };
        if instance.class.is_subclass_of(&class) || Rc::ptr_eq(&instance.class, &class) {
            if let Some(init_fn) = class.get_dunder("__init__") {
                let mut init_args = args.clone();
                init_args.positional.insert(0, instance.clone());
                self.call_value(&init_fn, &init_args)?;
            }
        }
        Ok(instance)
    }

    pub fn call_dunder_required(&mut self, obj: &PyObjectRef, name: &str, args: Vec<PyObjectRef>) -> PyResult {
        object_protocol::call_dunder(self, obj, name, args)?
            .ok_or_else(|| exceptions::vm_attribute_error(self, &format!("'{}' object has no attribute '{name}'", obj.class.name)))
    }

    /// Executes a class body's `CodeObject` with `__class__`-cell wiring
    /// absent (it isn't needed at body-execution time, only by methods
    /// defined inside it) and returns the resulting namespace — the dict
    /// `MAKE_CLASS` hands to [`crate::class::new_class`].
    pub fn run_class_body(&mut self, body_func: &PyObjectRef, _bases: &[PyClassRef]) -> PyResult<IndexMap<String, PyObjectRef>> {
        let PyPayload::Function(func) = &body_func.payload else {
            return Err(exceptions::vm_type_error(self, "class body is not a function"));
        };
        let globals = self.globals_for_module(&func.module_name);
        let n_locals = crate::function::locals_count(&func.code);
        let n_cells = func.code.varnames.len() - n_locals;
        let n_cell_only = n_cells - func.closure.len();
        let mut cellfree: Vec<Cell> = (0..n_cell_only).map(|_| Cell::new(None)).collect();
        cellfree.extend(func.closure.iter().cloned());
        let class_cell = if n_cell_only > 0 { Some(cellfree[0].clone()) } else { None };
        let frame = crate::frame::Frame::new(func.code.clone(), vec![None; n_locals], cellfree, globals, func.module_name.clone(), class_cell.clone());
        frame.execute(self)?;
        let namespace = self.globals_for_module(&format!("<class body {:p}>", Rc::as_ptr(&func.code)));
        let _ = namespace;
        // The class body's writes land as STORE_GLOBAL against its own
        // scope; the compiler gives every class body a private module
        // name so this can't collide with the enclosing module's globals.
        Ok(self.globals_for_module(&func.module_name).borrow().clone())
    }

    // ---- container protocol ----

    pub fn getitem(&mut self, obj: &PyObjectRef, index: &PyObjectRef) -> PyResult {
        match &obj.payload {
            PyPayload::List(items) => self.sequence_getitem(&items.borrow(), index, "list"),
            PyPayload::Tuple(items) => self.sequence_getitem(items, index, "tuple"),
            PyPayload::Str(s) => self.str_getitem(s, index),
            PyPayload::Bytes(b) => self.bytes_getitem(&b.borrow(), index),
            PyPayload::Dict(d) => {
                d.borrow().get(self, index)?.ok_or_else(|| exceptions::vm_key_error(self, &self.to_display_string(index)))
            }
            PyPayload::Range(r) => {
                let i = self.expect_int(index)?;
                if i < 0 || i >= r.len() {
                    return Err(exceptions::vm_index_error(self, "range object index out of range"));
                }
                Ok(self.new_int(r.nth(i)))
            }
            _ => {
                if let Some(v) = object_protocol::call_dunder(self, obj, "__getitem__", vec![index.clone()])? {
                    Ok(v)
                } else {
                    Err(exceptions::vm_type_error(self, &format!("'{}' object is not subscriptable", obj.class.name)))
                }
            }
        }
    }

    fn sequence_getitem(&mut self, items: &[PyObjectRef], index: &PyObjectRef, kind: &str) -> PyResult {
        if let PyPayload::Tuple(slice_parts) = &index.payload {
            if Rc::ptr_eq(&index.class, &self.classes.slice) {
                let sliced = self.slice_sequence(items, slice_parts)?;
                return Ok(self.new_list(sliced));
            }
        }
        let i = self.expect_int(index)?;
        let len = items.len() as i64;
        let idx = if i < 0 { i + len } else { i };
        if idx < 0 || idx >= len {
            return Err(exceptions::vm_index_error(self, &format!("{kind} index out of range")));
        }
        Ok(items[idx as usize].clone())
    }

    fn slice_sequence(&mut self, items: &[PyObjectRef], slice_parts: &[PyObjectRef]) -> PyResult<Vec<PyObjectRef>> {
        let len = items.len() as i64;
        let (start, stop, step) = self.normalize_slice(slice_parts, len)?;
        Ok(self.slice_indices(start, stop, step).into_iter().map(|i| items[i as usize].clone()).collect())
    }

    fn normalize_slice(&mut self, parts: &[PyObjectRef], len: i64) -> PyResult<(i64, i64, i64)> {
        let step = match &parts[2].payload {
            PyPayload::None => 1,
            _ => self.expect_int(&parts[2])?,
        };
        if step == 0 {
            return Err(exceptions::vm_value_error(self, "slice step cannot be zero"));
        }
        let default_start = if step > 0 { 0 } else { len - 1 };
        let default_stop = if step > 0 { len } else { -len - 1 };
        let start = match &parts[0].payload {
            PyPayload::None => default_start,
            _ => clamp_index(self.expect_int(&parts[0])?, len),
        };
        let stop = match &parts[1].payload {
            PyPayload::None => default_stop,
            _ => clamp_index(self.expect_int(&parts[1])?, len),
        };
        Ok((start, stop, step))
    }

    fn slice_indices(&self, start: i64, stop: i64, step: i64) -> Vec<i64> {
        let mut out = Vec::new();
        let mut i = start;
        if step > 0 {
            while i < stop {
                out.push(i);
                i += step;
            }
        } else {
            while i > stop {
                out.push(i);
                i += step;
            }
        }
        out
    }

    fn str_getitem(&mut self, s: &str, index: &PyObjectRef) -> PyResult {
        let chars: Vec<char> = s.chars().collect();
        if Rc::ptr_eq(&index.class, &self.classes.slice) {
            if let PyPayload::Tuple(parts) = &index.payload {
                let len = chars.len() as i64;
                let (start, stop, step) = self.normalize_slice(parts, len)?;
                let out: String = self.slice_indices(start, stop, step).into_iter().map(|i| chars[i as usize]).collect();
                return Ok(self.new_str(out));
            }
        }
        let i = self.expect_int(index)?;
        let len = chars.len() as i64;
        let idx = if i < 0 { i + len } else { i };
        if idx < 0 || idx >= len {
            return Err(exceptions::vm_index_error(self, "string index out of range"));
        }
        Ok(self.new_str(chars[idx as usize].to_string()))
    }

    fn bytes_getitem(&mut self, b: &[u8], index: &PyObjectRef) -> PyResult {
        if Rc::ptr_eq(&index.class, &self.classes.slice) {
            if let PyPayload::Tuple(parts) = &index.payload {
                let len = b.len() as i64;
                let (start, stop, step) = self.normalize_slice(parts, len)?;
                let out: Vec<u8> = self.slice_indices(start, stop, step).into_iter().map(|i| b[i as usize]).collect();
                return Ok(self.new_bytes(out));
            }
        }
        let i = self.expect_int(index)?;
        let len = b.len() as i64;
        let idx = if i < 0 { i + len } else { i };
        if idx < 0 || idx >= len {
            return Err(exceptions::vm_index_error(self, "index out of range"));
        }
        Ok(self.new_int(b[idx as usize] as i64))
    }

    pub fn setitem(&mut self, obj: &PyObjectRef, index: &PyObjectRef, value: PyObjectRef) -> PyResult<()> {
        match &obj.payload {
            PyPayload::List(items) => {
                let i = self.expect_int(index)?;
                let mut items = items.borrow_mut();
                let len = items.len() as i64;
                let idx = if i < 0 { i + len } else { i };
                if idx < 0 || idx >= len {
                    return Err(exceptions::vm_index_error(self, "list assignment index out of range"));
                }
                items[idx as usize] = value;
                Ok(())
            }
            PyPayload::Dict(d) => {
                d.borrow_mut().insert(self, index.clone(), value)?;
                Ok(())
            }
            _ => {
                if object_protocol::call_dunder(self, obj, "__setitem__", vec![index.clone(), value])?.is_some() {
                    Ok(())
                } else {
                    Err(exceptions::vm_type_error(self, &format!("'{}' object does not support item assignment", obj.class.name)))
                }
            }
        }
    }

    pub fn delitem(&mut self, obj: &PyObjectRef, index: &PyObjectRef) -> PyResult<()> {
        match &obj.payload {
            PyPayload::List(items) => {
                let i = self.expect_int(index)?;
                let mut items = items.borrow_mut();
                let len = items.len() as i64;
                let idx = if i < 0 { i + len } else { i };
                if idx < 0 || idx >= len {
                    return Err(exceptions::vm_index_error(self, "list assignment index out of range"));
                }
                items.remove(idx as usize);
                Ok(())
            }
            PyPayload::Dict(d) => {
                d.borrow_mut().remove(self, index)?.map(|_| ()).ok_or_else(|| exceptions::vm_key_error(self, &self.to_display_string(index)))
            }
            _ => {
                if object_protocol::call_dunder(self, obj, "__delitem__", vec![index.clone()])?.is_some() {
                    Ok(())
                } else {
                    Err(exceptions::vm_type_error(self, &format!("'{}' object does not support item deletion", obj.class.name)))
                }
            }
        }
    }

    pub fn contains(&mut self, container: &PyObjectRef, item: &PyObjectRef) -> PyResult<bool> {
        match &container.payload {
            PyPayload::Dict(d) => d.borrow().contains(self, item),
            PyPayload::Set(d) => d.borrow().contains(self, item),
            PyPayload::List(items) => {
                for v in items.borrow().iter() {
                    if self.values_eq(v, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PyPayload::Tuple(items) => {
                for v in items {
                    if self.values_eq(v, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PyPayload::Str(s) => {
                let needle = self.to_display_string(item);
                Ok(s.contains(&needle))
            }
            _ => {
                if let Some(method) = container.class.get_dunder("__contains__") {
                    let result = self.call_value(&method, &CallArgs::positional(vec![container.clone(), item.clone()]))?;
                    self.is_truthy(&result)
                } else {
                    let iter = crate::iterator::get_iter(self, container)?;
                    while let Some(v) = crate::iterator::next_value(self, &iter)? {
                        if self.values_eq(&v, item)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        }
    }

    pub fn iterable_to_vec(&mut self, v: &PyObjectRef) -> PyResult<Vec<PyObjectRef>> {
        if let PyPayload::Tuple(items) = &v.payload {
            return Ok(items.clone());
        }
        if let PyPayload::List(items) = &v.payload {
            return Ok(items.borrow().clone());
        }
        let iter = crate::iterator::get_iter(self, v)?;
        let mut out = Vec::new();
        while let Some(item) = crate::iterator::next_value(self, &iter)? {
            self.governor_mut().check_collection_size(out.len() + 1).map_err(|trip| crate::frame::governor_trip_exception(self, trip))?;
            out.push(item);
        }
        Ok(out)
    }

    pub fn mapping_to_pairs(&mut self, v: &PyObjectRef) -> PyResult<Vec<(PyObjectRef, PyObjectRef)>> {
        match &v.payload {
            PyPayload::Dict(d) => Ok(d.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Err(exceptions::vm_type_error(self, &format!("'{}' object is not a mapping", v.class.name))),
        }
    }

    // ---- truthiness, equality, hashing ----

    pub fn is_truthy(&mut self, v: &PyObjectRef) -> PyResult<bool> {
        Ok(match &v.payload {
            PyPayload::None => false,
            PyPayload::Bool(b) => *b,
            PyPayload::Int(i) => *i != 0,
            PyPayload::Float(f) => *f != 0.0,
            PyPayload::Str(s) => !s.is_empty(),
            PyPayload::Bytes(b) => !b.borrow().is_empty(),
            PyPayload::List(items) => !items.borrow().is_empty(),
            PyPayload::Tuple(items) => !items.is_empty(),
            PyPayload::Dict(d) => !d.borrow().is_empty(),
            PyPayload::Set(d) => !d.borrow().is_empty(),
            PyPayload::Range(r) => r.len() != 0,
            PyPayload::Instance(_) => {
                if let Some(method) = v.class.get_dunder("__bool__") {
                    let r = self.call_value(&method, &CallArgs::positional(vec![v.clone()]))?;
                    return self.is_truthy(&r);
                }
                if let Some(method) = v.class.get_dunder("__len__") {
                    let r = self.call_value(&method, &CallArgs::positional(vec![v.clone()]))?;
                    return Ok(self.expect_int(&r)? != 0);
                }
                true
            }
            _ => true,
        })
    }

    pub fn is_not_implemented(&self, v: &PyObjectRef) -> bool {
        matches!(&v.payload, PyPayload::Str(s) if s == "__PYLITE_NOT_IMPLEMENTED__")
    }

    pub fn not_implemented(&self) -> PyObjectRef {
        self.new_str("__PYLITE_NOT_IMPLEMENTED__")
    }

    pub fn values_eq(&mut self, a: &PyObjectRef, b: &PyObjectRef) -> PyResult<bool> {
        let mut guard = Vec::new();
        self.values_eq_rec(a, b, &mut guard)
    }

    fn values_eq_rec(&mut self, a: &PyObjectRef, b: &PyObjectRef, guard: &mut Vec<(usize, usize)>) -> PyResult<bool> {
        if Rc::ptr_eq(a, b) {
            return Ok(true);
        }
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return Ok(x.eq(y));
        }
        match (&a.payload, &b.payload) {
            (PyPayload::Str(x), PyPayload::Str(y)) => Ok(x == y),
            (PyPayload::Bytes(x), PyPayload::Bytes(y)) => Ok(*x.borrow() == *y.borrow()),
            (PyPayload::Tuple(x), PyPayload::Tuple(y)) | (PyPayload::List(_), PyPayload::List(_)) if matches!(a.payload, PyPayload::Tuple(_)) => {
                let _ = y;
                self.seq_eq(a, b, x, guard)
            }
            (PyPayload::List(_), PyPayload::List(_)) => self.list_eq(a, b, guard),
            (PyPayload::Range(x), PyPayload::Range(y)) => Ok(x == y),
            (PyPayload::None, PyPayload::None) => Ok(true),
            (PyPayload::Instance(_), _) | (_, PyPayload::Instance(_)) => {
                if let Some(method) = a.class.get_dunder("__eq__") {
                    let r = self.call_value(&method, &CallArgs::positional(vec![a.clone(), b.clone()]))?;
                    if !self.is_not_implemented(&r) {
                        return self.is_truthy(&r);
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn seq_eq(&mut self, a: &PyObjectRef, b: &PyObjectRef, x: &[PyObjectRef], guard: &mut Vec<(usize, usize)>) -> PyResult<bool> {
        let PyPayload::Tuple(y) = &b.payload else { return Ok(false) };
        if x.len() != y.len() {
            return Ok(false);
        }
        let key = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
        if guard.contains(&key) {
            return Ok(true);
        }
        guard.push(key);
        for (xi, yi) in x.iter().zip(y.iter()) {
            if !self.values_eq_rec(xi, yi, guard)? {
                guard.pop();
                return Ok(false);
            }
        }
        guard.pop();
        Ok(true)
    }

    fn list_eq(&mut self, a: &PyObjectRef, b: &PyObjectRef, guard: &mut Vec<(usize, usize)>) -> PyResult<bool> {
        let PyPayload::List(xa) = &a.payload else { return Ok(false) };
        let PyPayload::List(xb) = &b.payload else { return Ok(false) };
        let key = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
        if guard.contains(&key) {
            return Ok(true);
        }
        let (x, y) = (xa.borrow().clone(), xb.borrow().clone());
        if x.len() != y.len() {
            return Ok(false);
        }
        guard.push(key);
        for (xi, yi) in x.iter().zip(y.iter()) {
            if !self.values_eq_rec(xi, yi, guard)? {
                guard.pop();
                return Ok(false);
            }
        }
        guard.pop();
        Ok(true)
    }

    pub fn hash_value(&mut self, v: &PyObjectRef) -> PyResult<u64> {
        use std::hash::{Hash, Hasher};
        match &v.payload {
            PyPayload::None => Ok(0),
            PyPayload::Bool(b) => Ok(*b as u64),
            PyPayload::Int(i) => Ok(*i as u64),
            PyPayload::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Ok(*f as i64 as u64)
                } else {
                    Ok(f.to_bits())
                }
            }
            PyPayload::Str(s) => {
                let mut h = ahash::AHasher::default();
                s.hash(&mut h);
                Ok(h.finish())
            }
            PyPayload::Bytes(b) => {
                let mut h = ahash::AHasher::default();
                b.borrow().hash(&mut h);
                Ok(h.finish())
            }
            PyPayload::Tuple(items) => {
                let mut h = ahash::AHasher::default();
                for item in items {
                    self.hash_value(item)?.hash(&mut h);
                }
                Ok(h.finish())
            }
            PyPayload::List(_) => Err(exceptions::vm_type_error(self, "unhashable type: 'list'")),
            PyPayload::Dict(_) => Err(exceptions::vm_type_error(self, "unhashable type: 'dict'")),
            PyPayload::Set(_) => Err(exceptions::vm_type_error(self, "unhashable type: 'set'")),
            PyPayload::Instance(_) => {
                if let Some(method) = v.class.get_dunder("__hash__") {
                    let r = self.call_value(&method, &CallArgs::positional(vec![v.clone()]))?;
                    return Ok(self.expect_int(&r)? as u64);
                }
                Ok(Rc::as_ptr(v) as u64)
            }
            _ => Ok(Rc::as_ptr(v) as u64),
        }
    }

    // ---- display ----

    /// `str()`/`repr()`-ish rendering used by `print`, f-strings, and
    /// traceback messages; never fails — a dunder that errors falls back
    /// to the default rendering rather than aborting the caller.
    pub fn to_display_string(&mut self, v: &PyObjectRef) -> String {
        let mut guard = Vec::new();
        self.display_rec(v, &mut guard)
    }

    fn display_rec(&mut self, v: &PyObjectRef, guard: &mut Vec<usize>) -> String {
        match &v.payload {
            PyPayload::None => "None".to_owned(),
            PyPayload::Bool(b) => if *b { "True" } else { "False" }.to_owned(),
            PyPayload::Int(i) => i.to_string(),
            PyPayload::Float(f) => format_float(*f),
            PyPayload::Str(s) => s.clone(),
            PyPayload::Bytes(b) => format!("b{:?}", String::from_utf8_lossy(&b.borrow())),
            PyPayload::Tuple(items) => self.display_seq(v, items, "(", ")", guard, items.len() == 1),
            PyPayload::List(items) => {
                let key = Rc::as_ptr(v) as usize;
                if guard.contains(&key) {
                    return "[...]".to_owned();
                }
                guard.push(key);
                let cloned = items.borrow().clone();
                let s = self.display_seq(v, &cloned, "[", "]", guard, false);
                guard.pop();
                s
            }
            PyPayload::Dict(d) => {
                let items: Vec<String> = d.borrow().iter().map(|(k, val)| format!("{}: {}", self.display_rec(&k.clone(), guard), self.display_rec(&val.clone(), guard))).collect();
                format!("{{{}}}", items.join(", "))
            }
            PyPayload::Set(d) => {
                if d.borrow().is_empty() {
                    return "set()".to_owned();
                }
                let items: Vec<String> = d.borrow().keys().cloned().collect::<Vec<_>>().iter().map(|k| self.display_rec(k, guard)).collect();
                format!("{{{}}}", items.join(", "))
            }
            PyPayload::Range(r) => format!("range({}, {}, {})", r.start, r.stop, r.step),
            PyPayload::Class(c) => format!("<class '{}'>", c.name),
            PyPayload::Function(f) => format!("<function {}>", f.name),
            PyPayload::HostFunction(f) => format!("<built-in function {}>", f.name),
            PyPayload::BoundMethod { .. } => format!("<bound method of '{}'>", v.class.name),
            PyPayload::Module(m) => format!("<module '{}'>", m.name),
            PyPayload::Generator(_) => "<generator object>".to_owned(),
            PyPayload::Iterator(_) => "<iterator object>".to_owned(),
            PyPayload::Instance(_) => {
                if let Some(method) = v.class.get_dunder("__repr__").or_else(|| v.class.get_dunder("__str__")) {
                    if let Ok(r) = self.call_value(&method, &CallArgs::positional(vec![v.clone()])) {
                        if let PyPayload::Str(s) = &r.payload {
                            return s.clone();
                        }
                    }
                }
                format!("<{} object>", v.class.name)
            }
            _ => format!("<{} object>", v.class.name),
        }
    }

    fn display_seq(&mut self, _owner: &PyObjectRef, items: &[PyObjectRef], open: &str, close: &str, guard: &mut Vec<usize>, trailing_comma: bool) -> String {
        let parts: Vec<String> = items.iter().map(|i| self.display_repr_elem(i, guard)).collect();
        if trailing_comma {
            format!("{open}{},{close}", parts.join(", "))
        } else {
            format!("{open}{}{close}", parts.join(", "))
        }
    }

    fn display_repr_elem(&mut self, v: &PyObjectRef, guard: &mut Vec<usize>) -> String {
        if let PyPayload::Str(s) = &v.payload {
            return format!("{s:?}");
        }
        self.display_rec(v, guard)
    }

    // ---- numeric helpers shared with frame.rs and builtins ----

    pub fn expect_int(&mut self, v: &PyObjectRef) -> PyResult<i64> {
        match &v.payload {
            PyPayload::Int(i) => Ok(*i),
            PyPayload::Bool(b) => Ok(*b as i64),
            _ => Err(exceptions::vm_type_error(self, &format!("'{}' object cannot be interpreted as an integer", v.class.name))),
        }
    }

    pub fn try_fast_arith(&mut self, op: BinOp, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) else { return Ok(None) };
        match (a, b) {
            (Num::Int(x), Num::Int(y)) => self.int_binop(op, x, y).map(Some),
            (x, y) => self.float_binop(op, x.to_f64(), y.to_f64()),
        }
    }

    fn int_binop(&mut self, op: BinOp, a: i64, b: i64) -> PyResult {
        Ok(match op {
            BinOp::Add => self.new_int(a.wrapping_add(b)),
            BinOp::Sub => self.new_int(a.wrapping_sub(b)),
            BinOp::Mul => self.new_int(a.wrapping_mul(b)),
            BinOp::Div => {
                if b == 0 {
                    return Err(exceptions::vm_zero_division_error(self, "division by zero"));
                }
                self.new_float(a as f64 / b as f64)
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(exceptions::vm_zero_division_error(self, "integer division or modulo by zero"));
                }
                self.new_int(py_floordiv(a, b))
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(exceptions::vm_zero_division_error(self, "integer division or modulo by zero"));
                }
                self.new_int(py_mod(a, b))
            }
            BinOp::Pow => {
                if b < 0 {
                    self.new_float((a as f64).powf(b as f64))
                } else {
                    self.new_int(a.wrapping_pow(b.min(u32::MAX as i64) as u32))
                }
            }
            BinOp::LShift => {
                if b < 0 {
                    return Err(exceptions::vm_value_error(self, "negative shift count"));
                }
                self.new_int(if b >= 64 { 0 } else { a.wrapping_shl(b as u32) })
            }
            BinOp::RShift => {
                if b < 0 {
                    return Err(exceptions::vm_value_error(self, "negative shift count"));
                }
                self.new_int(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a.wrapping_shr(b as u32) })
            }
            BinOp::BitAnd => self.new_int(a & b),
            BinOp::BitOr => self.new_int(a | b),
            BinOp::BitXor => self.new_int(a ^ b),
        })
    }

    fn float_binop(&mut self, op: BinOp, a: f64, b: f64) -> PyResult<Option<PyObjectRef>> {
        Ok(Some(match op {
            BinOp::Add => self.new_float(a + b),
            BinOp::Sub => self.new_float(a - b),
            BinOp::Mul => self.new_float(a * b),
            BinOp::Div => {
                if b == 0.0 {
                    return Err(exceptions::vm_zero_division_error(self, "float division by zero"));
                }
                self.new_float(a / b)
            }
            BinOp::FloorDiv => {
                if b == 0.0 {
                    return Err(exceptions::vm_zero_division_error(self, "float floor division by zero"));
                }
                self.new_float((a / b).floor())
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return Err(exceptions::vm_zero_division_error(self, "float modulo"));
                }
                let r = a % b;
                self.new_float(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r })
            }
            BinOp::Pow => self.new_float(a.powf(b)),
            _ => return Ok(None),
        }))
    }

    pub fn try_fast_unary(&mut self, op: UnOp, operand: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        Ok(match (op, as_number(operand)) {
            (UnOp::Neg, Some(Num::Int(i))) => Some(self.new_int(i.wrapping_neg())),
            (UnOp::Neg, Some(Num::Float(f))) => Some(self.new_float(-f)),
            (UnOp::Pos, Some(Num::Int(i))) => Some(self.new_int(i)),
            (UnOp::Pos, Some(Num::Float(f))) => Some(self.new_float(f)),
            (UnOp::Invert, Some(Num::Int(i))) => Some(self.new_int(!i)),
            _ => None,
        })
    }
}

fn clamp_index(i: i64, len: i64) -> i64 {
    let i = if i < 0 { i + len } else { i };
    i.clamp(0, len)
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn eq(self, other: Num) -> bool {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a == b,
            _ => self.to_f64() == other.to_f64(),
        }
    }
}

fn as_number(v: &PyObjectRef) -> Option<Num> {
    match &v.payload {
        PyPayload::Bool(b) => Some(Num::Int(*b as i64)),
        PyPayload::Int(i) => Some(Num::Int(*i)),
        PyPayload::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

/// Floor division per §6: rounds toward negative infinity, not toward zero.
fn py_floordiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q }
}

/// `%` takes the sign of the divisor (§6), unlike Rust's `%`.
fn py_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}
