//! The exception hierarchy (§7 Error Handling Design) and the
//! `ExceptionGroup`/`BaseExceptionGroup` operations §8's scenario 2
//! exercises. An exception value is an ordinary instance of a class
//! descended from `BaseException`; there is no separate payload variant —
//! `args`, `__cause__`, `__context__`, `__notes__`, `__traceback__`, and
//! (for groups) `exceptions` all live in the instance's attribute dict,
//! the same place a user `__init__` override would put any other field.

use crate::class::new_builtin_class;
use crate::host::{PyResult, VirtualMachine};
use crate::value::{PyClassRef, PyInstance, PyObjectRef, PyPayload};
use indexmap::IndexMap;

pub type PyException = PyObjectRef;

/// One row of the hierarchy: a class name and its immediate base's name
/// (`None` only for `BaseException`, whose base is `object`).
const HIERARCHY: &[(&str, Option<&str>)] = &[
    ("BaseException", None),
    ("Exception", Some("BaseException")),
    ("ArithmeticError", Some("Exception")),
    ("ZeroDivisionError", Some("ArithmeticError")),
    ("OverflowError", Some("ArithmeticError")),
    ("LookupError", Some("Exception")),
    ("IndexError", Some("LookupError")),
    ("KeyError", Some("LookupError")),
    ("TypeError", Some("Exception")),
    ("ValueError", Some("Exception")),
    ("NameError", Some("Exception")),
    ("UnboundLocalError", Some("NameError")),
    ("AttributeError", Some("Exception")),
    ("RuntimeError", Some("Exception")),
    ("NotImplementedError", Some("RuntimeError")),
    ("RecursionError", Some("RuntimeError")),
    ("ImportError", Some("Exception")),
    ("ModuleNotFoundError", Some("ImportError")),
    ("OSError", Some("Exception")),
    ("TimeoutError", Some("OSError")),
    ("FileNotFoundError", Some("OSError")),
    ("PermissionError", Some("OSError")),
    ("CancelledError", Some("BaseException")),
    ("QuotaError", Some("RuntimeError")),
    ("MemoryError", Some("Exception")),
    ("AssertionError", Some("Exception")),
    ("StopIteration", Some("Exception")),
    ("StopAsyncIteration", Some("Exception")),
    ("GeneratorExit", Some("BaseException")),
    ("KeyboardInterrupt", Some("BaseException")),
    ("SystemExit", Some("BaseException")),
    ("BaseExceptionGroup", Some("BaseException")),
    ("ExceptionGroup", Some("BaseExceptionGroup")),
];

/// Builds every class named in [`HIERARCHY`], rooted at `object_class`.
/// Returns a name → class lookup the VM keeps around for `raise`,
/// `except` matching, and host-facing exception construction.
pub fn build_hierarchy(object_class: &PyClassRef) -> IndexMap<String, PyClassRef> {
    let mut classes: IndexMap<String, PyClassRef> = IndexMap::new();
    for (name, base) in HIERARCHY {
        let bases = match base {
            None => vec![object_class.clone()],
            Some(b) => vec![classes.get(*b).expect("hierarchy listed in base-before-derived order").clone()],
        };
        let class = new_builtin_class(name, bases, None);
        classes.insert((*name).to_owned(), class);
    }
    // `IOError` is a plain alias for `OSError` in Python 3 (not a
    // subclass) — `except IOError` must catch exactly the same instances
    // as `except OSError`.
    let os_error = classes.get("OSError").expect("OSError registered above").clone();
    classes.insert("IOError".to_owned(), os_error);
    classes
}

fn new_instance_of(_vm: &VirtualMachine, class: &PyClassRef) -> PyObjectRef {
    PyObjectRef::new(crate::value::PyObject { class: class.clone(), payload: PyPayload::Instance(PyInstance::new_dict()) })
}

fn set_attr(obj: &PyObjectRef, name: &str, value: PyObjectRef) {
    if let PyPayload::Instance(inst) = &obj.payload {
        let _ = inst.set(&obj.class, name, value);
    }
}

pub fn attr(obj: &PyObjectRef, name: &str) -> Option<PyObjectRef> {
    if let PyPayload::Instance(inst) = &obj.payload {
        inst.get(&obj.class, name)
    } else {
        None
    }
}

/// Constructs an exception instance of the named builtin class with a
/// single string argument, the common case for VM-raised errors.
pub fn new_exception(vm: &mut VirtualMachine, class_name: &str, message: &str) -> PyException {
    let class = vm.exc_class(class_name).clone();
    let exc = new_instance_of(vm, &class);
    let msg = vm.new_str(message.to_owned());
    let args = vm.new_tuple(vec![msg]);
    set_attr(&exc, "args", args);
    set_attr(&exc, "__notes__", vm.new_list(Vec::new()));
    set_attr(&exc, "__cause__", vm.none());
    set_attr(&exc, "__context__", vm.none());
    set_attr(&exc, "__suppress_context__", vm.new_bool(false));
    set_attr(&exc, "__traceback__", vm.new_list(Vec::new()));
    exc
}

pub fn new_exception_group(vm: &mut VirtualMachine, message: &str, exceptions: Vec<PyException>, is_base: bool) -> PyException {
    let class_name = if is_base { "BaseExceptionGroup" } else { "ExceptionGroup" };
    let exc = new_exception(vm, class_name, message);
    let list = vm.new_tuple(exceptions);
    set_attr(&exc, "exceptions", list);
    exc
}

pub fn group_exceptions(exc: &PyException) -> Option<Vec<PyObjectRef>> {
    match attr(exc, "exceptions")?.payload {
        PyPayload::Tuple(ref items) => Some(items.clone()),
        _ => None,
    }
}

pub fn is_instance_of(vm: &VirtualMachine, exc: &PyException, class_name: &str) -> bool {
    vm.exc_class_opt(class_name).map(|c| exc.class.is_subclass_of(&c)).unwrap_or(false)
}

/// `BaseExceptionGroup.split(matcher)`: partitions the group's leaves into
/// a "matched" subgroup and a "rest" subgroup by class name, preserving
/// nesting shape for sub-groups whose leaves split across both sides
/// (§8 scenario 2).
pub fn split_group(vm: &mut VirtualMachine, group: &PyException, matcher_class: &str) -> (Option<PyException>, Option<PyException>) {
    let Some(items) = group_exceptions(group) else { return (None, None) };
    let mut matched = Vec::new();
    let mut rest = Vec::new();
    for item in items {
        if let Some(_sub) = group_exceptions(&item) {
            let (m, r) = split_group(vm, &item, matcher_class);
            if let Some(m) = m {
                matched.push(m);
            }
            if let Some(r) = r {
                rest.push(r);
            }
        } else if is_instance_of(vm, &item, matcher_class) {
            matched.push(item);
        } else {
            rest.push(item);
        }
    }
    let message = attr(group, "args").and_then(|a| match &a.payload {
        PyPayload::Tuple(t) if !t.is_empty() => match &t[0].payload {
            PyPayload::Str(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }).unwrap_or_default();
    let is_base = !is_instance_of(vm, group, "ExceptionGroup");
    let matched = if matched.is_empty() { None } else { Some(new_exception_group(vm, &message, matched, is_base)) };
    let rest = if rest.is_empty() { None } else { Some(new_exception_group(vm, &message, rest, is_base)) };
    (matched, rest)
}

/// `BaseExceptionGroup.derive(excs)`: a new group with the same message
/// and notes but a replaced leaf list, used when a handler re-wraps a
/// subgroup it partially handled.
pub fn derive_group(vm: &mut VirtualMachine, group: &PyException, excs: Vec<PyException>) -> PyException {
    let message = attr(group, "args").and_then(|a| match &a.payload {
        PyPayload::Tuple(t) if !t.is_empty() => match &t[0].payload {
            PyPayload::Str(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }).unwrap_or_default();
    let is_base = !is_instance_of(vm, group, "ExceptionGroup");
    new_exception_group(vm, &message, excs, is_base)
}

pub fn vm_type_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "TypeError", message))
}
pub fn vm_value_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "ValueError", message))
}
pub fn vm_name_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "NameError", message))
}
pub fn vm_attribute_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "AttributeError", message))
}
pub fn vm_key_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "KeyError", message))
}
pub fn vm_index_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "IndexError", message))
}
pub fn vm_zero_division_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "ZeroDivisionError", message))
}
pub fn vm_stop_iteration(vm: &mut VirtualMachine, value: PyObjectRef) -> crate::host::VmError {
    let exc = new_exception(vm, "StopIteration", "");
    let args = vm.new_tuple(vec![value]);
    set_attr(&exc, "args", args);
    crate::host::VmError::Raised(exc)
}
pub fn vm_recursion_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "RecursionError", message))
}
pub fn vm_timeout_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "TimeoutError", message))
}
pub fn vm_memory_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "MemoryError", message))
}
pub fn vm_not_implemented_error(vm: &mut VirtualMachine, message: &str) -> crate::host::VmError {
    crate::host::VmError::Raised(new_exception(vm, "NotImplementedError", message))
}

pub fn format_traceback(vm: &mut VirtualMachine, exc: &PyException) -> PyResult<String> {
    let name = exc.class.name.clone();
    let message = attr(exc, "args").map(|a| match &a.payload {
        PyPayload::Tuple(t) if !t.is_empty() => vm.to_display_string(&t[0]),
        _ => String::new(),
    }).unwrap_or_default();
    Ok(if message.is_empty() { name } else { format!("{name}: {message}") })
}
