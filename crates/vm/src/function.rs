//! Function values and the argument-binding algorithm (§4.3 "calling
//! convention", §4.6). A [`PyFunction`] pairs a compiled [`CodeObject`]
//! with the defaults and closure cells captured at `MAKE_FUNCTION` time;
//! [`bind_arguments`] turns a call's positional/keyword arguments into the
//! initial local/cell storage for a new [`crate::frame::Frame`].

use crate::exceptions::vm_type_error;
use crate::host::{PyResult, VirtualMachine};
use crate::value::PyObjectRef;
use pylite_bytecode::{CodeObject, VarKind};
use std::cell::RefCell;
use std::rc::Rc;

/// A mutable closure cell; a free variable and the cell that owns its
/// storage share one of these (§4.3 Closures).
#[derive(Clone, Default)]
pub struct Cell(pub Rc<RefCell<Option<PyObjectRef>>>);

impl Cell {
    pub fn new(value: Option<PyObjectRef>) -> Self {
        Cell(Rc::new(RefCell::new(value)))
    }

    pub fn get(&self) -> Option<PyObjectRef> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: PyObjectRef) {
        *self.0.borrow_mut() = Some(value);
    }
}

pub struct PyFunction {
    pub name: String,
    pub code: Rc<CodeObject>,
    pub defaults: Vec<PyObjectRef>,
    pub kw_defaults: Vec<(String, PyObjectRef)>,
    /// Captured free-variable cells, in the same order as the `Free`-kind
    /// suffix of `code.varnames`.
    pub closure: Vec<Cell>,
    pub module_name: String,
    /// The implicit `__class__` cell for zero-arg `super()`, when
    /// `HAS_CLASS_CELL` is set (§4.4).
    pub class_cell: Option<Cell>,
}

/// Arguments as gathered at a call site, after `*args`/`**kwargs`
/// unpacking has already flattened any spread values (§4.2 `Call`).
#[derive(Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<PyObjectRef>,
    pub keywords: Vec<(String, PyObjectRef)>,
}

impl CallArgs {
    pub fn positional(args: Vec<PyObjectRef>) -> Self {
        CallArgs { positional: args, keywords: Vec::new() }
    }
}

/// Where a name's storage lives in a frame — the two index spaces
/// `LoadLocal`/`LoadCell` address (§3 CodeObject, `Layout::local_idx` /
/// `Layout::cellfree_idx` on the compiler side).
#[derive(Clone, Copy)]
pub enum NameSlot {
    Local(usize),
    CellFree(usize),
}

/// `varnames` is laid out as `[locals..., cells..., frees...]`; the first
/// run of `Parameter`/`Local`-kind entries is the `LoadLocal` index space,
/// the remainder (by position, not by re-filtering kind) is the
/// `LoadCell` index space.
pub fn locals_count(code: &CodeObject) -> usize {
    code.varnames.iter().take_while(|v| matches!(v.kind, VarKind::Parameter | VarKind::Local)).count()
}

pub fn resolve_slot(code: &CodeObject, name: &str) -> Option<NameSlot> {
    let n_locals = locals_count(code);
    if let Some(i) = code.varnames[..n_locals].iter().position(|v| v.name == name) {
        return Some(NameSlot::Local(i));
    }
    code.varnames[n_locals..].iter().position(|v| v.name == name).map(|i| NameSlot::CellFree(i))
}

pub struct BoundArgs {
    pub locals: Vec<Option<PyObjectRef>>,
    /// `(cellfree_idx, value)` pairs for parameters an inner scope closes
    /// over — their storage is a cell even though they're bound like any
    /// other parameter.
    pub cell_init: Vec<(usize, PyObjectRef)>,
}

fn store(code: &CodeObject, out: &mut BoundArgs, name: &str, value: PyObjectRef) {
    match resolve_slot(code, name) {
        Some(NameSlot::Local(i)) => out.locals[i] = Some(value),
        Some(NameSlot::CellFree(i)) => out.cell_init.push((i, value)),
        None => {}
    }
}

fn slot_filled(code: &CodeObject, out: &BoundArgs, name: &str) -> bool {
    match resolve_slot(code, name) {
        Some(NameSlot::Local(i)) => out.locals[i].is_some(),
        Some(NameSlot::CellFree(i)) => out.cell_init.iter().any(|(j, _)| *j == i),
        None => false,
    }
}

/// Binds a call's positional/keyword arguments per Python's calling
/// convention: positional-by-position, then defaults, then `*args`,
/// keyword-by-name (positional or keyword-only), then keyword-only
/// defaults, then `**kwargs` for anything left over.
pub fn bind_arguments(vm: &mut VirtualMachine, func: &PyFunction, args: &CallArgs) -> PyResult<BoundArgs> {
    let code = &func.code;
    let mut out = BoundArgs { locals: vec![None; locals_count(code)], cell_init: Vec::new() };

    let n_positional = code.param_names.len();
    let n_given = args.positional.len();
    let n_filled = n_given.min(n_positional);
    for i in 0..n_filled {
        store(code, &mut out, &code.param_names[i], args.positional[i].clone());
    }

    if n_given > n_positional {
        match &code.vararg_name {
            Some(name) => {
                let extra = vm.new_tuple(args.positional[n_positional..].to_vec());
                store(code, &mut out, name, extra);
            }
            None => {
                return Err(vm_type_error(
                    vm,
                    &format!("{}() takes {n_positional} positional argument(s) but {n_given} were given", func.name),
                ));
            }
        }
    } else if let Some(name) = &code.vararg_name {
        let empty = vm.new_tuple(Vec::new());
        store(code, &mut out, name, empty);
    }

    let n_defaults = func.defaults.len();
    let first_with_default = n_positional.saturating_sub(n_defaults);
    for i in n_filled..n_positional {
        if i >= first_with_default {
            store(code, &mut out, &code.param_names[i], func.defaults[i - first_with_default].clone());
        }
    }

    let mut extra_kwargs: Vec<(String, PyObjectRef)> = Vec::new();
    for (name, value) in &args.keywords {
        let is_known = code.param_names.contains(name) || code.kwonly_args.contains(name);
        if is_known {
            store(code, &mut out, name, value.clone());
        } else {
            extra_kwargs.push((name.clone(), value.clone()));
        }
    }

    for (name, default) in &func.kw_defaults {
        if !slot_filled(code, &out, name) {
            store(code, &mut out, name, default.clone());
        }
    }

    if let Some(name) = &code.kwarg_name {
        let dict = vm.new_dict();
        if let crate::value::PyPayload::Dict(d) = &dict.payload {
            for (k, v) in extra_kwargs.drain(..) {
                let key = vm.new_str(k);
                d.borrow_mut().insert(vm, key, v)?;
            }
        }
        store(code, &mut out, name, dict);
    } else if !extra_kwargs.is_empty() {
        return Err(vm_type_error(vm, &format!("{}() got an unexpected keyword argument '{}'", func.name, extra_kwargs[0].0)));
    }

    for name in code.param_names.iter().chain(code.kwonly_args.iter()) {
        if !slot_filled(code, &out, name) {
            return Err(vm_type_error(vm, &format!("{}() missing required argument: '{name}'", func.name)));
        }
    }

    Ok(out)
}
