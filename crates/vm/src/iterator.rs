//! Built-in iterator objects for `GetIter`/`ForIter` (§4.2, §4.6). A
//! Python-level object with its own `__iter__`/`__next__` bypasses this
//! entirely — `get_iter` only builds one of these for the built-in
//! sequence/mapping types that don't carry their own iterator protocol.

use crate::dict::PyDict;
use crate::exceptions::vm_stop_iteration;
use crate::host::{PyResult, VirtualMachine};
use crate::value::{PyObjectRef, PyPayload, PyRange};
pub enum IterState {
    Seq { items: Vec<PyObjectRef>, idx: usize },
    Range { range: PyRange, idx: i64 },
    Str { chars: Vec<char>, idx: usize },
    DictKeys { items: Vec<PyObjectRef>, idx: usize },
    DictValues { items: Vec<PyObjectRef>, idx: usize },
    DictItems { items: Vec<(PyObjectRef, PyObjectRef)>, idx: usize },
}

pub fn get_iter(vm: &mut VirtualMachine, value: &PyObjectRef) -> PyResult<PyObjectRef> {
    if matches!(value.payload, PyPayload::Iterator(_) | PyPayload::Generator(_)) {
        return Ok(value.clone());
    }
    if let Some(method) = value.class.get_dunder("__iter__") {
        return vm.call_value(&method, &crate::function::CallArgs::positional(vec![value.clone()]));
    }
    let state = match &value.payload {
        PyPayload::List(items) => IterState::Seq { items: items.borrow().clone(), idx: 0 },
        PyPayload::Tuple(items) => IterState::Seq { items: items.clone(), idx: 0 },
        PyPayload::Range(r) => IterState::Range { range: *r, idx: 0 },
        PyPayload::Str(s) => IterState::Str { chars: s.chars().collect(), idx: 0 },
        PyPayload::Dict(d) => IterState::DictKeys { items: d.borrow().keys().cloned().collect(), idx: 0 },
        PyPayload::Set(d) => IterState::DictKeys { items: d.borrow().keys().cloned().collect(), idx: 0 },
        _ => return Err(crate::exceptions::vm_type_error(vm, &format!("'{}' object is not iterable", value.class.name))),
    };
    Ok(vm.new_iterator(state))
}

pub fn dict_keys_view(vm: &mut VirtualMachine, d: &PyDict) -> PyObjectRef {
    vm.new_iterator(IterState::DictKeys { items: d.keys().cloned().collect(), idx: 0 })
}

pub fn dict_values_view(vm: &mut VirtualMachine, d: &PyDict) -> PyObjectRef {
    vm.new_iterator(IterState::DictValues { items: d.values().cloned().collect(), idx: 0 })
}

pub fn dict_items_view(vm: &mut VirtualMachine, d: &PyDict) -> PyObjectRef {
    vm.new_iterator(IterState::DictItems { items: d.iter().map(|(k, v)| (k.clone(), v.clone())).collect(), idx: 0 })
}

/// `None` on exhaustion rather than a `StopIteration` error — `ForIter`
/// wants to branch, not unwind; `builtins::next` wraps this into the
/// exception when called directly.
pub fn next_value(vm: &mut VirtualMachine, iter: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
    if let PyPayload::Generator(_) = &iter.payload {
        return match crate::generator::resume(vm, iter, vm.none()) {
            Ok(v) => Ok(Some(v)),
            Err(crate::host::VmError::Raised(e)) if crate::exceptions::is_instance_of(vm, &e, "StopIteration") => Ok(None),
            Err(e) => Err(e),
        };
    }
    if let Some(method) = iter.class.get_dunder("__next__") {
        return match vm.call_value(&method, &crate::function::CallArgs::positional(vec![iter.clone()])) {
            Ok(v) => Ok(Some(v)),
            Err(crate::host::VmError::Raised(e)) if crate::exceptions::is_instance_of(vm, &e, "StopIteration") => Ok(None),
            Err(e) => Err(e),
        };
    }
    let PyPayload::Iterator(cell) = &iter.payload else {
        return Err(crate::exceptions::vm_type_error(vm, &format!("'{}' object is not an iterator", iter.class.name)));
    };
    let mut state = cell.borrow_mut();
    Ok(match &mut *state {
        IterState::Seq { items, idx } => {
            if *idx >= items.len() {
                None
            } else {
                let v = items[*idx].clone();
                *idx += 1;
                Some(v)
            }
        }
        IterState::Range { range, idx } => {
            if *idx >= range.len() {
                None
            } else {
                let v = range.nth(*idx);
                *idx += 1;
                Some(vm.new_int(v))
            }
        }
        IterState::Str { chars, idx } => {
            if *idx >= chars.len() {
                None
            } else {
                let v = chars[*idx];
                *idx += 1;
                Some(vm.new_str(v.to_string()))
            }
        }
        IterState::DictKeys { items, idx } => {
            if *idx >= items.len() {
                None
            } else {
                let v = items[*idx].clone();
                *idx += 1;
                Some(v)
            }
        }
        IterState::DictValues { items, idx } => {
            if *idx >= items.len() {
                None
            } else {
                let v = items[*idx].clone();
                *idx += 1;
                Some(v)
            }
        }
        IterState::DictItems { items, idx } => {
            if *idx >= items.len() {
                None
            } else {
                let (k, v) = items[*idx].clone();
                *idx += 1;
                Some(vm.new_tuple(vec![k, v]))
            }
        }
    })
}

pub fn next_or_stop(vm: &mut VirtualMachine, iter: &PyObjectRef) -> PyResult<PyObjectRef> {
    match next_value(vm, iter)? {
        Some(v) => Ok(v),
        None => Err(vm_stop_iteration(vm, vm.none())),
    }
}

/// Outcome of one delegate poll for `yield from` (§4.5, §6): either the
/// delegate produced a value to re-yield, or it's exhausted and carries
/// the value the whole `yield from` expression evaluates to.
pub enum YieldFromStep {
    Yielded(PyObjectRef),
    Done(PyObjectRef),
}

/// Polls `iter` once for a `yield from` delegation, forwarding `sent` into
/// a generator delegate the way `send()` would; a plain iterator has no
/// slot for a sent value and is just polled with `next()`.
pub fn yield_from_poll(vm: &mut VirtualMachine, iter: &PyObjectRef, sent: PyObjectRef) -> PyResult<YieldFromStep> {
    if let PyPayload::Generator(_) = &iter.payload {
        return match crate::generator::resume(vm, iter, sent) {
            Ok(v) => Ok(YieldFromStep::Yielded(v)),
            Err(crate::host::VmError::Raised(e)) if crate::exceptions::is_instance_of(vm, &e, "StopIteration") => {
                let value = crate::exceptions::attr(&e, "args")
                    .and_then(|a| match &a.payload {
                        PyPayload::Tuple(t) => t.first().cloned(),
                        _ => None,
                    })
                    .unwrap_or_else(|| vm.none());
                Ok(YieldFromStep::Done(value))
            }
            Err(e) => Err(e),
        };
    }
    match next_value(vm, iter)? {
        Some(v) => Ok(YieldFromStep::Yielded(v)),
        None => Ok(YieldFromStep::Done(vm.none())),
    }
}
