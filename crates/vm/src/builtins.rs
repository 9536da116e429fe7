//! The fixed builtins table (§4.6). Every entry here is an ordinary
//! [`crate::value::PyHostFunction`] installed into the interpreter's
//! builtins namespace at construction time — Python code sees no
//! difference between these and a host-registered native callback.

use crate::exceptions::{new_exception, vm_type_error, vm_value_error};
use crate::function::CallArgs;
use crate::host::{PyResult, VirtualMachine};
use crate::iterator::IterState;
use crate::value::{HostFn, PyObjectRef, PyPayload};
use indexmap::IndexMap;
use std::rc::Rc;

fn arg(args: &CallArgs, i: usize) -> Option<&PyObjectRef> {
    args.positional.get(i)
}

fn kwarg<'a>(args: &'a CallArgs, name: &str) -> Option<&'a PyObjectRef> {
    args.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn require(vm: &mut VirtualMachine, args: &CallArgs, i: usize, fname: &str) -> PyResult {
    arg(args, i).cloned().ok_or_else(|| vm_type_error(vm, &format!("{fname}() missing required positional argument")))
}

macro_rules! native {
    ($table:expr, $name:expr, $f:expr) => {
        $table.push(($name.to_owned(), Rc::new($f) as HostFn));
    };
}

pub fn install(vm: &mut VirtualMachine) -> IndexMap<String, PyObjectRef> {
    let mut table: Vec<(String, HostFn)> = Vec::new();

    native!(table, "abs", |vm, args| {
        let v = require(vm, args, 0, "abs")?;
        match &v.payload {
            PyPayload::Int(i) => Ok(vm.new_int(i.wrapping_abs())),
            PyPayload::Float(f) => Ok(vm.new_float(f.abs())),
            PyPayload::Bool(b) => Ok(vm.new_int(*b as i64)),
            _ => Err(vm_type_error(vm, &format!("bad operand type for abs(): '{}'", v.class.name))),
        }
    });

    native!(table, "divmod", |vm, args| {
        let a = require(vm, args, 0, "divmod")?;
        let b = require(vm, args, 1, "divmod")?;
        let q = vm.try_fast_arith(pylite_bytecode::BinOp::FloorDiv, &a, &b)?
            .ok_or_else(|| vm_type_error(vm, "unsupported operand type(s) for divmod()"))?;
        let r = vm.try_fast_arith(pylite_bytecode::BinOp::Mod, &a, &b)?.unwrap();
        Ok(vm.new_tuple(vec![q, r]))
    });

    native!(table, "pow", |vm, args| {
        let a = require(vm, args, 0, "pow")?;
        let b = require(vm, args, 1, "pow")?;
        if let Some(modulus) = arg(args, 2) {
            let m = vm.expect_int(modulus)?;
            if m == 0 {
                return Err(vm_value_error(vm, "pow() 3rd argument cannot be 0"));
            }
            let base = vm.expect_int(&a)?;
            let exp = vm.expect_int(&b)?;
            if exp < 0 {
                return Err(vm_value_error(vm, "pow() 2nd argument cannot be negative when 3rd argument specified"));
            }
            let mut result: i64 = 1;
            let mut base = base.rem_euclid(m);
            let mut exp = exp;
            while exp > 0 {
                if exp & 1 == 1 {
                    result = (result * base).rem_euclid(m);
                }
                base = (base * base).rem_euclid(m);
                exp >>= 1;
            }
            return Ok(vm.new_int(result));
        }
        vm.try_fast_arith(pylite_bytecode::BinOp::Pow, &a, &b)?.ok_or_else(|| vm_type_error(vm, "unsupported operand type(s) for pow()"))
    });

    native!(table, "int", |vm, args| {
        let Some(v) = arg(args, 0) else { return Ok(vm.new_int(0)) };
        match &v.payload {
            PyPayload::Int(i) => Ok(vm.new_int(*i)),
            PyPayload::Bool(b) => Ok(vm.new_int(*b as i64)),
            PyPayload::Float(f) => Ok(vm.new_int(f.trunc() as i64)),
            PyPayload::Str(s) => {
                let base = match arg(args, 1) {
                    Some(b) => vm.expect_int(b)? as u32,
                    None => 10,
                };
                i64::from_str_radix(s.trim(), base)
                    .map(|i| vm.new_int(i))
                    .map_err(|_| vm_value_error(vm, &format!("invalid literal for int() with base {base}: {s:?}")))
            }
            _ => Err(vm_type_error(vm, &format!("int() argument must be a string or a number, not '{}'", v.class.name))),
        }
    });

    native!(table, "float", |vm, args| {
        let Some(v) = arg(args, 0) else { return Ok(vm.new_float(0.0)) };
        match &v.payload {
            PyPayload::Float(f) => Ok(vm.new_float(*f)),
            PyPayload::Int(i) => Ok(vm.new_float(*i as f64)),
            PyPayload::Bool(b) => Ok(vm.new_float(*b as i64 as f64)),
            PyPayload::Str(s) => s.trim().parse::<f64>().map(|f| vm.new_float(f)).map_err(|_| vm_value_error(vm, &format!("could not convert string to float: {s:?}"))),
            _ => Err(vm_type_error(vm, &format!("float() argument must be a string or a number, not '{}'", v.class.name))),
        }
    });

    native!(table, "str", |vm, args| {
        match arg(args, 0) {
            Some(v) => {
                let s = vm.to_display_string(v);
                Ok(vm.new_str(s))
            }
            None => Ok(vm.new_str("")),
        }
    });

    native!(table, "bool", |vm, args| {
        match arg(args, 0) {
            Some(v) => {
                let b = vm.is_truthy(v)?;
                Ok(vm.new_bool(b))
            }
            None => Ok(vm.new_bool(false)),
        }
    });

    native!(table, "bytes", |vm, args| {
        match arg(args, 0) {
            None => Ok(vm.new_bytes(Vec::new())),
            Some(v) => match &v.payload {
                PyPayload::Int(n) => Ok(vm.new_bytes(vec![0u8; (*n).max(0) as usize])),
                PyPayload::List(items) => {
                    let mut out = Vec::new();
                    for item in items.borrow().iter() {
                        out.push(vm.expect_int(item)? as u8);
                    }
                    Ok(vm.new_bytes(out))
                }
                PyPayload::Str(s) => Ok(vm.new_bytes(s.as_bytes().to_vec())),
                _ => Err(vm_type_error(vm, "cannot convert to bytes")),
            },
        }
    });

    native!(table, "list", |vm, args| {
        match arg(args, 0) {
            Some(v) => {
                let items = vm.iterable_to_vec(v)?;
                Ok(vm.new_list(items))
            }
            None => Ok(vm.new_list(Vec::new())),
        }
    });

    native!(table, "tuple", |vm, args| {
        match arg(args, 0) {
            Some(v) => {
                let items = vm.iterable_to_vec(v)?;
                Ok(vm.new_tuple(items))
            }
            None => Ok(vm.new_tuple(Vec::new())),
        }
    });

    native!(table, "dict", |vm, args| {
        let d = vm.new_dict();
        if let Some(v) = arg(args, 0) {
            let pairs = vm.mapping_to_pairs(v)?;
            if let PyPayload::Dict(dd) = &d.payload {
                for (k, val) in pairs {
                    dd.borrow_mut().insert(vm, k, val)?;
                }
            }
        }
        if let PyPayload::Dict(dd) = &d.payload {
            for (k, v) in &args.keywords {
                let key = vm.new_str(k.clone());
                dd.borrow_mut().insert(vm, key, v.clone())?;
            }
        }
        Ok(d)
    });

    native!(table, "set", |vm, args| {
        let s = vm.new_set();
        if let Some(v) = arg(args, 0) {
            let items = vm.iterable_to_vec(v)?;
            if let PyPayload::Set(dd) = &s.payload {
                for item in items {
                    crate::dict::set_insert(&mut dd.borrow_mut(), vm, item)?;
                }
            }
        }
        Ok(s)
    });

    native!(table, "frozenset", |vm, args| {
        let mut d = crate::dict::PyDict::new();
        if let Some(v) = arg(args, 0) {
            let items = vm.iterable_to_vec(v)?;
            for item in items {
                crate::dict::set_insert(&mut d, vm, item)?;
            }
        }
        Ok(vm.new_frozenset(d))
    });

    native!(table, "range", |vm, args| {
        let (start, stop, step) = match args.positional.len() {
            1 => (0, vm.expect_int(&args.positional[0])?, 1),
            2 => (vm.expect_int(&args.positional[0])?, vm.expect_int(&args.positional[1])?, 1),
            _ => (vm.expect_int(&args.positional[0])?, vm.expect_int(&args.positional[1])?, vm.expect_int(&args.positional[2])?),
        };
        if step == 0 {
            return Err(vm_value_error(vm, "range() arg 3 must not be zero"));
        }
        Ok(vm.new_range(crate::value::PyRange { start, stop, step }))
    });

    native!(table, "enumerate", |vm, args| {
        let v = require(vm, args, 0, "enumerate")?;
        let start = match arg(args, 1) {
            Some(n) => vm.expect_int(n)?,
            None => 0,
        };
        let items = vm.iterable_to_vec(&v)?;
        let pairs: Vec<PyObjectRef> = items.into_iter().enumerate().map(|(i, item)| vm.new_tuple(vec![vm.new_int(start + i as i64), item])).collect();
        Ok(vm.new_iterator(IterState::Seq { items: pairs, idx: 0 }))
    });

    native!(table, "zip", |vm, args| {
        let lists: Vec<Vec<PyObjectRef>> = args.positional.iter().map(|v| vm.iterable_to_vec(v)).collect::<PyResult<_>>()?;
        let len = lists.iter().map(Vec::len).min().unwrap_or(0);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(vm.new_tuple(lists.iter().map(|l| l[i].clone()).collect()));
        }
        Ok(vm.new_iterator(IterState::Seq { items: out, idx: 0 }))
    });

    native!(table, "map", |vm, args| {
        let f = require(vm, args, 0, "map")?;
        let lists: Vec<Vec<PyObjectRef>> = args.positional[1..].iter().map(|v| vm.iterable_to_vec(v)).collect::<PyResult<_>>()?;
        let len = lists.iter().map(Vec::len).min().unwrap_or(0);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let call_args = CallArgs::positional(lists.iter().map(|l| l[i].clone()).collect());
            out.push(vm.call_value(&f, &call_args)?);
        }
        Ok(vm.new_iterator(IterState::Seq { items: out, idx: 0 }))
    });

    native!(table, "filter", |vm, args| {
        let f = arg(args, 0).cloned();
        let v = require(vm, args, 1, "filter")?;
        let items = vm.iterable_to_vec(&v)?;
        let mut out = Vec::new();
        for item in items {
            let keep = match &f {
                Some(f) => {
                    let r = vm.call_value(f, &CallArgs::positional(vec![item.clone()]))?;
                    vm.is_truthy(&r)?
                }
                None => vm.is_truthy(&item)?,
            };
            if keep {
                out.push(item);
            }
        }
        Ok(vm.new_iterator(IterState::Seq { items: out, idx: 0 }))
    });

    native!(table, "reversed", |vm, args| {
        let v = require(vm, args, 0, "reversed")?;
        let mut items = vm.iterable_to_vec(&v)?;
        items.reverse();
        Ok(vm.new_iterator(IterState::Seq { items, idx: 0 }))
    });

    native!(table, "iter", |vm, args| {
        let v = require(vm, args, 0, "iter")?;
        crate::iterator::get_iter(vm, &v)
    });

    native!(table, "next", |vm, args| {
        let v = require(vm, args, 0, "next")?;
        match crate::iterator::next_value(vm, &v)? {
            Some(item) => Ok(item),
            None => match arg(args, 1) {
                Some(d) => Ok(d.clone()),
                None => Err(crate::exceptions::vm_stop_iteration(vm, vm.none())),
            },
        }
    });

    native!(table, "len", |vm, args| {
        let v = require(vm, args, 0, "len")?;
        let n = match &v.payload {
            PyPayload::Str(s) => s.chars().count(),
            PyPayload::Bytes(b) => b.borrow().len(),
            PyPayload::List(items) => items.borrow().len(),
            PyPayload::Tuple(items) => items.len(),
            PyPayload::Dict(d) => d.borrow().len(),
            PyPayload::Set(d) => d.borrow().len(),
            PyPayload::Range(r) => r.len() as usize,
            _ => {
                if let Some(method) = v.class.get_dunder("__len__") {
                    let r = vm.call_value(&method, &CallArgs::positional(vec![v.clone()]))?;
                    let n = vm.expect_int(&r)?;
                    return Ok(vm.new_int(n));
                }
                return Err(vm_type_error(vm, &format!("object of type '{}' has no len()", v.class.name)));
            }
        };
        Ok(vm.new_int(n as i64))
    });

    native!(table, "sum", |vm, args| {
        let v = require(vm, args, 0, "sum")?;
        let items = vm.iterable_to_vec(&v)?;
        let mut acc = match arg(args, 1) {
            Some(s) => s.clone(),
            None => vm.new_int(0),
        };
        for item in items {
            acc = vm.try_fast_arith(pylite_bytecode::BinOp::Add, &acc, &item)?.ok_or_else(|| vm_type_error(vm, "unsupported operand type(s) for +"))?;
        }
        Ok(acc)
    });

    native!(table, "min", |vm, args| min_max(vm, args, true));
    native!(table, "max", |vm, args| min_max(vm, args, false));

    native!(table, "sorted", |vm, args| {
        let v = require(vm, args, 0, "sorted")?;
        let mut items = vm.iterable_to_vec(&v)?;
        let key = kwarg(args, "key").cloned();
        let reverse = match kwarg(args, "reverse") {
            Some(r) => vm.is_truthy(r)?,
            None => false,
        };
        sort_items(vm, &mut items, &key)?;
        if reverse {
            items.reverse();
        }
        Ok(vm.new_list(items))
    });

    native!(table, "type", |vm, args| {
        let v = require(vm, args, 0, "type")?;
        Ok(vm.class_value(v.class.clone()))
    });

    native!(table, "isinstance", |vm, args| {
        let v = require(vm, args, 0, "isinstance")?;
        let t = require(vm, args, 1, "isinstance")?;
        let classes = class_tuple(vm, &t)?;
        Ok(vm.new_bool(classes.iter().any(|c| v.class.is_subclass_of(c))))
    });

    native!(table, "issubclass", |vm, args| {
        let a = require(vm, args, 0, "issubclass")?;
        let b = require(vm, args, 1, "issubclass")?;
        let sub = vm.class_from_value(&a)?;
        let classes = class_tuple(vm, &b)?;
        Ok(vm.new_bool(classes.iter().any(|c| sub.is_subclass_of(c))))
    });

    native!(table, "callable", |vm, args| {
        let v = require(vm, args, 0, "callable")?;
        let callable = matches!(v.payload, PyPayload::Function(_) | PyPayload::HostFunction(_) | PyPayload::BoundMethod { .. } | PyPayload::Class(_) | PyPayload::StaticMethod(_) | PyPayload::ClassMethod(_)) || v.class.get_dunder("__call__").is_some();
        Ok(vm.new_bool(callable))
    });

    native!(table, "dir", |vm, args| {
        let v = require(vm, args, 0, "dir")?;
        let mut names: Vec<String> = v.class.dict.borrow().keys().cloned().collect();
        for c in &v.class.mro {
            names.extend(c.dict.borrow().keys().cloned());
        }
        if let PyPayload::Instance(inst) = &v.payload {
            if let crate::value::InstanceStorage::Dict(d) = &inst.storage {
                names.extend(d.borrow().keys().cloned());
            }
        }
        names.sort();
        names.dedup();
        Ok(vm.new_list(names.into_iter().map(|n| vm.new_str(n)).collect()))
    });

    native!(table, "hasattr", |vm, args| {
        let v = require(vm, args, 0, "hasattr")?;
        let name = require(vm, args, 1, "hasattr")?;
        let name = vm.to_display_string(&name);
        Ok(vm.new_bool(crate::object_protocol::get_attribute(vm, &v, &name).is_ok()))
    });

    native!(table, "getattr", |vm, args| {
        let v = require(vm, args, 0, "getattr")?;
        let name = require(vm, args, 1, "getattr")?;
        let name = vm.to_display_string(&name);
        match crate::object_protocol::get_attribute(vm, &v, &name) {
            Ok(val) => Ok(val),
            Err(e) => match arg(args, 2) {
                Some(d) => Ok(d.clone()),
                None => Err(e),
            },
        }
    });

    native!(table, "setattr", |vm, args| {
        let v = require(vm, args, 0, "setattr")?;
        let name = require(vm, args, 1, "setattr")?;
        let value = require(vm, args, 2, "setattr")?;
        let name = vm.to_display_string(&name);
        crate::object_protocol::set_attribute(vm, &v, &name, value)?;
        Ok(vm.none())
    });

    native!(table, "delattr", |vm, args| {
        let v = require(vm, args, 0, "delattr")?;
        let name = require(vm, args, 1, "delattr")?;
        let name = vm.to_display_string(&name);
        crate::object_protocol::delete_attribute(vm, &v, &name)?;
        Ok(vm.none())
    });

    native!(table, "repr", |vm, args| {
        let v = require(vm, args, 0, "repr")?;
        Ok(vm.new_str(repr_string(vm, &v)))
    });

    native!(table, "hash", |vm, args| {
        let v = require(vm, args, 0, "hash")?;
        let h = vm.hash_value(&v)?;
        Ok(vm.new_int(h as i64))
    });

    native!(table, "id", |vm, args| {
        let v = require(vm, args, 0, "id")?;
        Ok(vm.new_int(Rc::as_ptr(&v) as i64))
    });

    native!(table, "hex", |vm, args| {
        let v = require(vm, args, 0, "hex")?;
        let i = vm.expect_int(&v)?;
        Ok(vm.new_str(if i < 0 { format!("-0x{:x}", -i) } else { format!("0x{i:x}") }))
    });

    native!(table, "oct", |vm, args| {
        let v = require(vm, args, 0, "oct")?;
        let i = vm.expect_int(&v)?;
        Ok(vm.new_str(if i < 0 { format!("-0o{:o}", -i) } else { format!("0o{i:o}") }))
    });

    native!(table, "bin", |vm, args| {
        let v = require(vm, args, 0, "bin")?;
        let i = vm.expect_int(&v)?;
        Ok(vm.new_str(if i < 0 { format!("-0b{:b}", -i) } else { format!("0b{i:b}") }))
    });

    native!(table, "chr", |vm, args| {
        let v = require(vm, args, 0, "chr")?;
        let i = vm.expect_int(&v)?;
        let c = char::from_u32(i as u32).ok_or_else(|| vm_value_error(vm, "chr() arg not in range"))?;
        Ok(vm.new_str(c.to_string()))
    });

    native!(table, "ord", |vm, args| {
        let v = require(vm, args, 0, "ord")?;
        let PyPayload::Str(s) = &v.payload else { return Err(vm_type_error(vm, "ord() expected string")) };
        let mut chars = s.chars();
        let c = chars.next().ok_or_else(|| vm_type_error(vm, "ord() expected a character"))?;
        if chars.next().is_some() {
            return Err(vm_type_error(vm, "ord() expected a character, but string of length 2 found"));
        }
        Ok(vm.new_int(c as i64))
    });

    native!(table, "format", |vm, args| {
        let v = require(vm, args, 0, "format")?;
        let s = vm.to_display_string(&v);
        Ok(vm.new_str(s))
    });

    native!(table, "print", |vm, args| {
        let sep = kwarg(args, "sep").map(|v| vm.to_display_string(v)).unwrap_or_else(|| " ".to_owned());
        let end = kwarg(args, "end").map(|v| vm.to_display_string(v)).unwrap_or_else(|| "\n".to_owned());
        let parts: Vec<String> = args.positional.iter().map(|v| vm.to_display_string(v)).collect();
        print!("{}{}", parts.join(&sep), end);
        Ok(vm.none())
    });

    native!(table, "exit", |vm, args| {
        let code = arg(args, 0).cloned().unwrap_or_else(|| vm.new_int(0));
        let msg = vm.to_display_string(&code);
        Err(crate::host::VmError::Raised(new_exception(vm, "SystemExit", &msg)))
    });

    native!(table, "staticmethod", |vm, args| {
        let f = require(vm, args, 0, "staticmethod")?;
        Ok(vm.new_static_method(f))
    });

    native!(table, "classmethod", |vm, args| {
        let f = require(vm, args, 0, "classmethod")?;
        Ok(vm.new_class_method(f))
    });

    native!(table, "property", |vm, args| {
        let getter = arg(args, 0).cloned().or_else(|| kwarg(args, "fget").cloned());
        let setter = arg(args, 1).cloned().or_else(|| kwarg(args, "fset").cloned());
        let deleter = arg(args, 2).cloned().or_else(|| kwarg(args, "fdel").cloned());
        Ok(vm.new_property(crate::value::PyProperty { getter, setter, deleter }))
    });

    let mut out = IndexMap::new();
    for (name, f) in table {
        let fv = vm.new_host_function(name.clone(), f);
        out.insert(name, fv);
    }
    out.insert("object".to_owned(), vm.class_value(vm.classes.object.clone()));
    out.insert("type".to_owned(), vm.class_value(vm.classes.type_.clone()));
    out
}

fn class_tuple(vm: &mut VirtualMachine, t: &PyObjectRef) -> PyResult<Vec<crate::value::PyClassRef>> {
    if let PyPayload::Tuple(items) = &t.payload {
        items.iter().map(|i| vm.class_from_value(i)).collect()
    } else {
        Ok(vec![vm.class_from_value(t)?])
    }
}

fn repr_string(vm: &mut VirtualMachine, v: &PyObjectRef) -> String {
    if let PyPayload::Str(s) = &v.payload {
        return format!("{s:?}");
    }
    vm.to_display_string(v)
}

fn min_max(vm: &mut VirtualMachine, args: &CallArgs, is_min: bool) -> PyResult {
    let key = kwarg(args, "key").cloned();
    let items: Vec<PyObjectRef> = if args.positional.len() > 1 {
        args.positional.clone()
    } else {
        vm.iterable_to_vec(&require(vm, args, 0, if is_min { "min" } else { "max" })?)?
    };
    if items.is_empty() {
        let name = if is_min { "min" } else { "max" };
        if let Some(d) = kwarg(args, "default") {
            return Ok(d.clone());
        }
        return Err(vm_value_error(vm, &format!("{name}() arg is an empty sequence")));
    }
    let mut best = items[0].clone();
    let mut best_key = apply_key(vm, &key, &best)?;
    for item in &items[1..] {
        let k = apply_key(vm, &key, item)?;
        let lt = less_than(vm, &k, &best_key)?;
        if (is_min && lt) || (!is_min && !lt && !vm.values_eq(&k, &best_key)?) {
            best = item.clone();
            best_key = k;
        }
    }
    Ok(best)
}

fn apply_key(vm: &mut VirtualMachine, key: &Option<PyObjectRef>, v: &PyObjectRef) -> PyResult {
    match key {
        Some(f) => vm.call_value(f, &CallArgs::positional(vec![v.clone()])),
        None => Ok(v.clone()),
    }
}

fn less_than(vm: &mut VirtualMachine, a: &PyObjectRef, b: &PyObjectRef) -> PyResult<bool> {
    if let Some(method) = a.class.get_dunder("__lt__") {
        let r = vm.call_value(&method, &CallArgs::positional(vec![a.clone(), b.clone()]))?;
        if !vm.is_not_implemented(&r) {
            return vm.is_truthy(&r);
        }
    }
    match (&a.payload, &b.payload) {
        (PyPayload::Str(x), PyPayload::Str(y)) => Ok(x < y),
        _ => {
            let a_f = as_f64(a);
            let b_f = as_f64(b);
            match (a_f, b_f) {
                (Some(x), Some(y)) => Ok(x < y),
                _ => Err(vm_type_error(vm, &format!("'<' not supported between instances of '{}' and '{}'", a.class.name, b.class.name))),
            }
        }
    }
}

fn as_f64(v: &PyObjectRef) -> Option<f64> {
    match &v.payload {
        PyPayload::Int(i) => Some(*i as f64),
        PyPayload::Float(f) => Some(*f),
        PyPayload::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

fn sort_items(vm: &mut VirtualMachine, items: &mut [PyObjectRef], key: &Option<PyObjectRef>) -> PyResult<()> {
    let mut keyed: Vec<(PyObjectRef, PyObjectRef)> = Vec::with_capacity(items.len());
    for item in items.iter() {
        keyed.push((apply_key(vm, key, item)?, item.clone()));
    }
    let mut err = None;
    keyed.sort_by(|(ka, _), (kb, _)| {
        if err.is_some() {
            return std::cmp::Ordering::Equal;
        }
        match less_than(vm, ka, kb) {
            Ok(true) => std::cmp::Ordering::Less,
            Ok(false) => match less_than(vm, kb, ka) {
                Ok(true) => std::cmp::Ordering::Greater,
                Ok(false) => std::cmp::Ordering::Equal,
                Err(e) => {
                    err = Some(e);
                    std::cmp::Ordering::Equal
                }
            },
            Err(e) => {
                err = Some(e);
                std::cmp::Ordering::Equal
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    for (slot, (_, v)) in items.iter_mut().zip(keyed.into_iter()) {
        *slot = v;
    }
    Ok(())
}
