//! Attribute lookup, the descriptor protocol, operator dispatch, and
//! `super()` (§4.4 Object Protocol).

use crate::exceptions::{vm_attribute_error, vm_type_error};
use crate::host::{PyResult, VirtualMachine};
use crate::value::{PyClassRef, PyObjectRef, PyPayload};

/// True if `value`'s class (or its own dict, for a class value) defines
/// `__get__` — a data descriptor additionally needs `__set__`/`__delete__`.
fn is_descriptor(value: &PyObjectRef) -> bool {
    matches!(value.payload, PyPayload::Function(_) | PyPayload::Property(_))
        || value.class.get_dunder("__get__").is_some()
}

fn is_data_descriptor(value: &PyObjectRef) -> bool {
    matches!(value.payload, PyPayload::Property(_)) || value.class.get_dunder("__set__").is_some()
}

/// Binds a descriptor found in a class dict to `instance` (or `None` for
/// a class-level lookup), per the usual `__get__(instance, owner)` rule.
fn invoke_descriptor(vm: &mut VirtualMachine, descr: &PyObjectRef, instance: Option<PyObjectRef>, owner: PyClassRef) -> PyResult<PyObjectRef> {
    match &descr.payload {
        PyPayload::Function(_) => match instance {
            Some(obj) => Ok(vm.new_bound_method(descr.clone(), obj)),
            None => Ok(descr.clone()),
        },
        PyPayload::StaticMethod(f) => Ok(f.clone()),
        PyPayload::ClassMethod(f) => Ok(vm.new_bound_method(f.clone(), vm.class_value(owner))),
        PyPayload::Property(p) => match &p.getter {
            Some(getter) => {
                let obj = instance.ok_or_else(|| vm_attribute_error(vm, "unreadable attribute"))?;
                vm.call_value(getter, &crate::function::CallArgs::positional(vec![obj]))
            }
            None => Err(vm_attribute_error(vm, "unreadable attribute")),
        },
        _ => {
            if let Some(get) = descr.class.get_dunder("__get__") {
                let owner_val = vm.class_value(owner);
                let inst = instance.unwrap_or_else(|| vm.none());
                vm.call_value(&get, &crate::function::CallArgs::positional(vec![descr.clone(), inst, owner_val]))
            } else {
                Ok(descr.clone())
            }
        }
    }
}

/// `@prop.setter`/`@prop.deleter`/`@prop.getter`: returns a one-arg
/// callable that rebuilds `prop` with the named slot replaced, the way
/// `property.setter` works in plain Python (decorator sugar over a new
/// property object, not a mutation of the original).
fn property_rebinder(vm: &VirtualMachine, prop: crate::value::PyProperty, slot: &str) -> PyObjectRef {
    let slot = slot.to_owned();
    vm.new_host_function(format!("property.{slot}"), std::rc::Rc::new(move |vm: &mut VirtualMachine, args: &crate::function::CallArgs| {
        let f = args.positional.first().cloned();
        let mut next = prop.clone();
        match slot.as_str() {
            "setter" => next.setter = f,
            "deleter" => next.deleter = f,
            "getter" => next.getter = f,
            _ => unreachable!(),
        }
        Ok(vm.new_property(next))
    }))
}

/// The 7-step attribute read algorithm (§4.4): data descriptor on the
/// type, instance `__dict__`, non-data descriptor/plain class attribute,
/// `__getattr__` fallback, else `AttributeError`.
pub fn get_attribute(vm: &mut VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<PyObjectRef> {
    if let PyPayload::Class(_) = &obj.payload {
        return get_class_attribute(vm, obj, name);
    }
    if let PyPayload::Super { search_from, instance } = &obj.payload {
        return super_get_attribute(vm, search_from, instance, name);
    }
    if let PyPayload::Property(p) = &obj.payload {
        if matches!(name, "setter" | "deleter" | "getter") {
            return Ok(property_rebinder(vm, p.clone(), name));
        }
    }
    let class = obj.class.clone();
    let class_lookup = class.find_in_mro(&class, name);

    if let Some((owner, value)) = &class_lookup {
        if is_data_descriptor(value) {
            return invoke_descriptor(vm, value, Some(obj.clone()), owner.clone());
        }
    }

    if let PyPayload::Instance(inst) = &obj.payload {
        if let Some(v) = inst.get(&obj.class, name) {
            return Ok(v);
        }
    }
    if let PyPayload::Module(m) = &obj.payload {
        if let Some(v) = m.dict.borrow().get(name) {
            return Ok(v.clone());
        }
    }

    if let Some((owner, value)) = class_lookup {
        if is_descriptor(&value) {
            return invoke_descriptor(vm, &value, Some(obj.clone()), owner);
        }
        return Ok(value);
    }

    if let Some(getattr) = class.get_dunder("__getattr__") {
        return vm.call_value(&getattr, &crate::function::CallArgs::positional(vec![obj.clone(), vm.new_str(name.to_owned())]));
    }

    Err(vm_attribute_error(vm, &format!("'{}' object has no attribute '{}'", class.name, name)))
}

fn get_class_attribute(vm: &mut VirtualMachine, class_obj: &PyObjectRef, name: &str) -> PyResult<PyObjectRef> {
    let PyPayload::Class(class) = &class_obj.payload else { unreachable!() };
    if let Some((owner, value)) = class.find_in_mro(class, name) {
        if is_descriptor(&value) {
            return invoke_descriptor(vm, &value, None, owner);
        }
        return Ok(value);
    }
    if let Some(meta) = &class.metaclass {
        if let Some((owner, value)) = meta.find_in_mro(meta, name) {
            return invoke_descriptor(vm, &value, Some(class_obj.clone()), owner);
        }
    }
    Err(vm_attribute_error(vm, &format!("type object '{}' has no attribute '{}'", class.name, name)))
}

pub fn set_attribute(vm: &mut VirtualMachine, obj: &PyObjectRef, name: &str, value: PyObjectRef) -> PyResult<()> {
    let class = obj.class.clone();
    if let Some((_, descr)) = class.find_in_mro(&class, name) {
        if let PyPayload::Property(p) = &descr.payload {
            return match &p.setter {
                Some(setter) => vm.call_value(setter, &crate::function::CallArgs::positional(vec![obj.clone(), value])).map(|_| ()),
                None => Err(vm_attribute_error(vm, "can't set attribute")),
            };
        }
        if let Some(set) = descr.class.get_dunder("__set__") {
            vm.call_value(&set, &crate::function::CallArgs::positional(vec![descr, obj.clone(), value]))?;
            return Ok(());
        }
    }
    match &obj.payload {
        PyPayload::Instance(inst) => {
            inst.set(&obj.class, name, value).map_err(|_| vm_attribute_error(vm, "can't set attribute"))
        }
        PyPayload::Module(m) => {
            m.dict.borrow_mut().insert(name.to_owned(), value);
            Ok(())
        }
        _ => Err(vm_attribute_error(vm, &format!("'{}' object has no attribute '{}'", class.name, name))),
    }
}

pub fn delete_attribute(vm: &mut VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<()> {
    match &obj.payload {
        PyPayload::Instance(inst) => inst.del(&obj.class, name).map_err(|_| vm_attribute_error(vm, &format!("'{}' object has no attribute '{}'", obj.class.name, name))),
        _ => Err(vm_attribute_error(vm, "cannot delete attribute")),
    }
}

/// Resolves zero-arg `super()` using the calling frame's implicit
/// `__class__` cell and first argument (the instance), and two-arg
/// `super(Type, obj)` directly — both return a lightweight proxy object
/// the VM's attribute lookup special-cases to start the MRO search after
/// `Type` rather than at `obj`'s own class (§4.4).
pub fn make_super(vm: &mut VirtualMachine, search_from: PyClassRef, instance: PyObjectRef) -> PyObjectRef {
    vm.new_super(search_from, instance)
}

pub fn super_get_attribute(vm: &mut VirtualMachine, search_from: &PyClassRef, instance: &PyObjectRef, name: &str) -> PyResult<PyObjectRef> {
    let instance_class = instance.class.clone();
    let mro = std::iter::once(instance_class.clone()).chain(instance_class.mro.iter().cloned());
    let mut past_search_from = false;
    for c in mro {
        if past_search_from {
            if let Some(v) = c.dict.borrow().get(name) {
                return invoke_descriptor(vm, &v, Some(instance.clone()), c.clone());
            }
        }
        if std::ptr::eq(c.as_ref(), search_from.as_ref()) {
            past_search_from = true;
        }
    }
    Err(vm_attribute_error(vm, &format!("'super' object has no attribute '{name}'")))
}

/// Binary operator dispatch with the reflected-method / subclass-priority
/// rule: if the right operand's class is a proper subclass of the left's
/// and overrides the reflected method, it's tried first.
pub fn binary_op(vm: &mut VirtualMachine, op_name: &str, reflected_name: &str, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<PyObjectRef> {
    let lhs_class = lhs.class.clone();
    let rhs_class = rhs.class.clone();
    let rhs_is_subclass = !std::ptr::eq(lhs_class.as_ref(), rhs_class.as_ref()) && rhs_class.is_subclass_of(&lhs_class);

    let try_order: [(&str, &PyObjectRef, &PyObjectRef); 2] = if rhs_is_subclass {
        [(reflected_name, rhs, lhs), (op_name, lhs, rhs)]
    } else {
        [(op_name, lhs, rhs), (reflected_name, rhs, lhs)]
    };

    for (name, a, b) in try_order {
        let owner = if std::ptr::eq(a.class.as_ref(), lhs_class.as_ref()) { &lhs_class } else { &rhs_class };
        if let Some(method) = owner.get_dunder(name) {
            match vm.call_value(&method, &crate::function::CallArgs::positional(vec![a.clone(), b.clone()])) {
                Ok(v) if !vm.is_not_implemented(&v) => return Ok(v),
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Err(vm_type_error(
        vm,
        &format!("unsupported operand type(s) for {}: '{}' and '{}'", op_name.trim_start_matches("__").trim_end_matches("__"), lhs_class.name, rhs_class.name),
    ))
}

pub fn unary_op(vm: &mut VirtualMachine, op_name: &str, operand: &PyObjectRef) -> PyResult<PyObjectRef> {
    if let Some(method) = operand.class.get_dunder(op_name) {
        return vm.call_value(&method, &crate::function::CallArgs::positional(vec![operand.clone()]));
    }
    Err(vm_type_error(vm, &format!("bad operand type for unary {op_name}: '{}'", operand.class.name)))
}

pub fn call_dunder(vm: &mut VirtualMachine, obj: &PyObjectRef, name: &str, args: Vec<PyObjectRef>) -> PyResult<Option<PyObjectRef>> {
    match obj.class.get_dunder(name) {
        Some(method) => {
            let mut full = vec![obj.clone()];
            full.extend(args);
            Ok(Some(vm.call_value(&method, &crate::function::CallArgs::positional(full))?))
        }
        None => Ok(None),
    }
}
