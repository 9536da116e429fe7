//! The tagged value universe (§3 Values) and the class/instance shapes
//! built on top of it.
//!
//! Every Python-visible value is a [`PyObjectRef`] — a reference-counted
//! [`PyObject`] carrying its class identity plus a [`PyPayload`]. Mutable
//! collections use interior mutability (`RefCell`) rather than requiring
//! `&mut` access through the whole call chain, the same tradeoff the
//! teacher's arena-allocated `PyObjectRef` makes for a tracing GC: a single
//! reference-counted handle that every frame, cell, and container can hold
//! independently.

use crate::dict::PyDict;
use crate::function::PyFunction;
use indexmap::IndexMap;
use pylite_bytecode::CodeObject as BytecodeObject;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub type PyObjectRef = Rc<PyObject>;
pub type PyClassRef = Rc<PyClass>;

pub struct PyObject {
    pub class: PyClassRef,
    pub payload: PyPayload,
}

impl fmt::Debug for PyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.class.name)
    }
}

/// An ordinary instance's attribute storage: a dict unless the class
/// declares `__slots__`, in which case fixed slots replace it (§3 Instance).
pub enum InstanceStorage {
    Dict(RefCell<IndexMap<String, PyObjectRef>>),
    Slots(RefCell<Vec<Option<PyObjectRef>>>),
}

pub struct PyInstance {
    pub storage: InstanceStorage,
}

impl PyInstance {
    pub fn new_dict() -> Self {
        PyInstance { storage: InstanceStorage::Dict(RefCell::new(IndexMap::new())) }
    }

    pub fn new_slots(n: usize) -> Self {
        PyInstance { storage: InstanceStorage::Slots(RefCell::new(vec![None; n])) }
    }

    pub fn get(&self, class: &PyClass, name: &str) -> Option<PyObjectRef> {
        match &self.storage {
            InstanceStorage::Dict(d) => d.borrow().get(name).cloned(),
            InstanceStorage::Slots(s) => {
                let idx = class.slot_names.iter().position(|n| n == name)?;
                s.borrow()[idx].clone()
            }
        }
    }

    pub fn set(&self, class: &PyClass, name: &str, value: PyObjectRef) -> Result<(), ()> {
        match &self.storage {
            InstanceStorage::Dict(d) => {
                d.borrow_mut().insert(name.to_owned(), value);
                Ok(())
            }
            InstanceStorage::Slots(s) => {
                let idx = class.slot_names.iter().position(|n| n == name).ok_or(())?;
                s.borrow_mut()[idx] = Some(value);
                Ok(())
            }
        }
    }

    pub fn del(&self, class: &PyClass, name: &str) -> Result<(), ()> {
        match &self.storage {
            InstanceStorage::Dict(d) => d.borrow_mut().shift_remove(name).map(|_| ()).ok_or(()),
            InstanceStorage::Slots(s) => {
                let idx = class.slot_names.iter().position(|n| n == name).ok_or(())?;
                let mut slots = s.borrow_mut();
                if slots[idx].take().is_none() {
                    return Err(());
                }
                Ok(())
            }
        }
    }
}

/// Opaque host pointer plus a type tag, per §4.7 UserData.
pub struct PyUserData {
    pub type_tag: &'static str,
    pub data: Rc<dyn Any>,
}

#[derive(Clone)]
pub struct PyProperty {
    pub getter: Option<PyObjectRef>,
    pub setter: Option<PyObjectRef>,
    pub deleter: Option<PyObjectRef>,
}

pub struct PyModule {
    pub name: String,
    pub dict: RefCell<IndexMap<String, PyObjectRef>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PyRange {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl PyRange {
    pub fn len(&self) -> i64 {
        if self.step > 0 {
            if self.stop <= self.start { 0 } else { (self.stop - self.start - 1) / self.step + 1 }
        } else if self.step < 0 {
            if self.stop >= self.start { 0 } else { (self.start - self.stop - 1) / (-self.step) + 1 }
        } else {
            0
        }
    }

    pub fn nth(&self, i: i64) -> i64 {
        self.start + i * self.step
    }
}

pub type HostFn = Rc<dyn Fn(&mut crate::host::VirtualMachine, &crate::function::CallArgs) -> crate::host::PyResult>;

pub struct PyHostFunction {
    pub name: String,
    pub func: HostFn,
}

pub enum PyPayload {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(RefCell<Vec<u8>>),
    List(RefCell<Vec<PyObjectRef>>),
    Tuple(Vec<PyObjectRef>),
    Dict(RefCell<PyDict>),
    Set(RefCell<PyDict>),
    Range(PyRange),
    Function(PyFunction),
    BoundMethod { func: PyObjectRef, receiver: PyObjectRef },
    /// A class value's own class-specific data; `PyObject::class` for a
    /// class value is its *metaclass*, distinct from this payload.
    Class(PyClassRef),
    Instance(PyInstance),
    Generator(RefCell<crate::generator::GeneratorState>),
    Iterator(RefCell<crate::iterator::IterState>),
    UserData(PyUserData),
    Property(PyProperty),
    Module(Rc<PyModule>),
    HostFunction(PyHostFunction),
    StaticMethod(PyObjectRef),
    ClassMethod(PyObjectRef),
    /// A compiled function/module/class body, reachable from Python as the
    /// value a `LoadConst` of a `Code` constant pushes before `MakeFunction`
    /// consumes it.
    Code(Rc<BytecodeObject>),
    /// The object `super()` / `super(Type, obj)` produces — a proxy that
    /// redirects attribute lookup to start past `search_from` in `mro`
    /// (§4.4).
    Super { search_from: PyClassRef, instance: PyObjectRef },
}

/// Fields of a [`PyClass`], populated incrementally by the class-builder
/// DSL (§4.7) or by `MAKE_CLASS`; `object`'s own `PyClass` is the only one
/// with `bases` empty.
pub struct PyClass {
    pub name: String,
    pub bases: Vec<PyClassRef>,
    pub mro: Vec<PyClassRef>,
    pub dict: RefCell<IndexMap<String, PyObjectRef>>,
    pub metaclass: Option<PyClassRef>,
    pub slot_names: Vec<String>,
    pub has_slots: bool,
    /// Precomputed dunder lookups (§9 "Class namespaces and descriptors"),
    /// refreshed whenever `dict` changes via [`PyClass::rebuild_slots`].
    pub dunders: RefCell<IndexMap<String, PyObjectRef>>,
}

const FAST_DUNDERS: &[&str] = &[
    "__init__", "__new__", "__repr__", "__str__", "__bool__", "__len__", "__hash__", "__eq__",
    "__ne__", "__lt__", "__le__", "__gt__", "__ge__", "__add__", "__radd__", "__iadd__", "__sub__",
    "__rsub__", "__isub__", "__mul__", "__rmul__", "__imul__", "__truediv__", "__rtruediv__",
    "__itruediv__", "__floordiv__", "__rfloordiv__", "__ifloordiv__", "__mod__", "__rmod__",
    "__imod__", "__pow__", "__rpow__", "__ipow__", "__lshift__", "__rlshift__", "__ilshift__",
    "__rshift__", "__rrshift__", "__irshift__", "__and__", "__rand__", "__iand__", "__or__",
    "__ror__", "__ior__", "__xor__", "__rxor__", "__ixor__", "__getitem__", "__setitem__",
    "__delitem__", "__contains__", "__iter__", "__next__", "__call__", "__enter__", "__exit__",
    "__getattr__", "__setattr__", "__delattr__", "__get__", "__set__", "__delete__",
];

impl PyClass {
    /// Walks the MRO once, caching the first definition found for every
    /// dunder the VM dispatches on. Called once at class-construction time
    /// rather than on every operator use.
    pub fn rebuild_slots(&self) {
        let mut out = IndexMap::new();
        for name in FAST_DUNDERS {
            if let Some(v) = self.dict.borrow().get(*name) {
                out.insert((*name).to_owned(), v.clone());
                continue;
            }
            for c in &self.mro {
                if let Some(v) = c.dict.borrow().get(*name) {
                    out.insert((*name).to_owned(), v.clone());
                    break;
                }
            }
        }
        *self.dunders.borrow_mut() = out;
    }

    pub fn get_dunder(&self, name: &str) -> Option<PyObjectRef> {
        self.dunders.borrow().get(name).cloned()
    }

    /// Looks `name` up `self` then the MRO, returning the defining class
    /// alongside the value (the object-protocol descriptor walk needs
    /// both, §4.4). The caller must pass its own `Rc` for `self_ref` since
    /// `PyClass` has no back-pointer to the `Rc` that owns it.
    pub fn find_in_mro(&self, self_ref: &PyClassRef, name: &str) -> Option<(PyClassRef, PyObjectRef)> {
        if let Some(v) = self.dict.borrow().get(name) {
            return Some((self_ref.clone(), v.clone()));
        }
        for c in &self.mro {
            if let Some(v) = c.dict.borrow().get(name) {
                return Some((c.clone(), v.clone()));
            }
        }
        None
    }

    pub fn is_subclass_of(&self, other: &PyClass) -> bool {
        std::ptr::eq(self, other) || self.mro.iter().any(|c| std::ptr::eq(c.as_ref(), other))
    }
}

impl fmt::Debug for PyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class '{}'>", self.name)
    }
}
