//! Values, object protocol, frame/interpreter loop, exceptions,
//! generators, builtins, module registry, governor, and the host-extension
//! ABI (§4.4–§4.9). Mirrors the teacher's `rustpython-vm`, trimmed to the
//! core: no stdlib modules, no JIT, no C-API, no OS bindings.

pub mod builtins;
pub mod class;
pub mod class_builder;
pub mod dict;
pub mod exceptions;
pub mod frame;
pub mod function;
pub mod generator;
pub mod governor;
pub mod host;
pub mod iterator;
pub mod module;
pub mod object_protocol;
pub mod value;

pub use class_builder::ClassBuilder;
pub use exceptions::PyException;
pub use host::{HostError, PyResult, VirtualMachine, VmError};
pub use value::{PyClassRef, PyObjectRef};
