//! Class construction and C3 linearization (§4.4 MRO).
//!
//! `PyClass::mro` holds the class's proper ancestors in resolution order —
//! it never includes the class itself. A self-referential `Rc<PyClass>`
//! would need `Rc::new_cyclic` and a back-pointer for no real benefit;
//! every consumer ([`PyClass::find_in_mro`], [`PyClass::is_subclass_of`],
//! [`PyClass::rebuild_slots`]) checks the class itself before walking
//! `mro`, so the list simply never needs to contain it.

use crate::value::{PyClass, PyClassRef};
use indexmap::IndexMap;
use std::cell::RefCell;

/// The C3 algorithm: merge `[bases' own (self + ancestors) lists...,
/// bases list]`, repeatedly taking the first head that appears nowhere
/// else but in head position. Returns `None` on a monotonicity conflict
/// (diamond bases that disagree on ordering), which the caller turns
/// into a `TypeError`. The returned list excludes `name` itself.
pub fn c3_linearize(bases: &[PyClassRef]) -> Option<Vec<PyClassRef>> {
    if bases.is_empty() {
        return Some(vec![]);
    }
    let mut seqs: Vec<Vec<PyClassRef>> =
        bases.iter().map(|b| std::iter::once(b.clone()).chain(b.mro.iter().cloned()).collect()).collect();
    seqs.push(bases.to_vec());

    let mut result = Vec::new();
    loop {
        seqs.retain(|s| !s.is_empty());
        if seqs.is_empty() {
            return Some(result);
        }
        let mut chosen: Option<PyClassRef> = None;
        for seq in &seqs {
            let candidate = &seq[0];
            let appears_in_tail =
                seqs.iter().any(|s| s[1..].iter().any(|c| std::ptr::eq(c.as_ref(), candidate.as_ref())));
            if !appears_in_tail {
                chosen = Some(candidate.clone());
                break;
            }
        }
        let chosen = chosen?;
        for seq in &mut seqs {
            if !seq.is_empty() && std::ptr::eq(seq[0].as_ref(), chosen.as_ref()) {
                seq.remove(0);
            } else {
                seq.retain(|c| !std::ptr::eq(c.as_ref(), chosen.as_ref()));
            }
        }
        result.push(chosen);
    }
}

/// Builds a class outside the running program — the bootstrap hierarchy
/// (`object`, builtin types, exceptions) and host-registered classes.
pub fn new_builtin_class(name: &str, bases: Vec<PyClassRef>, slots: Option<Vec<String>>) -> PyClassRef {
    let mro = c3_linearize(&bases).unwrap_or_else(|| bases.clone());
    let class = PyClassRef::new(PyClass {
        name: name.to_owned(),
        bases,
        mro,
        dict: RefCell::new(IndexMap::new()),
        metaclass: None,
        slot_names: slots.clone().unwrap_or_default(),
        has_slots: slots.is_some(),
        dunders: RefCell::new(IndexMap::new()),
    });
    class.rebuild_slots();
    class
}

/// `class Foo(Base1, Base2, metaclass=Meta): ...` at runtime — validates
/// the MRO and freezes the namespace built by executing the class body.
pub fn new_class(
    name: &str,
    bases: Vec<PyClassRef>,
    namespace: IndexMap<String, crate::value::PyObjectRef>,
    metaclass: Option<PyClassRef>,
) -> Result<PyClassRef, String> {
    let mro = c3_linearize(&bases)
        .ok_or_else(|| format!("Cannot create a consistent method resolution order (MRO) for bases of class '{name}'"))?;
    let class = PyClassRef::new(PyClass {
        name: name.to_owned(),
        bases,
        mro,
        dict: RefCell::new(namespace),
        metaclass,
        slot_names: vec![],
        has_slots: false,
        dunders: RefCell::new(IndexMap::new()),
    });
    class.rebuild_slots();
    Ok(class)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, bases: Vec<PyClassRef>) -> PyClassRef {
        new_builtin_class(name, bases, None)
    }

    #[test]
    fn diamond_mro_matches_c3_order() {
        let object = class("object", vec![]);
        let a = class("A", vec![object.clone()]);
        let b = class("B", vec![a.clone()]);
        let c = class("C", vec![a.clone()]);
        let d = class("D", vec![b.clone(), c.clone()]);

        let names: Vec<&str> = d.mro.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["B", "C", "A", "object"]);
    }

    #[test]
    fn inconsistent_bases_have_no_linearization() {
        let object = class("object", vec![]);
        let a = class("A", vec![object.clone()]);
        let b = class("B", vec![object.clone()]);
        // X(A, B), Y(B, A): no ordering satisfies both local precedences.
        let x = class("X", vec![a.clone(), b.clone()]);
        let y = class("Y", vec![b.clone(), a.clone()]);
        assert!(c3_linearize(&[x, y]).is_none());
    }
}
