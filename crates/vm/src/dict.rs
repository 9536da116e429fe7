//! `dict`/`set` storage keyed on Python equality and hashing rather than
//! Rust's `Hash`/`Eq`, since both are dunder-dispatched and potentially
//! recursive (§9 "Hashing and equality are dunder-dispatched"). Modeled on
//! the teacher's `dictdatatype.rs`: a dense entry vec plus a hash-bucket
//! index, with deletions left as tombstones so insertion order survives.

use crate::host::{PyResult, VirtualMachine};
use crate::value::PyObjectRef;
use ahash::AHashMap;

struct DictEntry {
    hash: u64,
    key: PyObjectRef,
    value: PyObjectRef,
}

#[derive(Default)]
pub struct PyDict {
    entries: Vec<Option<DictEntry>>,
    index: AHashMap<u64, Vec<usize>>,
    used: usize,
}

impl PyDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn find_slot(&self, vm: &mut VirtualMachine, hash: u64, key: &PyObjectRef) -> PyResult<Option<usize>> {
        let Some(candidates) = self.index.get(&hash) else { return Ok(None) };
        for &idx in candidates {
            let Some(entry) = &self.entries[idx] else { continue };
            if vm.values_eq(&entry.key, key)? {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    /// Inserts or overwrites `key` → `value`, returning the prior value.
    pub fn insert(&mut self, vm: &mut VirtualMachine, key: PyObjectRef, value: PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        let hash = vm.hash_value(&key)?;
        if let Some(idx) = self.find_slot(vm, hash, &key)? {
            let entry = self.entries[idx].as_mut().unwrap();
            return Ok(Some(std::mem::replace(&mut entry.value, value)));
        }
        let idx = self.entries.len();
        self.entries.push(Some(DictEntry { hash, key, value }));
        self.index.entry(hash).or_default().push(idx);
        self.used += 1;
        Ok(None)
    }

    pub fn get(&self, vm: &mut VirtualMachine, key: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        let hash = vm.hash_value(key)?;
        Ok(self.find_slot(vm, hash, key)?.map(|idx| self.entries[idx].as_ref().unwrap().value.clone()))
    }

    pub fn contains(&self, vm: &mut VirtualMachine, key: &PyObjectRef) -> PyResult<bool> {
        Ok(self.get(vm, key)?.is_some())
    }

    pub fn remove(&mut self, vm: &mut VirtualMachine, key: &PyObjectRef) -> PyResult<Option<PyObjectRef>> {
        let hash = vm.hash_value(key)?;
        let Some(idx) = self.find_slot(vm, hash, key)? else { return Ok(None) };
        let entry = self.entries[idx].take().unwrap();
        if let Some(bucket) = self.index.get_mut(&hash) {
            bucket.retain(|&i| i != idx);
        }
        self.used -= 1;
        Ok(Some(entry.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PyObjectRef, &PyObjectRef)> {
        self.entries.iter().filter_map(|e| e.as_ref()).map(|e| (&e.key, &e.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &PyObjectRef> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &PyObjectRef> {
        self.iter().map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.used = 0;
    }
}

/// A set shares the dict's bucket/tombstone machinery with value == key.
pub fn set_insert(set: &mut PyDict, vm: &mut VirtualMachine, key: PyObjectRef) -> PyResult<bool> {
    let existed = set.contains(vm, &key)?;
    set.insert(vm, key.clone(), key)?;
    Ok(!existed)
}

pub fn set_remove(set: &mut PyDict, vm: &mut VirtualMachine, key: &PyObjectRef) -> PyResult<bool> {
    Ok(set.remove(vm, key)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_preserves_insertion_order_across_overwrite_and_delete() {
        let mut vm = VirtualMachine::new();
        let mut d = PyDict::new();
        let a = vm.new_str("a");
        let b = vm.new_str("b");
        let c = vm.new_str("c");
        d.insert(&mut vm, a.clone(), vm.new_int(1)).unwrap();
        d.insert(&mut vm, b.clone(), vm.new_int(2)).unwrap();
        d.insert(&mut vm, c.clone(), vm.new_int(3)).unwrap();
        d.remove(&mut vm, &b).unwrap();
        d.insert(&mut vm, a.clone(), vm.new_int(10)).unwrap();

        let keys: Vec<String> =
            d.keys().map(|k| if let crate::value::PyPayload::Str(s) = &k.payload { s.clone() } else { unreachable!() }).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(d.len(), 2);

        let a_value = d.get(&mut vm, &a).unwrap().unwrap();
        assert!(matches!(a_value.payload, crate::value::PyPayload::Int(10)));
    }

    #[test]
    fn int_and_equal_float_share_a_bucket() {
        let mut vm = VirtualMachine::new();
        let mut d = PyDict::new();
        let one_int = vm.new_int(1);
        let one_float = vm.new_float(1.0);
        d.insert(&mut vm, one_int, vm.new_str("first")).unwrap();
        // `1 == 1.0` and `hash(1) == hash(1.0)`, so this overwrites rather
        // than adding a second entry.
        d.insert(&mut vm, one_float.clone(), vm.new_str("second")).unwrap();
        assert_eq!(d.len(), 1);
        let v = d.get(&mut vm, &one_float).unwrap().unwrap();
        assert!(matches!(&v.payload, crate::value::PyPayload::Str(s) if s == "second"));
    }
}
