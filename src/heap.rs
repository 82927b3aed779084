//! Object heap: a generational arena of [`ObjectInstance`]s addressed by
//! [`Handle`]s.
use std::collections::HashSet;
use std::fmt;

use crate::error::{HeapError, RuntimeError};
use crate::metadata::{TypeId, TypeRef};
use crate::value::Value;

/// Opaque reference to a heap object. The generation tag makes a handle to
/// a reclaimed entry detectably stale instead of aliasing its successor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}.{}", self.index, self.generation)
    }
}

/// Backing store of an array object, chosen by element type.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Char(Vec<char>),
    Refs(Vec<Value>),
}

impl ArrayData {
    /// Zeroed storage for `length` elements of type `element`.
    pub fn for_element(element: &TypeRef, length: usize) -> Self {
        if element.namespace != "System" {
            return Self::Refs(vec![Value::Null; length]);
        }
        match element.name.as_str() {
            "Int32" | "UInt32" | "Int16" | "UInt16" | "SByte" | "Byte" | "Boolean" => {
                Self::Int32(vec![0; length])
            }
            "Int64" | "UInt64" => Self::Int64(vec![0; length]),
            "Single" | "Double" => Self::Float64(vec![0.0; length]),
            "Char" => Self::Char(vec!['\0'; length]),
            _ => Self::Refs(vec![Value::Null; length]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Refs(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, index: i64) -> Result<usize, RuntimeError> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.len())
            .ok_or(RuntimeError::IndexOutOfRange {
                kind: "array",
                index,
                length: self.len(),
            })
    }

    pub fn get(&self, index: i64) -> Result<Value, RuntimeError> {
        let i = self.check(index)?;
        Ok(match self {
            Self::Int32(v) => Value::Int32(v[i]),
            Self::Int64(v) => Value::Int64(v[i]),
            Self::Float64(v) => Value::Float64(v[i]),
            Self::Char(v) => Value::Int32(v[i] as i32),
            Self::Refs(v) => v[i],
        })
    }

    pub fn set(&mut self, index: i64, value: Value) -> Result<(), RuntimeError> {
        let i = self.check(index)?;
        match (self, value) {
            (Self::Int32(v), Value::Int32(x)) => v[i] = x,
            (Self::Int32(v), Value::Int64(x)) => v[i] = x as i32,
            (Self::Int64(v), Value::Int64(x)) => v[i] = x,
            (Self::Int64(v), Value::Int32(x)) => v[i] = x as i64,
            (Self::Float64(v), Value::Float64(x)) => v[i] = x,
            (Self::Float64(v), Value::Int32(x)) => v[i] = x as f64,
            (Self::Char(v), Value::Int32(x)) => {
                v[i] = char::from_u32(x as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
            }
            (Self::Refs(v), x) => v[i] = x,
            (_, x) => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "array element",
                    found: x.kind().to_string(),
                })
            }
        }
        Ok(())
    }

    /// Elements as values, in order.
    pub fn values(&self) -> Vec<Value> {
        match self {
            Self::Int32(v) => v.iter().map(|&x| Value::Int32(x)).collect(),
            Self::Int64(v) => v.iter().map(|&x| Value::Int64(x)).collect(),
            Self::Float64(v) => v.iter().map(|&x| Value::Float64(x)).collect(),
            Self::Char(v) => v.iter().map(|&c| Value::Int32(c as i32)).collect(),
            Self::Refs(v) => v.clone(),
        }
    }
}

/// Content of one field slot. Plain values cover user fields; the other
/// variants hold the native payload of framework strings, arrays and lists.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Value),
    Text(String),
    Array(ArrayData),
    List(Vec<Value>),
}

impl Default for Slot {
    fn default() -> Self {
        Self::Value(Value::Null)
    }
}

impl Slot {
    /// Default content of a field declared with `field_type`.
    pub fn for_field(field_type: Option<&TypeRef>) -> Self {
        Self::Value(default_value(field_type))
    }

    /// Heap references held by this slot.
    fn references(&self) -> Box<dyn Iterator<Item = Handle> + '_> {
        let handle = |v: &Value| match v {
            Value::Ref(h) => Some(*h),
            _ => None,
        };
        match self {
            Self::Value(v) => Box::new(handle(v).into_iter()),
            Self::Array(ArrayData::Refs(values)) | Self::List(values) => {
                Box::new(values.iter().filter_map(handle))
            }
            Self::Array(_) | Self::Text(_) => Box::new(std::iter::empty()),
        }
    }
}

/// Zero value of a field or static of type `field_type`: numeric zero for
/// primitives, `null` for everything else.
pub fn default_value(field_type: Option<&TypeRef>) -> Value {
    match field_type {
        Some(t) if t.namespace == "System" => match t.name.as_str() {
            "Int32" | "UInt32" | "Int16" | "UInt16" | "SByte" | "Byte" | "Boolean" | "Char" => {
                Value::Int32(0)
            }
            "Int64" | "UInt64" => Value::Int64(0),
            "Single" | "Double" => Value::Float64(0.0),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

/// A heap object: its type plus one slot per field of the type's layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInstance {
    ty: TypeId,
    slots: Vec<Slot>,
}

impl ObjectInstance {
    pub fn new(ty: TypeId, slots: Vec<Slot>) -> Self {
        Self { ty, slots }
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    object: Option<ObjectInstance>,
}

/// Generational object store with a fixed capacity of live objects.
///
/// Storing never reclaims anything on its own; once `capacity` objects are
/// live, [`Heap::store`] fails until something is released or swept.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn store(&mut self, object: ObjectInstance) -> Result<Handle, HeapError> {
        if self.live >= self.capacity {
            return Err(HeapError::Full {
                capacity: self.capacity,
            });
        }
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.object = Some(object);
            return Ok(Handle::new(index, entry.generation));
        }
        self.entries.push(Entry {
            generation: 0,
            object: Some(object),
        });
        Ok(Handle::new(self.entries.len() as u32 - 1, 0))
    }

    pub fn get(&self, handle: Handle) -> Result<&ObjectInstance, HeapError> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.object.as_ref())
            .ok_or(HeapError::NotFound(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut ObjectInstance, HeapError> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.object.as_mut())
            .ok_or(HeapError::NotFound(handle))
    }

    /// Removes an object. Its handle, and any copy of it, becomes stale.
    pub fn release(&mut self, handle: Handle) -> Result<ObjectInstance, HeapError> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation && e.object.is_some())
            .ok_or(HeapError::NotFound(handle))?;
        let object = entry.object.take().ok_or(HeapError::NotFound(handle))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(object)
    }

    /// Handles of every live object.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.iter().enumerate().filter_map(|(index, e)| {
            e.object
                .as_ref()
                .map(|_| Handle::new(index as u32, e.generation))
        })
    }

    /// Mark and sweep: releases every object not reachable from `roots`.
    /// Returns how many objects were reclaimed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Handle>) -> usize {
        let mut marked = HashSet::new();
        let mut pending: Vec<Handle> = roots.into_iter().collect();
        while let Some(handle) = pending.pop() {
            if !marked.insert(handle) {
                continue;
            }
            if let Ok(object) = self.get(handle) {
                pending.extend(object.slots.iter().flat_map(Slot::references));
            }
        }
        let mut reclaimed = 0;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let handle = Handle::new(index as u32, entry.generation);
            if entry.object.is_none() || marked.contains(&handle) {
                continue;
            }
            entry.object = None;
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(index as u32);
            reclaimed += 1;
        }
        self.live -= reclaimed;
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Catalog;

    fn some_type() -> TypeId {
        let mut catalog = Catalog::new();
        let asm = catalog.add_assembly("Sample", false);
        catalog.add_type(asm, "Sample", "Node", None)
    }

    #[test]
    fn store_and_get() {
        let ty = some_type();
        let mut heap = Heap::new(4);
        let h = heap.store(ObjectInstance::new(ty, vec![Slot::Value(Value::Int32(7))])).unwrap();
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.get(h).unwrap().slot(0), Some(&Slot::Value(Value::Int32(7))));
        if let Some(Slot::Value(v)) = heap.get_mut(h).unwrap().slot_mut(0) {
            *v = Value::Int32(8);
        }
        assert_eq!(heap.get(h).unwrap().slots(), &[Slot::Value(Value::Int32(8))]);
    }

    #[test]
    fn full_heap_fails() {
        let ty = some_type();
        let mut heap = Heap::new(2);
        heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        assert_eq!(
            heap.store(ObjectInstance::new(ty, vec![])),
            Err(HeapError::Full { capacity: 2 })
        );
    }

    #[test]
    fn released_handles_go_stale() {
        let ty = some_type();
        let mut heap = Heap::new(2);
        let old = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        heap.release(old).unwrap();
        let new = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(heap.get(old), Err(HeapError::NotFound(old)));
        assert!(heap.get(new).is_ok());
    }

    #[test]
    fn collect_keeps_reachable_objects() {
        let ty = some_type();
        let mut heap = Heap::new(8);
        let leaf = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        let listed = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        let root = heap
            .store(ObjectInstance::new(
                ty,
                vec![Slot::Value(Value::Ref(leaf)), Slot::List(vec![Value::Ref(listed)])],
            ))
            .unwrap();
        let garbage = heap.store(ObjectInstance::new(ty, vec![])).unwrap();

        assert_eq!(heap.collect([root]), 1);
        assert_eq!(heap.len(), 3);
        assert!(heap.get(garbage).is_err());
        assert!(heap.get(leaf).is_ok());
        assert!(heap.get(listed).is_ok());
    }

    #[test]
    fn collect_recycles_swept_slots() {
        let ty = some_type();
        let mut heap = Heap::new(2);
        let kept = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        let swept = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        assert!(heap.store(ObjectInstance::new(ty, vec![])).is_err());

        assert_eq!(heap.collect([kept]), 1);
        assert_eq!(heap.collect([kept]), 0);
        assert_eq!(heap.len(), 1);
        let reused = heap.store(ObjectInstance::new(ty, vec![])).unwrap();
        assert_eq!(reused.index(), swept.index());
        assert_eq!(heap.get(swept), Err(HeapError::NotFound(swept)));
    }

    #[test]
    fn arrays_by_element_type() {
        let mut ints = ArrayData::for_element(&TypeRef::framework("System", "Int32"), 3);
        ints.set(1, Value::Int32(5)).unwrap();
        assert_eq!(ints.get(1).unwrap(), Value::Int32(5));
        assert!(matches!(
            ints.get(3),
            Err(RuntimeError::IndexOutOfRange { index: 3, length: 3, .. })
        ));
        let strings = ArrayData::for_element(&TypeRef::framework("System", "String"), 2);
        assert_eq!(strings.values(), vec![Value::Null, Value::Null]);
        let mut chars = ArrayData::for_element(&TypeRef::framework("System", "Char"), 1);
        chars.set(0, Value::Int32(' ' as i32)).unwrap();
        assert_eq!(chars, ArrayData::Char(vec![' ']));
    }
}
