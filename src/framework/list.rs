//! `System.Collections.Generic.List<T>`, backed by the `Values` slot.
use super::{Builder, Setup};
use crate::error::RuntimeError;
use crate::heap::Handle;
use crate::metadata::TypeId;
use crate::runtime::{Result, Runtime};
use crate::value::Value;

pub(super) fn install(b: &mut Builder, list: TypeId) -> Setup {
    b.constructor(list, "()void", construct)?;
    b.constructor(list, "(int32)void", construct)?;
    b.method(list, "Add", "(!0)void", add)?;
    b.method(
        list,
        "AddRange",
        "([mscorlib]System.Collections.Generic.IEnumerable`1)void",
        add_range,
    )?;
    b.method(list, "get_Count", "()int32", count)?;
    b.method(list, "get_Item", "(int32)!0", get_item)?;
    b.method(list, "set_Item", "(int32,!0)void", set_item)?;
    b.method(list, "GetRange", "(int32,int32)System.Collections.Generic.List`1", get_range)?;
    b.method(list, "IndexOf", "(!0)int32", index_of)?;
    b.method(list, "Contains", "(!0)bool", contains)?;
    b.method(list, "Insert", "(int32,!0)void", insert)?;
    b.method(list, "RemoveAt", "(int32)void", remove_at)?;
    b.method(list, "RemoveRange", "(int32,int32)void", remove_range)?;
    b.method(list, "Clear", "()void", clear)
}

fn this(rt: &Runtime) -> Result<Handle> {
    rt.argument(0)?.as_handle()
}

/// Checks `index` against `length`; `inclusive` also admits `length`.
fn checked(value: Value, length: usize, inclusive: bool) -> Result<usize> {
    let index = value.as_index()?;
    let limit = if inclusive { length + 1 } else { length };
    usize::try_from(index)
        .ok()
        .filter(|&i| i < limit)
        .ok_or(RuntimeError::IndexOutOfRange {
            kind: "list",
            index,
            length,
        })
}

/// Start and end of the `index`/`count` range arguments 1 and 2.
fn range(rt: &mut Runtime) -> Result<(usize, usize)> {
    let (index, count) = (rt.argument(1)?, rt.argument(2)?);
    let length = rt.list_mut(this(rt)?)?.len();
    let start = checked(index, length, true)?;
    let end = checked(Value::Int64(start as i64 + count.as_index()?), length, true)?;
    if end < start {
        return Err(RuntimeError::IndexOutOfRange {
            kind: "list",
            index: count.as_index()?,
            length,
        });
    }
    Ok((start, end))
}

fn construct(rt: &mut Runtime) -> Result<()> {
    let handle = this(rt)?;
    let arguments = rt.arguments()?;
    if let Some(capacity) = arguments.get(1) {
        let capacity = capacity.as_index()?;
        if capacity < 0 {
            return Err(rt.native_fault(format!("negative capacity {capacity}")));
        }
        let capacity = rt.check_array_length(capacity)?;
        rt.list_mut(handle)?.reserve(capacity);
    }
    Ok(())
}

fn add(rt: &mut Runtime) -> Result<()> {
    let item = rt.argument(1)?;
    let handle = this(rt)?;
    rt.list_mut(handle)?.push(item);
    Ok(())
}

fn add_range(rt: &mut Runtime) -> Result<()> {
    let items = rt.elements(rt.argument(1)?)?;
    let handle = this(rt)?;
    rt.list_mut(handle)?.extend(items);
    Ok(())
}

fn count(rt: &mut Runtime) -> Result<()> {
    let handle = this(rt)?;
    let count = rt.list_mut(handle)?.len();
    rt.push(Value::Int32(count as i32))
}

fn get_item(rt: &mut Runtime) -> Result<()> {
    let index = rt.argument(1)?;
    let handle = this(rt)?;
    let values = rt.list_mut(handle)?;
    let item = values[checked(index, values.len(), false)?];
    rt.push(item)
}

fn set_item(rt: &mut Runtime) -> Result<()> {
    let (index, item) = (rt.argument(1)?, rt.argument(2)?);
    let handle = this(rt)?;
    let values = rt.list_mut(handle)?;
    let i = checked(index, values.len(), false)?;
    values[i] = item;
    Ok(())
}

fn get_range(rt: &mut Runtime) -> Result<()> {
    let (start, end) = range(rt)?;
    let handle = this(rt)?;
    let slice = rt.list_mut(handle)?[start..end].to_vec();
    let list = rt.alloc_list(slice)?;
    rt.push(list)
}

fn position(rt: &mut Runtime) -> Result<Option<usize>> {
    let item = rt.argument(1)?;
    let values = rt.elements(rt.argument(0)?)?;
    for (i, value) in values.into_iter().enumerate() {
        if rt.values_equal(value, item)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn index_of(rt: &mut Runtime) -> Result<()> {
    let index = position(rt)?.map_or(-1, |i| i as i32);
    rt.push(Value::Int32(index))
}

fn contains(rt: &mut Runtime) -> Result<()> {
    let found = position(rt)?.is_some();
    rt.push(Value::from_bool(found))
}

fn insert(rt: &mut Runtime) -> Result<()> {
    let (index, item) = (rt.argument(1)?, rt.argument(2)?);
    let handle = this(rt)?;
    let values = rt.list_mut(handle)?;
    let i = checked(index, values.len(), true)?;
    values.insert(i, item);
    Ok(())
}

fn remove_at(rt: &mut Runtime) -> Result<()> {
    let index = rt.argument(1)?;
    let handle = this(rt)?;
    let values = rt.list_mut(handle)?;
    let i = checked(index, values.len(), false)?;
    values.remove(i);
    Ok(())
}

fn remove_range(rt: &mut Runtime) -> Result<()> {
    let (start, end) = range(rt)?;
    let handle = this(rt)?;
    rt.list_mut(handle)?.drain(start..end);
    Ok(())
}

fn clear(rt: &mut Runtime) -> Result<()> {
    let handle = this(rt)?;
    rt.list_mut(handle)?.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::{HeapError, RuntimeError};
    use crate::framework::testing::{call, runtime};
    use crate::heap::ArrayData;
    use crate::runtime::{Result, Runtime, RuntimeOptions};
    use crate::value::Value;

    const LIST: &str = "System.Collections.Generic.List`1";

    fn list_of(rt: &mut Runtime, items: &[i32]) -> Value {
        rt.alloc_list(items.iter().copied().map(Value::Int32).collect())
            .unwrap()
    }

    fn items(rt: &Runtime, list: Value) -> Vec<Value> {
        rt.elements(list).unwrap()
    }

    fn member(
        rt: &mut Runtime,
        name: &str,
        signature: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>> {
        call(rt, LIST, name, signature, arguments)
    }

    #[test]
    fn get_range_copies_a_slice() {
        let mut rt = runtime();
        let list = list_of(&mut rt, &[1, 2, 3, 4]);
        let signature = "(int32,int32)System.Collections.Generic.List`1";
        let arguments = vec![list, Value::Int32(1), Value::Int32(2)];
        let range = member(&mut rt, "GetRange", signature, arguments).unwrap().unwrap();
        assert_eq!(items(&rt, range), [Value::Int32(2), Value::Int32(3)]);
        assert_eq!(items(&rt, list).len(), 4);
    }

    #[test]
    fn add_range_takes_arrays() {
        let mut rt = runtime();
        let list = list_of(&mut rt, &[1]);
        let array = rt.alloc_array(ArrayData::Int32(vec![2, 3])).unwrap();
        let signature = "([mscorlib]System.Collections.Generic.IEnumerable`1)void";
        member(&mut rt, "AddRange", signature, vec![list, array]).unwrap();
        assert_eq!(
            items(&rt, list),
            [Value::Int32(1), Value::Int32(2), Value::Int32(3)]
        );
    }

    #[test]
    fn contains_set_item_and_clear() {
        let mut rt = runtime();
        let list = list_of(&mut rt, &[5, 6]);
        let found = member(&mut rt, "Contains", "(!0)bool", vec![list, Value::Int32(6)]);
        assert_eq!(found.unwrap(), Some(Value::from_bool(true)));

        member(&mut rt, "set_Item", "(int32,!0)void", vec![
            list,
            Value::Int32(1),
            Value::Int32(9),
        ])
        .unwrap();
        let found = member(&mut rt, "Contains", "(!0)bool", vec![list, Value::Int32(6)]);
        assert_eq!(found.unwrap(), Some(Value::from_bool(false)));
        let index = member(&mut rt, "IndexOf", "(!0)int32", vec![list, Value::Int32(9)]);
        assert_eq!(index.unwrap(), Some(Value::Int32(1)));

        member(&mut rt, "Clear", "()void", vec![list]).unwrap();
        let count = member(&mut rt, "get_Count", "()int32", vec![list]);
        assert_eq!(count.unwrap(), Some(Value::Int32(0)));
    }

    #[test]
    fn ranges_past_the_end_fail() {
        let mut rt = runtime();
        let list = list_of(&mut rt, &[1, 2, 3]);
        let result = member(&mut rt, "RemoveRange", "(int32,int32)void", vec![
            list,
            Value::Int32(2),
            Value::Int32(2),
        ]);
        assert!(matches!(
            result,
            Err(RuntimeError::IndexOutOfRange { kind: "list", .. })
        ));
        assert_eq!(items(&rt, list).len(), 3);
        assert_eq!(rt.call_depth(), 0);
    }

    #[test]
    fn capacity_constructor_checks_its_argument() {
        let mut rt = runtime();
        let list = list_of(&mut rt, &[]);
        let ctor = |rt: &mut Runtime, capacity: Value| {
            member(rt, ".ctor", "(int32)void", vec![list, capacity])
        };
        assert!(ctor(&mut rt, Value::Int32(16)).is_ok());
        assert!(matches!(
            ctor(&mut rt, Value::Null),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctor(&mut rt, Value::Int32(-1)),
            Err(RuntimeError::NativeFault { .. })
        ));

        let options = RuntimeOptions::default().with_max_array_length(8);
        let mut rt = Runtime::new(options).unwrap();
        let list = rt.alloc_list(Vec::new()).unwrap();
        let result = call(&mut rt, LIST, ".ctor", "(int32)void", vec![list, Value::Int32(9)]);
        assert!(matches!(
            result,
            Err(RuntimeError::Heap(HeapError::ArrayTooLarge { length: 9, limit: 8 }))
        ));
    }
}
