//! `System.String`. A string object keeps its text in the `Value` slot.
use super::{Builder, Setup};
use crate::heap::ArrayData;
use crate::metadata::TypeId;
use crate::runtime::{Result, Runtime};
use crate::value::Value;

pub(super) fn install(b: &mut Builder, string: TypeId) -> Setup {
    b.method(string, "Concat", "static (string,string)string", concat)?;
    b.method(string, "Concat", "static (string,string,string)string", concat)?;
    b.method(string, "Format", "static (string,object)string", format)?;
    b.method(string, "Join", "static (string,string[])string", join)?;
    b.method(string, "Split", "(char[])string[]", split)?;
    b.method(string, "Split", "()string[]", split)?;
    b.method(string, "get_Length", "()int32", length)?;
    b.method(string, "op_Equality", "static (string,string)bool", equality)
}

fn concat(rt: &mut Runtime) -> Result<()> {
    let mut text = String::new();
    for value in rt.arguments()? {
        text.push_str(&rt.display(value)?);
    }
    let s = rt.alloc_string(&text)?;
    rt.push(s)
}

/// Substitutes the single `{0}` placeholder.
fn format(rt: &mut Runtime) -> Result<()> {
    let template = rt.text_of(rt.argument(0)?)?;
    let arg = rt.display(rt.argument(1)?)?;
    let s = rt.alloc_string(&template.replace("{0}", &arg))?;
    rt.push(s)
}

fn join(rt: &mut Runtime) -> Result<()> {
    let separator = rt.text_of(rt.argument(0)?)?;
    let parts = rt
        .elements(rt.argument(1)?)?
        .into_iter()
        .map(|v| rt.display(v))
        .collect::<Result<Vec<_>>>()?;
    let s = rt.alloc_string(&parts.join(&separator))?;
    rt.push(s)
}

/// Splits on the given characters, or on white space when none are given.
/// Empty entries are kept.
fn split(rt: &mut Runtime) -> Result<()> {
    let text = rt.text_of(rt.argument(0)?)?;
    let separators: Vec<char> = match rt.arguments()?.get(1) {
        Some(&chars @ Value::Ref(_)) => rt
            .elements(chars)?
            .into_iter()
            .filter_map(|v| v.as_i32().ok())
            .filter_map(|c| char::from_u32(c as u32))
            .collect(),
        _ => Vec::new(),
    };
    let parts: Vec<&str> = if separators.is_empty() {
        text.split(char::is_whitespace).collect()
    } else {
        text.split(|c| separators.contains(&c)).collect()
    };
    let parts = parts
        .into_iter()
        .map(|p| rt.alloc_string(p))
        .collect::<Result<Vec<_>>>()?;
    let array = rt.alloc_array(ArrayData::Refs(parts))?;
    rt.push(array)
}

fn length(rt: &mut Runtime) -> Result<()> {
    let text = rt.text_of(rt.argument(0)?)?;
    rt.push(Value::Int32(text.encode_utf16().count() as i32))
}

fn equality(rt: &mut Runtime) -> Result<()> {
    let (a, b) = (rt.argument(0)?, rt.argument(1)?);
    let equal = match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => rt.text_of(a)? == rt.text_of(b)?,
    };
    rt.push(Value::from_bool(equal))
}

#[cfg(test)]
mod tests {
    use crate::framework::testing::{call, runtime};
    use crate::heap::ArrayData;
    use crate::runtime::Runtime;
    use crate::value::Value;

    fn texts(rt: &Runtime, array: Option<Value>) -> Vec<String> {
        rt.elements(array.unwrap())
            .unwrap()
            .into_iter()
            .map(|v| rt.text_of(v).unwrap())
            .collect()
    }

    #[test]
    fn split_on_characters() {
        let mut rt = runtime();
        let text = rt.alloc_string("a,b;;c").unwrap();
        let separators = rt.alloc_array(ArrayData::Char(vec![',', ';'])).unwrap();
        let parts = call(&mut rt, "string", "Split", "(char[])string[]", vec![text, separators]);
        assert_eq!(texts(&rt, parts.unwrap()), ["a", "b", "", "c"]);
    }

    #[test]
    fn split_on_white_space_keeps_empty_entries() {
        let mut rt = runtime();
        let text = rt.alloc_string("42  7\t1").unwrap();
        let parts = call(&mut rt, "string", "Split", "()string[]", vec![text]);
        assert_eq!(texts(&rt, parts.unwrap()), ["42", "", "7", "1"]);
    }

    #[test]
    fn join_and_format() {
        let mut rt = runtime();
        let parts = ["x", "y", "z"]
            .iter()
            .map(|s| rt.alloc_string(s).unwrap())
            .collect();
        let parts = rt.alloc_array(ArrayData::Refs(parts)).unwrap();
        let separator = rt.alloc_string(", ").unwrap();
        let joined = call(&mut rt, "string", "Join", "static (string,string[])string", vec![
            separator, parts,
        ])
        .unwrap()
        .unwrap();
        assert_eq!(rt.text_of(joined).unwrap(), "x, y, z");

        let template = rt.alloc_string("[{0}] {0}").unwrap();
        let formatted = call(&mut rt, "string", "Format", "static (string,object)string", vec![
            template,
            Value::Int32(7),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(rt.text_of(formatted).unwrap(), "[7] 7");
    }

    #[test]
    fn length_counts_utf16_units() {
        let mut rt = runtime();
        let text = rt.alloc_string("h\u{e9}\u{1f600}").unwrap();
        let length = call(&mut rt, "string", "get_Length", "()int32", vec![text]).unwrap();
        assert_eq!(length, Some(Value::Int32(4)));
    }

    #[test]
    fn equality_compares_text_and_nulls() {
        let mut rt = runtime();
        let a = rt.alloc_string("same").unwrap();
        let b = rt.alloc_string("same").unwrap();
        let c = rt.alloc_string("other").unwrap();
        let signature = "static (string,string)bool";
        for (left, right, expected) in [
            (a, b, true),
            (a, c, false),
            (a, Value::Null, false),
            (Value::Null, Value::Null, true),
        ] {
            let equal = call(&mut rt, "string", "op_Equality", signature, vec![left, right]);
            assert_eq!(equal.unwrap(), Some(Value::from_bool(expected)));
        }
    }
}
