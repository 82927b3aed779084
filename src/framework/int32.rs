//! `System.Int32`.
use crate::runtime::{Result, Runtime};
use crate::value::Value;

pub(super) fn parse(rt: &mut Runtime) -> Result<()> {
    let text = rt.text_of(rt.argument(0)?)?;
    let value = text
        .trim()
        .parse::<i32>()
        .map_err(|err| rt.native_fault(format!("cannot parse {text:?}: {err}")))?;
    rt.push(Value::Int32(value))
}
