//! `System.Object`.
use crate::runtime::{Result, Runtime};
use crate::value::Value;

pub(super) fn construct(_: &mut Runtime) -> Result<()> {
    Ok(())
}

pub(super) fn to_string(rt: &mut Runtime) -> Result<()> {
    let this = rt.argument(0)?;
    let text = rt.display(this)?;
    let s = rt.alloc_string(&text)?;
    rt.push(s)
}

pub(super) fn equals(rt: &mut Runtime) -> Result<()> {
    let equal = rt.values_equal(rt.argument(0)?, rt.argument(1)?)?;
    rt.push(Value::from_bool(equal))
}
