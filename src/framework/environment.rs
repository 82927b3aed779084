//! `System.Environment`.
use super::{Builder, Setup};
use crate::runtime::{Result, Runtime};

const NEW_LINE: &str = if cfg!(windows) { "\r\n" } else { "\n" };

pub(super) fn install(b: &mut Builder) -> Setup {
    let environment = b.ty("System", "Environment");
    b.method(environment, "get_NewLine", "static ()string", new_line)
}

fn new_line(rt: &mut Runtime) -> Result<()> {
    let s = rt.alloc_string(NEW_LINE)?;
    rt.push(s)
}
