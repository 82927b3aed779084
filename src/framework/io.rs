//! `System.IO.File` and `System.Console`.
use std::fs;

use tracing::debug;

use super::{Builder, Setup};
use crate::heap::ArrayData;
use crate::runtime::{Result, Runtime};

pub(super) fn install(b: &mut Builder) -> Setup {
    let file = b.ty("System.IO", "File");
    b.method(file, "ReadAllLines", "static (string)string[]", read_all_lines)?;
    b.method(file, "WriteAllText", "static (string,string)void", write_all_text)?;

    let console = b.ty("System", "Console");
    b.method(console, "WriteLine", "static ()void", write_line)?;
    b.method(console, "WriteLine", "static (object)void", write_line)?;
    b.method(console, "Write", "static (object)void", write)
}

fn read_all_lines(rt: &mut Runtime) -> Result<()> {
    let path = rt.text_of(rt.argument(0)?)?;
    debug!(%path, "reading file");
    let content = fs::read_to_string(&path)?;
    let lines = content
        .lines()
        .map(|line| rt.alloc_string(line))
        .collect::<Result<Vec<_>>>()?;
    let array = rt.alloc_array(ArrayData::Refs(lines))?;
    rt.push(array)
}

fn write_all_text(rt: &mut Runtime) -> Result<()> {
    let path = rt.text_of(rt.argument(0)?)?;
    let text = rt.text_of(rt.argument(1)?)?;
    debug!(%path, bytes = text.len(), "writing file");
    fs::write(&path, text)?;
    Ok(())
}

fn write_line(rt: &mut Runtime) -> Result<()> {
    let mut text = match rt.arguments()?.first() {
        Some(&value) => rt.display(value)?,
        None => String::new(),
    };
    text.push('\n');
    rt.write_output(&text)
}

fn write(rt: &mut Runtime) -> Result<()> {
    let text = rt.display(rt.argument(0)?)?;
    rt.write_output(&text)
}
