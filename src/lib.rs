//! `cilvm` loads CIL method bodies and interprets them against a small
//! framework of native stand-ins.
pub mod assembler;
pub mod bytecode;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod framework;
pub mod heap;
pub mod instruction;
pub mod interpreter;
pub mod metadata;
pub mod module;
pub mod runtime;
pub mod value;

pub use error::{AssembleError, DecodeError, HeapError, ResolveError, RuntimeError};
pub use module::ModuleImage;
pub use runtime::{ArgumentOrder, Runtime, RuntimeOptions};
pub use value::Value;
