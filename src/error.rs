//! Error taxonomy of the engine. Every error is fatal: nothing is retried and
//! no interpreted code observes a fault.
use crate::heap::Handle;

/// Failure while turning raw bytes into instructions.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{value:02X} at offset {offset}")]
    UnknownOpcode { offset: usize, value: u8 },

    #[error("unknown extended opcode 0xFE 0x{value:02X} at offset {offset}")]
    UnknownExtendedOpcode { offset: usize, value: u8 },

    #[error("instruction stream truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("branch target {target} at offset {offset} is outside the method body")]
    BadBranchTarget { offset: usize, target: i64 },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// A metadata token, type, member or native behavior could not be found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("metadata token 0x{0:08X} is not defined")]
    UnknownToken(u32),

    #[error("metadata token 0x{token:08X} does not name a {expected}")]
    WrongTokenKind { token: u32, expected: &'static str },

    #[error("assembly {0} is not supported")]
    Assembly(String),

    #[error("type {name} in assembly {assembly} is not supported")]
    Type { assembly: String, name: String },

    #[error("member {member} of type {type_name} is not supported")]
    Member { type_name: String, member: String },

    #[error("no native implementation registered for {type_name}::{member}/{arity}")]
    NoNative {
        type_name: String,
        member: String,
        arity: usize,
    },

    #[error("malformed signature `{0}`")]
    Signature(String),

    #[error("type {0} inherits from itself")]
    CyclicInheritance(String),
}

/// Heap faults. `NotFound` always means the engine lost track of an object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap is full ({capacity} objects)")]
    Full { capacity: usize },

    #[error("object {0} is not on the heap; this is an internal consistency fault")]
    NotFound(Handle),

    #[error("field {field} does not exist on type {type_name}")]
    UnknownField { type_name: String, field: String },

    #[error("array of {length} elements exceeds the limit of {limit}")]
    ArrayTooLarge { length: i64, limit: usize },

    #[error("object {handle} has no {expected} in slot {field}")]
    SlotKind {
        handle: Handle,
        field: String,
        expected: &'static str,
    },
}

/// Failure while assembling textual IL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct AssembleError {
    pub line: usize,
    pub message: String,
}

/// Any fault raised while running interpreted or native code.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error("IL_{offset:04}: {mnemonic} is not supported")]
    UnsupportedInstruction { offset: u32, mnemonic: &'static str },

    #[error("stack overflow: call depth {depth} exceeds the limit of {limit}")]
    StackOverflow { depth: usize, limit: usize },

    #[error("evaluation stack underflow in {method}")]
    StackUnderflow { method: String },

    #[error("{method} returns a value but left its evaluation stack empty")]
    InvalidReturn { method: String },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("IL_{offset:04}: {mnemonic} is missing its operand")]
    MissingOperand { offset: u32, mnemonic: &'static str },

    #[error("no instruction starts at branch target {0:04}")]
    BadBranchTarget(u32),

    #[error("{kind} index {index} is out of range (length {length})")]
    IndexOutOfRange {
        kind: &'static str,
        index: i64,
        length: usize,
    },

    #[error("arithmetic fault: {0}")]
    ArithmeticFault(&'static str),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("cannot cast an instance of {from} to {to}")]
    InvalidCast { from: String, to: String },

    #[error("no loaded assembly contains a static Main method")]
    NoEntryPoint,

    #[error("{method}: {message}")]
    NativeFault { method: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
