//! Decoded instructions and their textual rendering.
use std::collections::HashMap;
use std::fmt;

use crate::bytecode::OPCode;
use crate::metadata::{FieldRef, MethodRef, TypeRef};

/// Resolved operand of an instruction. Which variant appears is fixed by the
/// opcode's operand kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    /// Absolute byte offset of a branch target.
    Target(u32),
    /// Absolute byte offsets of a switch table.
    Switch(Vec<u32>),
    Field(FieldRef),
    Method(MethodRef),
    Type(TypeRef),
    /// Local or argument slot index.
    Variable(u16),
    /// Stand-alone signature token, kept raw.
    Signature(u32),
    /// Metadata token that could not be resolved.
    Unresolved(u32),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OPCode,
    pub offset: u32,
    pub operand: Option<Operand>,
}

impl Instruction {
    pub fn new(opcode: OPCode, offset: u32, operand: Option<Operand>) -> Self {
        Self {
            opcode,
            offset,
            operand,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IL_{:04}: {}", self.offset, self.opcode)?;
        let Some(operand) = &self.operand else {
            return Ok(());
        };
        match operand {
            Operand::Int32(v) => write!(f, " {v}"),
            Operand::Int64(v) => write!(f, " {v}"),
            Operand::Float32(v) => write!(f, " {v}"),
            Operand::Float64(v) => write!(f, " {v}"),
            Operand::String(s) => write!(f, " \"{}\"", escape(s)),
            Operand::Target(target) => write!(f, " {target:04}"),
            Operand::Switch(targets) => {
                let targets: Vec<String> = targets.iter().map(|t| format!("{t:04}")).collect();
                write!(f, " ({})", targets.join(","))
            }
            Operand::Field(field) => write!(f, " {field}"),
            Operand::Method(method) => write!(f, " {method}"),
            Operand::Type(ty) => write!(f, " {ty}"),
            Operand::Variable(index) => write!(f, " {index}"),
            Operand::Signature(_) | Operand::Unresolved(_) => write!(f, " not supported"),
        }
    }
}

/// Escapes control characters and quotes the way IL listings print them.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

/// The executable form of a method: its instructions plus the mapping from
/// byte offset to instruction index that branches resolve through.
#[derive(Debug, Default, Clone)]
pub struct MethodBody {
    instructions: Vec<Instruction>,
    offsets: HashMap<u32, usize>,
}

impl MethodBody {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        let offsets = instructions
            .iter()
            .enumerate()
            .map(|(index, inst)| (inst.offset, index))
            .collect();
        Self {
            instructions,
            offsets,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Index of the instruction starting at `offset`.
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.offsets.get(&offset).copied()
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, inst) in self.instructions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{inst}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Signature;

    #[test]
    fn renders_plain_and_numeric_operands() {
        let nop = Instruction::new(OPCode::Nop, 0, None);
        assert_eq!(nop.to_string(), "IL_0000: nop");
        let ldc = Instruction::new(OPCode::LdcI4S, 1, Some(Operand::Int32(-10)));
        assert_eq!(ldc.to_string(), "IL_0001: ldc.i4.s -10");
        let ldc8 = Instruction::new(OPCode::LdcI8, 21, Some(Operand::Int64(-10000000000)));
        assert_eq!(ldc8.to_string(), "IL_0021: ldc.i8 -10000000000");
        let br = Instruction::new(OPCode::BrS, 12, Some(Operand::Target(7)));
        assert_eq!(br.to_string(), "IL_0012: br.s 0007");
    }

    #[test]
    fn renders_strings_escaped() {
        let ldstr = Instruction::new(OPCode::Ldstr, 3, Some(Operand::String("\r\n".into())));
        assert_eq!(ldstr.to_string(), "IL_0003: ldstr \"\\r\\n\"");
    }

    #[test]
    fn renders_members() {
        let console = TypeRef::framework("System", "Console");
        let call = Instruction::new(
            OPCode::Call,
            10,
            Some(Operand::Method(MethodRef {
                declaring_type: console,
                name: "WriteLine".into(),
                signature: Signature {
                    is_static: true,
                    parameters: vec![TypeRef::framework("System", "Int32")],
                    return_type: TypeRef::void(),
                },
            })),
        );
        assert_eq!(
            call.to_string(),
            "IL_0010: call System.Void System.Console::WriteLine()"
        );

        let field = Instruction::new(
            OPCode::Ldfld,
            4,
            Some(Operand::Field(FieldRef {
                declaring_type: TypeRef::new("Sample", "Sample", "Node"),
                name: "keys".into(),
                field_type: None,
            })),
        );
        assert_eq!(field.to_string(), "IL_0004: ldfld Sample.Node::keys");

        let tok = Instruction::new(OPCode::Ldtoken, 0, Some(Operand::Unresolved(0x0400_0001)));
        assert_eq!(tok.to_string(), "IL_0000: ldtoken not supported");
    }

    #[test]
    fn maps_offsets_to_indices() {
        let body = MethodBody::new(vec![
            Instruction::new(OPCode::LdcI4S, 0, Some(Operand::Int32(5))),
            Instruction::new(OPCode::Stloc0, 2, None),
            Instruction::new(OPCode::Ret, 3, None),
        ]);
        assert_eq!(body.index_of(2), Some(1));
        assert_eq!(body.index_of(1), None);
        assert_eq!(body.len(), 3);
    }
}
