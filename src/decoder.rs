//! Decoder turning a raw CIL byte stream into [`Instruction`]s.
//!
//! Operands are read with the exact width their opcode's operand kind
//! prescribes, little-endian. Metadata tokens are resolved at decode time
//! through a caller supplied [`MetadataResolver`].
use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::bytecode::{OPCode, OperandKind, EXTENDED_PREFIX};
use crate::error::{DecodeError, ResolveError};
use crate::instruction::{Instruction, MethodBody, Operand};
use crate::metadata::{FieldRef, MethodRef, TypeRef};

/// Capability turning metadata tokens embedded in a method body into
/// name-based references.
pub trait MetadataResolver {
    fn resolve_string(&self, token: u32) -> Result<String, ResolveError>;

    fn resolve_field(&self, token: u32) -> Result<FieldRef, ResolveError>;

    fn resolve_method(&self, token: u32) -> Result<MethodRef, ResolveError>;

    /// Resolves method-like members that are not plain methods, such as
    /// constructors. Used when [`Self::resolve_method`] fails.
    fn resolve_member(&self, token: u32) -> Result<MethodRef, ResolveError>;

    fn resolve_type(&self, token: u32) -> Result<TypeRef, ResolveError>;
}

/// Resolver for bodies that carry no metadata tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetadata;

impl MetadataResolver for NoMetadata {
    fn resolve_string(&self, token: u32) -> Result<String, ResolveError> {
        Err(ResolveError::UnknownToken(token))
    }

    fn resolve_field(&self, token: u32) -> Result<FieldRef, ResolveError> {
        Err(ResolveError::UnknownToken(token))
    }

    fn resolve_method(&self, token: u32) -> Result<MethodRef, ResolveError> {
        Err(ResolveError::UnknownToken(token))
    }

    fn resolve_member(&self, token: u32) -> Result<MethodRef, ResolveError> {
        Err(ResolveError::UnknownToken(token))
    }

    fn resolve_type(&self, token: u32) -> Result<TypeRef, ResolveError> {
        Err(ResolveError::UnknownToken(token))
    }
}

/// Bytecode decoder.
///
/// In the default strict mode an unresolvable field, method, type or string
/// token is a fatal error. The listing mode used for disassembly keeps such
/// operands as [`Operand::Unresolved`] instead.
pub struct Decoder<'a> {
    resolver: &'a dyn MetadataResolver,
    lenient: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(resolver: &'a dyn MetadataResolver) -> Self {
        Self {
            resolver,
            lenient: false,
        }
    }

    /// Decoder for textual listings: unresolvable tokens do not fail.
    pub fn listing(resolver: &'a dyn MetadataResolver) -> Self {
        Self {
            resolver,
            lenient: true,
        }
    }

    /// Decodes the whole byte range into consecutive instructions.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
        let mut cursor = Cursor::new(code);
        let mut instructions = Vec::new();
        while (cursor.position() as usize) < code.len() {
            let offset = cursor.position() as usize;
            let value = cursor.read_u8().map_err(truncated(offset))?;
            let opcode = if value == EXTENDED_PREFIX {
                let second = cursor.read_u8().map_err(truncated(offset))?;
                OPCode::from_extended_byte(second)
                    .ok_or(DecodeError::UnknownExtendedOpcode { offset, value: second })?
            } else {
                OPCode::from_byte(value).ok_or(DecodeError::UnknownOpcode { offset, value })?
            };
            let operand = self.read_operand(&mut cursor, opcode.operand_kind(), code.len())?;
            instructions.push(Instruction::new(opcode, offset as u32, operand));
        }
        Ok(instructions)
    }

    /// Decodes `code` into its executable form.
    pub fn decode_body(&self, code: &[u8]) -> Result<MethodBody, DecodeError> {
        Ok(MethodBody::new(self.decode(code)?))
    }

    fn read_operand(
        &self,
        cursor: &mut Cursor<&[u8]>,
        kind: OperandKind,
        len: usize,
    ) -> Result<Option<Operand>, DecodeError> {
        let start = cursor.position() as usize;
        let eof = truncated(start);
        let operand = match kind {
            OperandKind::InlineNone => return Ok(None),
            OperandKind::ShortInlineVar => Operand::Variable(cursor.read_u8().map_err(eof)? as u16),
            OperandKind::InlineVar => {
                Operand::Variable(cursor.read_u16::<LittleEndian>().map_err(eof)?)
            }
            OperandKind::ShortInlineI => Operand::Int32(cursor.read_i8().map_err(eof)? as i32),
            OperandKind::InlineI => Operand::Int32(cursor.read_i32::<LittleEndian>().map_err(eof)?),
            OperandKind::InlineI8 => {
                Operand::Int64(cursor.read_i64::<LittleEndian>().map_err(eof)?)
            }
            OperandKind::ShortInlineR => {
                Operand::Float32(cursor.read_f32::<LittleEndian>().map_err(eof)?)
            }
            OperandKind::InlineR => {
                Operand::Float64(cursor.read_f64::<LittleEndian>().map_err(eof)?)
            }
            OperandKind::ShortInlineBrTarget => {
                let relative = cursor.read_i8().map_err(eof)? as i64;
                Operand::Target(absolute(start, relative, cursor.position())?)
            }
            OperandKind::InlineBrTarget => {
                let relative = cursor.read_i32::<LittleEndian>().map_err(eof)? as i64;
                Operand::Target(absolute(start, relative, cursor.position())?)
            }
            OperandKind::InlineSwitch => {
                let count = cursor.read_u32::<LittleEndian>().map_err(eof)? as usize;
                let remaining = len.saturating_sub(cursor.position() as usize);
                if count.saturating_mul(4) > remaining {
                    return Err(DecodeError::Truncated { offset: start });
                }
                let mut relatives = Vec::with_capacity(count);
                for _ in 0..count {
                    let relative = cursor.read_i32::<LittleEndian>().map_err(truncated(start))?;
                    relatives.push(relative as i64);
                }
                // Targets are relative to the end of the whole table.
                let end = cursor.position();
                let targets = relatives
                    .into_iter()
                    .map(|relative| absolute(start, relative, end))
                    .collect::<Result<Vec<_>, _>>()?;
                Operand::Switch(targets)
            }
            OperandKind::InlineString => {
                let token = cursor.read_u32::<LittleEndian>().map_err(eof)?;
                self.resolved(token, self.resolver.resolve_string(token).map(Operand::String))?
            }
            OperandKind::InlineField => {
                let token = cursor.read_u32::<LittleEndian>().map_err(eof)?;
                self.resolved(token, self.resolver.resolve_field(token).map(Operand::Field))?
            }
            OperandKind::InlineMethod => {
                let token = cursor.read_u32::<LittleEndian>().map_err(eof)?;
                let method = self
                    .resolver
                    .resolve_method(token)
                    .or_else(|_| self.resolver.resolve_member(token));
                self.resolved(token, method.map(Operand::Method))?
            }
            OperandKind::InlineType => {
                let token = cursor.read_u32::<LittleEndian>().map_err(eof)?;
                self.resolved(token, self.resolver.resolve_type(token).map(Operand::Type))?
            }
            OperandKind::InlineTok => {
                let token = cursor.read_u32::<LittleEndian>().map_err(eof)?;
                match self.resolver.resolve_type(token) {
                    Ok(ty) => Operand::Type(ty),
                    Err(_) => Operand::Unresolved(token),
                }
            }
            OperandKind::InlineSig => {
                Operand::Signature(cursor.read_u32::<LittleEndian>().map_err(eof)?)
            }
        };
        Ok(Some(operand))
    }

    fn resolved(
        &self,
        token: u32,
        result: Result<Operand, ResolveError>,
    ) -> Result<Operand, DecodeError> {
        match result {
            Ok(operand) => Ok(operand),
            Err(_) if self.lenient => Ok(Operand::Unresolved(token)),
            Err(err) => Err(err.into()),
        }
    }
}

fn truncated(offset: usize) -> impl Fn(io::Error) -> DecodeError {
    move |_| DecodeError::Truncated { offset }
}

/// Converts a displacement relative to `base` into an absolute offset.
fn absolute(offset: usize, relative: i64, base: u64) -> Result<u32, DecodeError> {
    let target = base as i64 + relative;
    u32::try_from(target).map_err(|_| DecodeError::BadBranchTarget { offset, target })
}

/// Renders `code` as one `IL_0000: mnemonic operand` line per instruction.
pub fn disassemble(code: &[u8], resolver: &dyn MetadataResolver) -> Result<String, DecodeError> {
    let instructions = Decoder::listing(resolver).decode(code)?;
    Ok(instructions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Signature;

    struct Tokens;

    impl MetadataResolver for Tokens {
        fn resolve_string(&self, token: u32) -> Result<String, ResolveError> {
            match token {
                0x7000_0001 => Ok("Hello, word!".into()),
                _ => Err(ResolveError::UnknownToken(token)),
            }
        }

        fn resolve_field(&self, token: u32) -> Result<FieldRef, ResolveError> {
            Err(ResolveError::UnknownToken(token))
        }

        fn resolve_method(&self, token: u32) -> Result<MethodRef, ResolveError> {
            Err(ResolveError::WrongTokenKind {
                token,
                expected: "method",
            })
        }

        fn resolve_member(&self, token: u32) -> Result<MethodRef, ResolveError> {
            match token {
                0x0A00_0002 => Ok(MethodRef {
                    declaring_type: TypeRef::framework("System", "Object"),
                    name: ".ctor".into(),
                    signature: Signature {
                        is_static: false,
                        parameters: vec![],
                        return_type: TypeRef::void(),
                    },
                }),
                _ => Err(ResolveError::UnknownToken(token)),
            }
        }

        fn resolve_type(&self, token: u32) -> Result<TypeRef, ResolveError> {
            Err(ResolveError::UnknownToken(token))
        }
    }

    #[test]
    fn decodes_assign_numbers() {
        let code = [
            0x00, // nop
            0x1F, 0xF6, // ldc.i4.s -10
            0x20, 0xF0, 0xD8, 0xFF, 0xFF, // ldc.i4 -10000
            0x21, 0x00, 0x1C, 0xF4, 0xAB, 0xFD, 0xFF, 0xFF, 0xFF, // ldc.i8 -10000000000
            0x2A, // ret
        ];
        let listing = disassemble(&code, &NoMetadata).unwrap();
        assert_eq!(
            listing,
            "IL_0000: nop\n\
             IL_0001: ldc.i4.s -10\n\
             IL_0003: ldc.i4 -10000\n\
             IL_0008: ldc.i8 -10000000000\n\
             IL_0017: ret"
        );
    }

    #[test]
    fn branch_targets_are_absolute() {
        // IL_0000: br.s +2 ; IL_0002: nop ; IL_0003: nop ; IL_0004: ret
        let code = [0x2B, 0x02, 0x00, 0x00, 0x2A];
        let instructions = Decoder::new(&NoMetadata).decode(&code).unwrap();
        assert_eq!(instructions[0].operand, Some(Operand::Target(4)));

        // backwards: IL_0000: nop ; IL_0001: br -6 (to 0)
        let code = [0x00, 0x38, 0xFA, 0xFF, 0xFF, 0xFF];
        let instructions = Decoder::new(&NoMetadata).decode(&code).unwrap();
        assert_eq!(instructions[1].operand, Some(Operand::Target(0)));
    }

    #[test]
    fn switch_targets_follow_the_table() {
        // switch (2 cases: +0, +1), then nop, ret
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x2A,
        ];
        let instructions = Decoder::new(&NoMetadata).decode(&code).unwrap();
        assert_eq!(instructions[0].operand, Some(Operand::Switch(vec![13, 14])));
        assert_eq!(instructions[1].offset, 13);
    }

    #[test]
    fn extended_opcodes() {
        let code = [0xFE, 0x01, 0xFE, 0x0C, 0x05, 0x01];
        let instructions = Decoder::new(&NoMetadata).decode(&code).unwrap();
        assert_eq!(instructions[0].opcode, OPCode::Ceq);
        assert_eq!(instructions[1].opcode, OPCode::Ldloc);
        assert_eq!(instructions[1].operand, Some(Operand::Variable(0x0105)));
    }

    #[test]
    fn resolves_strings_and_falls_back_to_members() {
        let code = [0x72, 0x01, 0x00, 0x00, 0x70, 0x73, 0x02, 0x00, 0x00, 0x0A];
        let instructions = Decoder::new(&Tokens).decode(&code).unwrap();
        assert_eq!(
            instructions[0].operand,
            Some(Operand::String("Hello, word!".into()))
        );
        assert_eq!(
            instructions[1].to_string(),
            "IL_0005: newobj instance System.Void System.Object::.ctor()"
        );
    }

    #[test]
    fn strict_mode_rejects_unknown_tokens() {
        let code = [0x7B, 0x01, 0x00, 0x00, 0x04];
        let err = Decoder::new(&Tokens).decode(&code).unwrap_err();
        assert!(matches!(err, DecodeError::Resolve(ResolveError::UnknownToken(0x0400_0001))));
        let listing = disassemble(&code, &Tokens).unwrap();
        assert_eq!(listing, "IL_0000: ldfld not supported");
    }

    #[test]
    fn reports_bad_streams() {
        assert!(matches!(
            Decoder::new(&NoMetadata).decode(&[0x24]),
            Err(DecodeError::UnknownOpcode { offset: 0, value: 0x24 })
        ));
        assert!(matches!(
            Decoder::new(&NoMetadata).decode(&[0xFE, 0xFF]),
            Err(DecodeError::UnknownExtendedOpcode { offset: 0, value: 0xFF })
        ));
        assert!(matches!(
            Decoder::new(&NoMetadata).decode(&[0x00, 0x20, 0x01]),
            Err(DecodeError::Truncated { offset: 2 })
        ));
        assert!(matches!(
            Decoder::new(&NoMetadata).decode(&[0x2B, 0x80]),
            Err(DecodeError::BadBranchTarget { .. })
        ));
    }
}
