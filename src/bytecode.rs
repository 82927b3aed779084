//! CIL opcode definitions.
//!
//! Every opcode defined by ECMA-335 Partition III is listed here, each with
//! its encoded value, mnemonic, operand kind and flow control class, so that
//! any method body can be decoded even when only a subset of the opcodes is
//! executable.
use std::fmt;
use std::sync::LazyLock;

/// Byte value announcing a two-byte opcode.
pub const EXTENDED_PREFIX: u8 = 0xFE;

/// Encoding shape of the bytes following an opcode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperandKind {
    InlineNone,
    /// 1 byte local or argument index.
    ShortInlineVar,
    /// 2 byte local or argument index.
    InlineVar,
    /// 1 byte signed integer.
    ShortInlineI,
    InlineI,
    InlineI8,
    ShortInlineR,
    InlineR,
    /// 1 byte signed branch displacement.
    ShortInlineBrTarget,
    /// 4 byte signed branch displacement.
    InlineBrTarget,
    /// 4 byte count followed by that many 4 byte displacements.
    InlineSwitch,
    InlineString,
    InlineField,
    InlineMethod,
    InlineType,
    InlineTok,
    InlineSig,
}

impl OperandKind {
    /// Returns the fixed operand width in bytes, `None` for switch tables.
    pub const fn width(self) -> Option<usize> {
        match self {
            Self::InlineNone => Some(0),
            Self::ShortInlineVar | Self::ShortInlineI | Self::ShortInlineBrTarget => {
                Some(1)
            }
            Self::InlineVar => Some(2),
            Self::InlineI
            | Self::ShortInlineR
            | Self::InlineBrTarget
            | Self::InlineString
            | Self::InlineField
            | Self::InlineMethod
            | Self::InlineType
            | Self::InlineTok
            | Self::InlineSig => Some(4),
            Self::InlineI8 | Self::InlineR => Some(8),
            Self::InlineSwitch => None,
        }
    }
}

/// How an instruction affects the program counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlowControl {
    Next,
    Branch,
    CondBranch,
    Call,
    Return,
    Throw,
    Break,
    Meta,
}

macro_rules! opcodes {
    ($($variant:ident => ($mnemonic:literal, $value:literal, $kind:ident, $flow:ident),)*) => {
        /// Closed set of CIL opcodes.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum OPCode {
            $($variant,)*
        }

        impl OPCode {
            /// Every known opcode, in encoding order.
            pub const ALL: &'static [OPCode] = &[$(OPCode::$variant,)*];

            /// Textual mnemonic, e.g. `ldc.i4.s`.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$variant => $mnemonic,)*
                }
            }

            /// Encoded value; two-byte opcodes carry the `0xFE` prefix in the
            /// high byte.
            pub const fn value(self) -> u16 {
                match self {
                    $(Self::$variant => $value,)*
                }
            }

            pub const fn operand_kind(self) -> OperandKind {
                match self {
                    $(Self::$variant => OperandKind::$kind,)*
                }
            }

            pub const fn flow_control(self) -> FlowControl {
                match self {
                    $(Self::$variant => FlowControl::$flow,)*
                }
            }
        }
    };
}

opcodes! {
    Nop => ("nop", 0x00, InlineNone, Next),
    Break => ("break", 0x01, InlineNone, Break),
    Ldarg0 => ("ldarg.0", 0x02, InlineNone, Next),
    Ldarg1 => ("ldarg.1", 0x03, InlineNone, Next),
    Ldarg2 => ("ldarg.2", 0x04, InlineNone, Next),
    Ldarg3 => ("ldarg.3", 0x05, InlineNone, Next),
    Ldloc0 => ("ldloc.0", 0x06, InlineNone, Next),
    Ldloc1 => ("ldloc.1", 0x07, InlineNone, Next),
    Ldloc2 => ("ldloc.2", 0x08, InlineNone, Next),
    Ldloc3 => ("ldloc.3", 0x09, InlineNone, Next),
    Stloc0 => ("stloc.0", 0x0A, InlineNone, Next),
    Stloc1 => ("stloc.1", 0x0B, InlineNone, Next),
    Stloc2 => ("stloc.2", 0x0C, InlineNone, Next),
    Stloc3 => ("stloc.3", 0x0D, InlineNone, Next),
    LdargS => ("ldarg.s", 0x0E, ShortInlineVar, Next),
    LdargaS => ("ldarga.s", 0x0F, ShortInlineVar, Next),
    StargS => ("starg.s", 0x10, ShortInlineVar, Next),
    LdlocS => ("ldloc.s", 0x11, ShortInlineVar, Next),
    LdlocaS => ("ldloca.s", 0x12, ShortInlineVar, Next),
    StlocS => ("stloc.s", 0x13, ShortInlineVar, Next),
    Ldnull => ("ldnull", 0x14, InlineNone, Next),
    LdcI4M1 => ("ldc.i4.m1", 0x15, InlineNone, Next),
    LdcI40 => ("ldc.i4.0", 0x16, InlineNone, Next),
    LdcI41 => ("ldc.i4.1", 0x17, InlineNone, Next),
    LdcI42 => ("ldc.i4.2", 0x18, InlineNone, Next),
    LdcI43 => ("ldc.i4.3", 0x19, InlineNone, Next),
    LdcI44 => ("ldc.i4.4", 0x1A, InlineNone, Next),
    LdcI45 => ("ldc.i4.5", 0x1B, InlineNone, Next),
    LdcI46 => ("ldc.i4.6", 0x1C, InlineNone, Next),
    LdcI47 => ("ldc.i4.7", 0x1D, InlineNone, Next),
    LdcI48 => ("ldc.i4.8", 0x1E, InlineNone, Next),
    LdcI4S => ("ldc.i4.s", 0x1F, ShortInlineI, Next),
    LdcI4 => ("ldc.i4", 0x20, InlineI, Next),
    LdcI8 => ("ldc.i8", 0x21, InlineI8, Next),
    LdcR4 => ("ldc.r4", 0x22, ShortInlineR, Next),
    LdcR8 => ("ldc.r8", 0x23, InlineR, Next),
    Dup => ("dup", 0x25, InlineNone, Next),
    Pop => ("pop", 0x26, InlineNone, Next),
    Jmp => ("jmp", 0x27, InlineMethod, Call),
    Call => ("call", 0x28, InlineMethod, Call),
    Calli => ("calli", 0x29, InlineSig, Call),
    Ret => ("ret", 0x2A, InlineNone, Return),
    BrS => ("br.s", 0x2B, ShortInlineBrTarget, Branch),
    BrfalseS => ("brfalse.s", 0x2C, ShortInlineBrTarget, CondBranch),
    BrtrueS => ("brtrue.s", 0x2D, ShortInlineBrTarget, CondBranch),
    BeqS => ("beq.s", 0x2E, ShortInlineBrTarget, CondBranch),
    BgeS => ("bge.s", 0x2F, ShortInlineBrTarget, CondBranch),
    BgtS => ("bgt.s", 0x30, ShortInlineBrTarget, CondBranch),
    BleS => ("ble.s", 0x31, ShortInlineBrTarget, CondBranch),
    BltS => ("blt.s", 0x32, ShortInlineBrTarget, CondBranch),
    BneUnS => ("bne.un.s", 0x33, ShortInlineBrTarget, CondBranch),
    BgeUnS => ("bge.un.s", 0x34, ShortInlineBrTarget, CondBranch),
    BgtUnS => ("bgt.un.s", 0x35, ShortInlineBrTarget, CondBranch),
    BleUnS => ("ble.un.s", 0x36, ShortInlineBrTarget, CondBranch),
    BltUnS => ("blt.un.s", 0x37, ShortInlineBrTarget, CondBranch),
    Br => ("br", 0x38, InlineBrTarget, Branch),
    Brfalse => ("brfalse", 0x39, InlineBrTarget, CondBranch),
    Brtrue => ("brtrue", 0x3A, InlineBrTarget, CondBranch),
    Beq => ("beq", 0x3B, InlineBrTarget, CondBranch),
    Bge => ("bge", 0x3C, InlineBrTarget, CondBranch),
    Bgt => ("bgt", 0x3D, InlineBrTarget, CondBranch),
    Ble => ("ble", 0x3E, InlineBrTarget, CondBranch),
    Blt => ("blt", 0x3F, InlineBrTarget, CondBranch),
    BneUn => ("bne.un", 0x40, InlineBrTarget, CondBranch),
    BgeUn => ("bge.un", 0x41, InlineBrTarget, CondBranch),
    BgtUn => ("bgt.un", 0x42, InlineBrTarget, CondBranch),
    BleUn => ("ble.un", 0x43, InlineBrTarget, CondBranch),
    BltUn => ("blt.un", 0x44, InlineBrTarget, CondBranch),
    Switch => ("switch", 0x45, InlineSwitch, CondBranch),
    LdindI1 => ("ldind.i1", 0x46, InlineNone, Next),
    LdindU1 => ("ldind.u1", 0x47, InlineNone, Next),
    LdindI2 => ("ldind.i2", 0x48, InlineNone, Next),
    LdindU2 => ("ldind.u2", 0x49, InlineNone, Next),
    LdindI4 => ("ldind.i4", 0x4A, InlineNone, Next),
    LdindU4 => ("ldind.u4", 0x4B, InlineNone, Next),
    LdindI8 => ("ldind.i8", 0x4C, InlineNone, Next),
    LdindI => ("ldind.i", 0x4D, InlineNone, Next),
    LdindR4 => ("ldind.r4", 0x4E, InlineNone, Next),
    LdindR8 => ("ldind.r8", 0x4F, InlineNone, Next),
    LdindRef => ("ldind.ref", 0x50, InlineNone, Next),
    StindRef => ("stind.ref", 0x51, InlineNone, Next),
    StindI1 => ("stind.i1", 0x52, InlineNone, Next),
    StindI2 => ("stind.i2", 0x53, InlineNone, Next),
    StindI4 => ("stind.i4", 0x54, InlineNone, Next),
    StindI8 => ("stind.i8", 0x55, InlineNone, Next),
    StindR4 => ("stind.r4", 0x56, InlineNone, Next),
    StindR8 => ("stind.r8", 0x57, InlineNone, Next),
    Add => ("add", 0x58, InlineNone, Next),
    Sub => ("sub", 0x59, InlineNone, Next),
    Mul => ("mul", 0x5A, InlineNone, Next),
    Div => ("div", 0x5B, InlineNone, Next),
    DivUn => ("div.un", 0x5C, InlineNone, Next),
    Rem => ("rem", 0x5D, InlineNone, Next),
    RemUn => ("rem.un", 0x5E, InlineNone, Next),
    And => ("and", 0x5F, InlineNone, Next),
    Or => ("or", 0x60, InlineNone, Next),
    Xor => ("xor", 0x61, InlineNone, Next),
    Shl => ("shl", 0x62, InlineNone, Next),
    Shr => ("shr", 0x63, InlineNone, Next),
    ShrUn => ("shr.un", 0x64, InlineNone, Next),
    Neg => ("neg", 0x65, InlineNone, Next),
    Not => ("not", 0x66, InlineNone, Next),
    ConvI1 => ("conv.i1", 0x67, InlineNone, Next),
    ConvI2 => ("conv.i2", 0x68, InlineNone, Next),
    ConvI4 => ("conv.i4", 0x69, InlineNone, Next),
    ConvI8 => ("conv.i8", 0x6A, InlineNone, Next),
    ConvR4 => ("conv.r4", 0x6B, InlineNone, Next),
    ConvR8 => ("conv.r8", 0x6C, InlineNone, Next),
    ConvU4 => ("conv.u4", 0x6D, InlineNone, Next),
    ConvU8 => ("conv.u8", 0x6E, InlineNone, Next),
    Callvirt => ("callvirt", 0x6F, InlineMethod, Call),
    Cpobj => ("cpobj", 0x70, InlineType, Next),
    Ldobj => ("ldobj", 0x71, InlineType, Next),
    Ldstr => ("ldstr", 0x72, InlineString, Next),
    Newobj => ("newobj", 0x73, InlineMethod, Call),
    Castclass => ("castclass", 0x74, InlineType, Next),
    Isinst => ("isinst", 0x75, InlineType, Next),
    ConvRUn => ("conv.r.un", 0x76, InlineNone, Next),
    Unbox => ("unbox", 0x79, InlineType, Next),
    Throw => ("throw", 0x7A, InlineNone, Throw),
    Ldfld => ("ldfld", 0x7B, InlineField, Next),
    Ldflda => ("ldflda", 0x7C, InlineField, Next),
    Stfld => ("stfld", 0x7D, InlineField, Next),
    Ldsfld => ("ldsfld", 0x7E, InlineField, Next),
    Ldsflda => ("ldsflda", 0x7F, InlineField, Next),
    Stsfld => ("stsfld", 0x80, InlineField, Next),
    Stobj => ("stobj", 0x81, InlineType, Next),
    ConvOvfI1Un => ("conv.ovf.i1.un", 0x82, InlineNone, Next),
    ConvOvfI2Un => ("conv.ovf.i2.un", 0x83, InlineNone, Next),
    ConvOvfI4Un => ("conv.ovf.i4.un", 0x84, InlineNone, Next),
    ConvOvfI8Un => ("conv.ovf.i8.un", 0x85, InlineNone, Next),
    ConvOvfU1Un => ("conv.ovf.u1.un", 0x86, InlineNone, Next),
    ConvOvfU2Un => ("conv.ovf.u2.un", 0x87, InlineNone, Next),
    ConvOvfU4Un => ("conv.ovf.u4.un", 0x88, InlineNone, Next),
    ConvOvfU8Un => ("conv.ovf.u8.un", 0x89, InlineNone, Next),
    ConvOvfIUn => ("conv.ovf.i.un", 0x8A, InlineNone, Next),
    ConvOvfUUn => ("conv.ovf.u.un", 0x8B, InlineNone, Next),
    Box => ("box", 0x8C, InlineType, Next),
    Newarr => ("newarr", 0x8D, InlineType, Next),
    Ldlen => ("ldlen", 0x8E, InlineNone, Next),
    Ldelema => ("ldelema", 0x8F, InlineType, Next),
    LdelemI1 => ("ldelem.i1", 0x90, InlineNone, Next),
    LdelemU1 => ("ldelem.u1", 0x91, InlineNone, Next),
    LdelemI2 => ("ldelem.i2", 0x92, InlineNone, Next),
    LdelemU2 => ("ldelem.u2", 0x93, InlineNone, Next),
    LdelemI4 => ("ldelem.i4", 0x94, InlineNone, Next),
    LdelemU4 => ("ldelem.u4", 0x95, InlineNone, Next),
    LdelemI8 => ("ldelem.i8", 0x96, InlineNone, Next),
    LdelemI => ("ldelem.i", 0x97, InlineNone, Next),
    LdelemR4 => ("ldelem.r4", 0x98, InlineNone, Next),
    LdelemR8 => ("ldelem.r8", 0x99, InlineNone, Next),
    LdelemRef => ("ldelem.ref", 0x9A, InlineNone, Next),
    StelemI => ("stelem.i", 0x9B, InlineNone, Next),
    StelemI1 => ("stelem.i1", 0x9C, InlineNone, Next),
    StelemI2 => ("stelem.i2", 0x9D, InlineNone, Next),
    StelemI4 => ("stelem.i4", 0x9E, InlineNone, Next),
    StelemI8 => ("stelem.i8", 0x9F, InlineNone, Next),
    StelemR4 => ("stelem.r4", 0xA0, InlineNone, Next),
    StelemR8 => ("stelem.r8", 0xA1, InlineNone, Next),
    StelemRef => ("stelem.ref", 0xA2, InlineNone, Next),
    Ldelem => ("ldelem", 0xA3, InlineType, Next),
    Stelem => ("stelem", 0xA4, InlineType, Next),
    UnboxAny => ("unbox.any", 0xA5, InlineType, Next),
    ConvOvfI1 => ("conv.ovf.i1", 0xB3, InlineNone, Next),
    ConvOvfU1 => ("conv.ovf.u1", 0xB4, InlineNone, Next),
    ConvOvfI2 => ("conv.ovf.i2", 0xB5, InlineNone, Next),
    ConvOvfU2 => ("conv.ovf.u2", 0xB6, InlineNone, Next),
    ConvOvfI4 => ("conv.ovf.i4", 0xB7, InlineNone, Next),
    ConvOvfU4 => ("conv.ovf.u4", 0xB8, InlineNone, Next),
    ConvOvfI8 => ("conv.ovf.i8", 0xB9, InlineNone, Next),
    ConvOvfU8 => ("conv.ovf.u8", 0xBA, InlineNone, Next),
    Refanyval => ("refanyval", 0xC2, InlineType, Next),
    Ckfinite => ("ckfinite", 0xC3, InlineNone, Next),
    Mkrefany => ("mkrefany", 0xC6, InlineType, Next),
    Ldtoken => ("ldtoken", 0xD0, InlineTok, Next),
    ConvU2 => ("conv.u2", 0xD1, InlineNone, Next),
    ConvU1 => ("conv.u1", 0xD2, InlineNone, Next),
    ConvI => ("conv.i", 0xD3, InlineNone, Next),
    ConvOvfI => ("conv.ovf.i", 0xD4, InlineNone, Next),
    ConvOvfU => ("conv.ovf.u", 0xD5, InlineNone, Next),
    AddOvf => ("add.ovf", 0xD6, InlineNone, Next),
    AddOvfUn => ("add.ovf.un", 0xD7, InlineNone, Next),
    MulOvf => ("mul.ovf", 0xD8, InlineNone, Next),
    MulOvfUn => ("mul.ovf.un", 0xD9, InlineNone, Next),
    SubOvf => ("sub.ovf", 0xDA, InlineNone, Next),
    SubOvfUn => ("sub.ovf.un", 0xDB, InlineNone, Next),
    Endfinally => ("endfinally", 0xDC, InlineNone, Return),
    Leave => ("leave", 0xDD, InlineBrTarget, Branch),
    LeaveS => ("leave.s", 0xDE, ShortInlineBrTarget, Branch),
    StindI => ("stind.i", 0xDF, InlineNone, Next),
    ConvU => ("conv.u", 0xE0, InlineNone, Next),
    Arglist => ("arglist", 0xFE00, InlineNone, Next),
    Ceq => ("ceq", 0xFE01, InlineNone, Next),
    Cgt => ("cgt", 0xFE02, InlineNone, Next),
    CgtUn => ("cgt.un", 0xFE03, InlineNone, Next),
    Clt => ("clt", 0xFE04, InlineNone, Next),
    CltUn => ("clt.un", 0xFE05, InlineNone, Next),
    Ldftn => ("ldftn", 0xFE06, InlineMethod, Next),
    Ldvirtftn => ("ldvirtftn", 0xFE07, InlineMethod, Next),
    Ldarg => ("ldarg", 0xFE09, InlineVar, Next),
    Ldarga => ("ldarga", 0xFE0A, InlineVar, Next),
    Starg => ("starg", 0xFE0B, InlineVar, Next),
    Ldloc => ("ldloc", 0xFE0C, InlineVar, Next),
    Ldloca => ("ldloca", 0xFE0D, InlineVar, Next),
    Stloc => ("stloc", 0xFE0E, InlineVar, Next),
    Localloc => ("localloc", 0xFE0F, InlineNone, Next),
    Endfilter => ("endfilter", 0xFE11, InlineNone, Return),
    Unaligned => ("unaligned.", 0xFE12, ShortInlineI, Meta),
    Volatile => ("volatile.", 0xFE13, InlineNone, Meta),
    Tail => ("tail.", 0xFE14, InlineNone, Meta),
    Initobj => ("initobj", 0xFE15, InlineType, Next),
    Constrained => ("constrained.", 0xFE16, InlineType, Meta),
    Cpblk => ("cpblk", 0xFE17, InlineNone, Next),
    Initblk => ("initblk", 0xFE18, InlineNone, Next),
    No => ("no.", 0xFE19, ShortInlineI, Meta),
    Rethrow => ("rethrow", 0xFE1A, InlineNone, Throw),
    Sizeof => ("sizeof", 0xFE1C, InlineType, Next),
    Refanytype => ("refanytype", 0xFE1D, InlineNone, Next),
    Readonly => ("readonly.", 0xFE1E, InlineNone, Meta),
}

type OpcodeTable = [Option<OPCode>; 256];

/// Opcodes encoded in a single byte, indexed by that byte.
static SINGLE_BYTE: LazyLock<OpcodeTable> = LazyLock::new(|| build_table(false));

/// Opcodes following the `0xFE` prefix, indexed by their second byte.
static DOUBLE_BYTE: LazyLock<OpcodeTable> = LazyLock::new(|| build_table(true));

fn build_table(extended: bool) -> OpcodeTable {
    let mut table = [None; 256];
    for &op in OPCode::ALL {
        if op.is_extended() == extended {
            table[(op.value() & 0xFF) as usize] = Some(op);
        }
    }
    table
}

impl OPCode {
    /// Looks up a single-byte opcode.
    pub fn from_byte(value: u8) -> Option<Self> {
        SINGLE_BYTE[value as usize]
    }

    /// Looks up the opcode encoded as `0xFE value`.
    pub fn from_extended_byte(value: u8) -> Option<Self> {
        DOUBLE_BYTE[value as usize]
    }

    /// Looks up an opcode by its mnemonic.
    pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        OPCode::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic() == mnemonic)
    }

    /// Whether the opcode is encoded with the `0xFE` prefix.
    pub const fn is_extended(self) -> bool {
        self.value() > 0xFF
    }

    /// Encoded size of the opcode itself, without its operand.
    pub const fn size(self) -> usize {
        if self.is_extended() {
            2
        } else {
            1
        }
    }

    /// Raw bytes of the opcode.
    pub fn encode(self) -> Vec<u8> {
        if self.is_extended() {
            vec![EXTENDED_PREFIX, (self.value() & 0xFF) as u8]
        } else {
            vec![self.value() as u8]
        }
    }
}

impl fmt::Display for OPCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tables_cover_every_opcode_once() {
        let mut seen = HashSet::new();
        for &op in OPCode::ALL {
            assert!(seen.insert(op.value()), "duplicate encoding for {op}");
            let looked_up = if op.is_extended() {
                OPCode::from_extended_byte((op.value() & 0xFF) as u8)
            } else {
                OPCode::from_byte(op.value() as u8)
            };
            assert_eq!(looked_up, Some(op));
        }
        // 0xFE is the prefix, never an opcode of its own.
        assert_eq!(OPCode::from_byte(EXTENDED_PREFIX), None);
    }

    #[test]
    fn classifies_flow_and_operands() {
        assert_eq!(OPCode::Ret.flow_control(), FlowControl::Return);
        assert_eq!(OPCode::BrS.flow_control(), FlowControl::Branch);
        assert_eq!(OPCode::Brfalse.flow_control(), FlowControl::CondBranch);
        assert_eq!(OPCode::Newobj.flow_control(), FlowControl::Call);
        assert_eq!(OPCode::Constrained.flow_control(), FlowControl::Meta);
        assert_eq!(OPCode::LdcI4S.operand_kind().width(), Some(1));
        assert_eq!(OPCode::LdcI8.operand_kind().width(), Some(8));
        assert_eq!(OPCode::Switch.operand_kind().width(), None);
        assert_eq!(OPCode::Ceq.encode(), vec![0xFE, 0x01]);
    }

    #[test]
    fn mnemonic_lookup() {
        assert_eq!(OPCode::from_mnemonic("stloc.s"), Some(OPCode::StlocS));
        assert_eq!(OPCode::from_mnemonic("clt.un"), Some(OPCode::CltUn));
        assert_eq!(OPCode::from_mnemonic("frobnicate"), None);
    }
}
