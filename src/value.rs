//! Evaluation stack values and their arithmetic.
use std::fmt;

use crate::error::RuntimeError;
use crate::heap::Handle;

type Result<T> = std::result::Result<T, RuntimeError>;

/// A dynamically typed evaluation stack, local or argument value.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Ref(Handle),
    #[default]
    Null,
}

impl Value {
    /// Name of the value's stack type, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Ref(_) => "reference",
            Self::Null => "null",
        }
    }

    /// The `false` sentinel of each type: zero or null.
    pub fn is_false(&self) -> bool {
        match *self {
            Self::Int32(v) => v == 0,
            Self::Int64(v) => v == 0,
            Self::Float64(v) => v == 0.0,
            Self::Ref(_) => false,
            Self::Null => true,
        }
    }

    /// The `true` sentinel: exactly one, or a non-null reference. Any other
    /// number is neither true nor false to `brtrue`/`brfalse`.
    pub fn is_true(&self) -> bool {
        match *self {
            Self::Int32(v) => v == 1,
            Self::Int64(v) => v == 1,
            Self::Float64(v) => v == 1.0,
            Self::Ref(_) => true,
            Self::Null => false,
        }
    }

    pub fn from_bool(b: bool) -> Self {
        Self::Int32(b as i32)
    }

    pub fn as_i32(&self) -> Result<i32> {
        match *self {
            Self::Int32(v) => Ok(v),
            other => Err(mismatch("int32", other)),
        }
    }

    /// Integer value usable as an index or count.
    pub fn as_index(&self) -> Result<i64> {
        match *self {
            Self::Int32(v) => Ok(v as i64),
            Self::Int64(v) => Ok(v),
            other => Err(mismatch("integer", other)),
        }
    }

    pub fn as_handle(&self) -> Result<Handle> {
        match *self {
            Self::Ref(handle) => Ok(handle),
            other => Err(mismatch("reference", other)),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
        use Value::*;
        match (lhs, rhs) {
            (Int32(a), Int32(b)) => op.int32(a, b),
            (Int32(_) | Int64(_), Int32(_) | Int64(_)) if !op.is_shift() => {
                op.int64(widen(lhs)?, widen(rhs)?)
            }
            (Int64(a), Int32(b)) => op.int64(a, b as i64),
            (Float64(_), Float64(_) | Int32(_) | Int64(_))
            | (Int32(_) | Int64(_), Float64(_)) => op.float64(to_f64(lhs)?, to_f64(rhs)?),
            _ => Err(RuntimeError::TypeMismatch {
                expected: "numeric operands",
                found: format!("{} {} {}", lhs.kind(), op.name(), rhs.kind()),
            }),
        }
    }

    pub fn compare(op: CompareOp, lhs: Value, rhs: Value) -> Result<bool> {
        use Value::*;
        Ok(match (lhs, rhs) {
            (Int32(a), Int32(b)) if op.unsigned() => op.ordering((a as u32).cmp(&(b as u32))),
            (Int32(a), Int32(b)) => op.ordering(a.cmp(&b)),
            (Int32(_) | Int64(_), Int32(_) | Int64(_)) => {
                let (a, b) = (widen(lhs)?, widen(rhs)?);
                if op.unsigned() {
                    op.ordering((a as u64).cmp(&(b as u64)))
                } else {
                    op.ordering(a.cmp(&b))
                }
            }
            (Float64(_) | Int32(_) | Int64(_), Float64(_) | Int32(_) | Int64(_)) => {
                let (a, b) = (to_f64(lhs)?, to_f64(rhs)?);
                match a.partial_cmp(&b) {
                    Some(ordering) => op.ordering(ordering),
                    // Unordered operands: only the `.un` forms and `!=` hold.
                    None => op.unsigned() || op == CompareOp::Ne,
                }
            }
            (Ref(a), Ref(b)) => match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne | CompareOp::GtUn => a != b,
                _ => false,
            },
            (Ref(_), Null) => matches!(op, CompareOp::Ne | CompareOp::GtUn),
            (Null, Ref(_)) => matches!(op, CompareOp::Ne | CompareOp::LtUn),
            (Null, Null) => matches!(op, CompareOp::Eq | CompareOp::GeUn | CompareOp::LeUn),
            _ => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "comparable operands",
                    found: format!("{} and {}", lhs.kind(), rhs.kind()),
                })
            }
        })
    }

    pub fn negate(self) -> Result<Value> {
        match self {
            Self::Int32(v) => Ok(Self::Int32(v.wrapping_neg())),
            Self::Int64(v) => Ok(Self::Int64(v.wrapping_neg())),
            Self::Float64(v) => Ok(Self::Float64(-v)),
            other => Err(mismatch("numeric", other)),
        }
    }

    pub fn not(self) -> Result<Value> {
        match self {
            Self::Int32(v) => Ok(Self::Int32(!v)),
            Self::Int64(v) => Ok(Self::Int64(!v)),
            other => Err(mismatch("integer", other)),
        }
    }

    /// Applies a `conv.*` family conversion.
    pub fn convert(self, conv: Conversion) -> Result<Value> {
        match self {
            Self::Int32(_) | Self::Int64(_) | Self::Float64(_) => conv.apply(self),
            other => Err(mismatch("numeric", other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Ref(handle) => write!(f, "{handle}"),
            Self::Null => f.write_str("null"),
        }
    }
}

fn mismatch(expected: &'static str, found: Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        expected,
        found: found.kind().to_string(),
    }
}

fn widen(value: Value) -> Result<i64> {
    value.as_index()
}

fn to_f64(value: Value) -> Result<f64> {
    match value {
        Value::Int32(v) => Ok(v as f64),
        Value::Int64(v) => Ok(v as f64),
        Value::Float64(v) => Ok(v),
        other => Err(mismatch("numeric", other)),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
}

impl BinaryOp {
    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::DivUn => "div.un",
            Self::Rem => "rem",
            Self::RemUn => "rem.un",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::ShrUn => "shr.un",
            Self::AddOvf => "add.ovf",
            Self::AddOvfUn => "add.ovf.un",
            Self::SubOvf => "sub.ovf",
            Self::SubOvfUn => "sub.ovf.un",
            Self::MulOvf => "mul.ovf",
            Self::MulOvfUn => "mul.ovf.un",
        }
    }

    fn is_shift(self) -> bool {
        matches!(self, Self::Shl | Self::Shr | Self::ShrUn)
    }

    fn int32(self, a: i32, b: i32) -> Result<Value> {
        let overflow = || RuntimeError::Overflow(self.name());
        let (ua, ub) = (a as u32, b as u32);
        let v = match self {
            Self::Add => a.wrapping_add(b),
            Self::Sub => a.wrapping_sub(b),
            Self::Mul => a.wrapping_mul(b),
            Self::Div => a.checked_div(b).ok_or_else(|| division_fault(b == 0))?,
            Self::Rem => a.checked_rem(b).ok_or_else(|| division_fault(b == 0))?,
            Self::DivUn => ua.checked_div(ub).ok_or_else(|| division_fault(true))? as i32,
            Self::RemUn => ua.checked_rem(ub).ok_or_else(|| division_fault(true))? as i32,
            Self::And => a & b,
            Self::Or => a | b,
            Self::Xor => a ^ b,
            Self::Shl => a.wrapping_shl(ub),
            Self::Shr => a.wrapping_shr(ub),
            Self::ShrUn => ua.wrapping_shr(ub) as i32,
            Self::AddOvf => a.checked_add(b).ok_or_else(overflow)?,
            Self::SubOvf => a.checked_sub(b).ok_or_else(overflow)?,
            Self::MulOvf => a.checked_mul(b).ok_or_else(overflow)?,
            Self::AddOvfUn => ua.checked_add(ub).ok_or_else(overflow)? as i32,
            Self::SubOvfUn => ua.checked_sub(ub).ok_or_else(overflow)? as i32,
            Self::MulOvfUn => ua.checked_mul(ub).ok_or_else(overflow)? as i32,
        };
        Ok(Value::Int32(v))
    }

    fn int64(self, a: i64, b: i64) -> Result<Value> {
        let overflow = || RuntimeError::Overflow(self.name());
        let (ua, ub) = (a as u64, b as u64);
        let v = match self {
            Self::Add => a.wrapping_add(b),
            Self::Sub => a.wrapping_sub(b),
            Self::Mul => a.wrapping_mul(b),
            Self::Div => a.checked_div(b).ok_or_else(|| division_fault(b == 0))?,
            Self::Rem => a.checked_rem(b).ok_or_else(|| division_fault(b == 0))?,
            Self::DivUn => ua.checked_div(ub).ok_or_else(|| division_fault(true))? as i64,
            Self::RemUn => ua.checked_rem(ub).ok_or_else(|| division_fault(true))? as i64,
            Self::And => a & b,
            Self::Or => a | b,
            Self::Xor => a ^ b,
            Self::Shl => a.wrapping_shl(ub as u32),
            Self::Shr => a.wrapping_shr(ub as u32),
            Self::ShrUn => ua.wrapping_shr(ub as u32) as i64,
            Self::AddOvf => a.checked_add(b).ok_or_else(overflow)?,
            Self::SubOvf => a.checked_sub(b).ok_or_else(overflow)?,
            Self::MulOvf => a.checked_mul(b).ok_or_else(overflow)?,
            Self::AddOvfUn => ua.checked_add(ub).ok_or_else(overflow)? as i64,
            Self::SubOvfUn => ua.checked_sub(ub).ok_or_else(overflow)? as i64,
            Self::MulOvfUn => ua.checked_mul(ub).ok_or_else(overflow)? as i64,
        };
        Ok(Value::Int64(v))
    }

    fn float64(self, a: f64, b: f64) -> Result<Value> {
        let v = match self {
            Self::Add | Self::AddOvf | Self::AddOvfUn => a + b,
            Self::Sub | Self::SubOvf | Self::SubOvfUn => a - b,
            Self::Mul | Self::MulOvf | Self::MulOvfUn => a * b,
            Self::Div | Self::DivUn => a / b,
            Self::Rem | Self::RemUn => a % b,
            _ => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "integer operands",
                    found: format!("float64 {} float64", self.name()),
                })
            }
        };
        Ok(Value::Float64(v))
    }
}

fn division_fault(by_zero: bool) -> RuntimeError {
    if by_zero {
        RuntimeError::ArithmeticFault("division by zero")
    } else {
        RuntimeError::Overflow("div")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    GtUn,
    Ge,
    GeUn,
    Lt,
    LtUn,
    Le,
    LeUn,
}

impl CompareOp {
    fn unsigned(self) -> bool {
        matches!(self, Self::GtUn | Self::GeUn | Self::LtUn | Self::LeUn)
    }

    fn ordering(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Gt | Self::GtUn => ordering == Greater,
            Self::Ge | Self::GeUn => ordering != Less,
            Self::Lt | Self::LtUn => ordering == Less,
            Self::Le | Self::LeUn => ordering != Greater,
        }
    }
}

/// Target of a `conv.*` instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConvTarget {
    I1,
    I2,
    I4,
    I8,
    U1,
    U2,
    U4,
    U8,
    R4,
    R8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub target: ConvTarget,
    /// `conv.ovf.*`: raise on values outside the target range.
    pub checked: bool,
    /// `.un` forms: treat the source as unsigned.
    pub unsigned_source: bool,
}

impl Conversion {
    pub const fn plain(target: ConvTarget) -> Self {
        Self {
            target,
            checked: false,
            unsigned_source: false,
        }
    }

    pub const fn checked(target: ConvTarget, unsigned_source: bool) -> Self {
        Self {
            target,
            checked: true,
            unsigned_source,
        }
    }

    fn apply(self, value: Value) -> Result<Value> {
        if matches!(self.target, ConvTarget::R4 | ConvTarget::R8) {
            let v = match value {
                Value::Int32(v) if self.unsigned_source => v as u32 as f64,
                Value::Int64(v) if self.unsigned_source => v as u64 as f64,
                other => to_f64(other)?,
            };
            let v = if self.target == ConvTarget::R4 { v as f32 as f64 } else { v };
            return Ok(Value::Float64(v));
        }

        // Work in i128 so every source fits before range checks.
        let wide: i128 = match value {
            Value::Int32(v) if self.unsigned_source => v as u32 as i128,
            Value::Int64(v) if self.unsigned_source => v as u64 as i128,
            Value::Int32(v) => v as i128,
            Value::Int64(v) => v as i128,
            Value::Float64(v) => {
                if self.checked && (v.is_nan() || v.is_infinite()) {
                    return Err(RuntimeError::Overflow("conv.ovf"));
                }
                v.trunc() as i128
            }
            other => return Err(mismatch("numeric", other)),
        };
        let (min, max): (i128, i128) = match self.target {
            ConvTarget::I1 => (i8::MIN as i128, i8::MAX as i128),
            ConvTarget::I2 => (i16::MIN as i128, i16::MAX as i128),
            ConvTarget::I4 => (i32::MIN as i128, i32::MAX as i128),
            ConvTarget::I8 => (i64::MIN as i128, i64::MAX as i128),
            ConvTarget::U1 => (0, u8::MAX as i128),
            ConvTarget::U2 => (0, u16::MAX as i128),
            ConvTarget::U4 => (0, u32::MAX as i128),
            ConvTarget::U8 => (0, u64::MAX as i128),
            ConvTarget::R4 | ConvTarget::R8 => unreachable!("handled above"),
        };
        if self.checked && (wide < min || wide > max) {
            return Err(RuntimeError::Overflow("conv.ovf"));
        }
        Ok(match self.target {
            ConvTarget::I1 => Value::Int32(wide as i8 as i32),
            ConvTarget::I2 => Value::Int32(wide as i16 as i32),
            ConvTarget::I4 => Value::Int32(wide as i32),
            ConvTarget::U1 => Value::Int32(wide as u8 as i32),
            ConvTarget::U2 => Value::Int32(wide as u16 as i32),
            ConvTarget::U4 => Value::Int32(wide as u32 as i32),
            ConvTarget::I8 => Value::Int64(wide as i64),
            ConvTarget::U8 => Value::Int64(wide as u64 as i64),
            ConvTarget::R4 | ConvTarget::R8 => unreachable!("handled above"),
        })
    }
}
