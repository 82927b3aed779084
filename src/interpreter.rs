//! Interpreter for CIL bytecode: the dispatch loop and call machinery that
//! runs method bodies against a [`Runtime`].
//!
//! One Rust call of [`Runtime::execute`] corresponds to one frame on the
//! call stack. Nested calls recurse, so the call stack depth limit is the
//! only bound on recursion.
use std::rc::Rc;

use tracing::{debug, trace};

use crate::bytecode::{FlowControl, OPCode as Op};
use crate::error::{ResolveError, RuntimeError};
use crate::frame::StackFrame;
use crate::heap::{default_value, ArrayData, Heap};
use crate::instruction::{Instruction, MethodBody, Operand};
use crate::metadata::{CallableId, FieldRef, MethodRef, TypeId, TypeRef};
use crate::runtime::{ArgumentOrder, Result, Runtime};
use crate::value::{BinaryOp, CompareOp, ConvTarget, Conversion, Value};

/// Where execution continues after an instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Flow {
    Next,
    Jump(u32),
    Return,
}

/// Repairs an argument list collected receiver slot first.
///
/// Call sites do not agree on push order, so the list is reversed unless its
/// first element already is a reference to an instance of exactly
/// `declaring`. The true calling convention behind this is still open; this
/// function is the single place that encodes the guess.
pub fn correct_argument_order(heap: &Heap, declaring: TypeId, arguments: &mut [Value]) {
    let receiver_first = match arguments.first() {
        Some(Value::Ref(handle)) => heap.get(*handle).is_ok_and(|o| o.ty() == declaring),
        _ => false,
    };
    if !receiver_first {
        arguments.reverse();
    }
}

impl Runtime {
    /// Executes `callable` on behalf of the running frame: its arguments
    /// are popped from that frame's evaluation stack and its return value,
    /// if any, is pushed back onto it. Without a running frame the callable
    /// must take no arguments and its return value is handed to the caller.
    pub fn execute(&mut self, callable: CallableId) -> Result<Option<Value>> {
        let arguments = self.collect_arguments(callable)?;
        let value = self.invoke(callable, arguments)?;
        match (value, self.calls.top_mut()) {
            (Some(value), Some(frame)) => {
                frame.push(value);
                Ok(None)
            }
            (value, _) => Ok(value),
        }
    }

    /// Calls `callable` with explicit arguments, receiver first, and
    /// returns its return value.
    pub fn call(&mut self, callable: CallableId, arguments: Vec<Value>) -> Result<Option<Value>> {
        self.invoke(callable, arguments)
    }

    fn collect_arguments(&mut self, id: CallableId) -> Result<Vec<Value>> {
        let callable = self.catalog.callable(id);
        let has_receiver = !callable.is_static;
        let count = callable.parameter_types.len() + usize::from(has_receiver);
        let declaring = callable.declaring_type;

        let Some(frame) = self.calls.top_mut() else {
            return match count {
                0 => Ok(Vec::new()),
                _ => Err(RuntimeError::StackUnderflow {
                    method: "<host>".to_string(),
                }),
            };
        };
        if frame.stack.len() < count {
            return Err(RuntimeError::StackUnderflow {
                method: self.catalog.callable_name(frame.callable),
            });
        }
        let at = frame.stack.len() - count;
        if self.options.argument_order == ArgumentOrder::Strict {
            return Ok(frame.stack.split_off(at));
        }

        // Receiver slot first, then one value per parameter.
        let mut arguments = frame.stack.split_off(at);
        arguments.reverse();
        if !has_receiver {
            arguments.reverse();
        } else if count > 1 {
            correct_argument_order(&self.heap, declaring, &mut arguments);
        }
        Ok(arguments)
    }

    /// Pushes a frame for `id`, runs it, pops it and returns its value.
    fn invoke(&mut self, id: CallableId, arguments: Vec<Value>) -> Result<Option<Value>> {
        let caller = self.calls.top().map(|f| f.callable);
        self.calls
            .push(StackFrame::new(caller, id, arguments, self.options.locals))?;
        debug!(method = %self.catalog.callable_name(id), depth = self.calls.depth(), "enter");

        let outcome = self.run(id);

        let returns_value = self.catalog.callable(id).returns_value();
        let frame = self.calls.pop().ok_or(RuntimeError::StackUnderflow {
            method: "<host>".to_string(),
        })?;
        debug!(method = %self.catalog.callable_name(id), "exit");
        outcome?;
        if !returns_value {
            return Ok(None);
        }
        frame
            .pop()
            .map(Some)
            .ok_or_else(|| RuntimeError::InvalidReturn {
                method: self.catalog.callable_name(id),
            })
    }

    fn run(&mut self, id: CallableId) -> Result<()> {
        let callable = self.catalog.callable(id);
        if !callable.is_native() {
            let body = Rc::clone(&callable.body);
            return self.run_body(&body);
        }
        let type_name = self.catalog.full_name(callable.declaring_type);
        let arity = callable.parameter_types.len();
        let native = self
            .natives
            .lookup(&type_name, callable.name(), arity)
            .ok_or_else(|| ResolveError::NoNative {
                type_name: type_name.clone(),
                member: callable.name().to_string(),
                arity,
            })?;
        debug!(method = %self.catalog.callable_name(id), "native");
        native(self)
    }

    fn run_body(&mut self, body: &MethodBody) -> Result<()> {
        let mut pc = 0;
        while let Some(inst) = body.get(pc) {
            trace!(offset = inst.offset, opcode = %inst.opcode, "dispatch");
            pc = match self.eval(inst)? {
                Flow::Next => pc + 1,
                Flow::Jump(target) => body
                    .index_of(target)
                    .ok_or(RuntimeError::BadBranchTarget(target))?,
                Flow::Return => return Ok(()),
            };
        }
        Ok(())
    }

    /// Evaluates one instruction.
    fn eval(&mut self, inst: &Instruction) -> Result<Flow> {
        match inst.opcode.flow_control() {
            FlowControl::Next => {
                self.next(inst)?;
                Ok(Flow::Next)
            }
            FlowControl::Branch => Ok(Flow::Jump(target(inst)?)),
            FlowControl::CondBranch => self.cond_branch(inst),
            FlowControl::Call => {
                self.call_instruction(inst)?;
                Ok(Flow::Next)
            }
            FlowControl::Return if inst.opcode == Op::Ret => Ok(Flow::Return),
            FlowControl::Return | FlowControl::Throw | FlowControl::Break | FlowControl::Meta => {
                Err(unsupported(inst))
            }
        }
    }

    fn cond_branch(&mut self, inst: &Instruction) -> Result<Flow> {
        let taken = match inst.opcode {
            Op::Brfalse | Op::BrfalseS => self.pop()?.is_false(),
            Op::Brtrue | Op::BrtrueS => self.pop()?.is_true(),
            Op::Switch => {
                let Some(Operand::Switch(targets)) = &inst.operand else {
                    return Err(missing(inst));
                };
                let index = self.pop()?.as_i32()?;
                // The index is unsigned: negative values fall through.
                return Ok(usize::try_from(index)
                    .ok()
                    .and_then(|i| targets.get(i))
                    .map_or(Flow::Next, |&t| Flow::Jump(t)));
            }
            opcode => {
                let op = branch_comparison(opcode).ok_or_else(|| unsupported(inst))?;
                let (a, b) = self.pop2()?;
                Value::compare(op, a, b)?
            }
        };
        if taken {
            Ok(Flow::Jump(target(inst)?))
        } else {
            Ok(Flow::Next)
        }
    }

    fn call_instruction(&mut self, inst: &Instruction) -> Result<()> {
        match inst.opcode {
            Op::Call => {
                let id = self.catalog.resolve_callable(method_operand(inst)?)?;
                self.execute(id)?;
            }
            Op::Callvirt => {
                let id = self.catalog.resolve_callable(method_operand(inst)?)?;
                let id = self.virtual_target(id)?;
                self.execute(id)?;
            }
            Op::Newobj => self.construct(method_operand(inst)?)?,
            // jmp, calli
            _ => return Err(unsupported(inst)),
        }
        Ok(())
    }

    /// Most derived override of `id` for the receiver on the stack.
    fn virtual_target(&self, id: CallableId) -> Result<CallableId> {
        let callable = self.catalog.callable(id);
        if callable.is_static || !callable.is_overridable() {
            return Ok(id);
        }
        let arity = callable.parameter_types.len();
        let receiver = self.calls.top().and_then(|f| f.peek(arity));
        let Some(Value::Ref(handle)) = receiver else {
            return Ok(id);
        };
        let ty = self.heap.get(handle)?.ty();
        Ok(self
            .catalog
            .find_override(ty, callable.name(), arity)
            .unwrap_or(id))
    }

    /// `newobj`: allocates the object, slips its reference beneath the
    /// constructor arguments, runs the constructor and pushes the reference.
    fn construct(&mut self, method: &MethodRef) -> Result<()> {
        let id = self.catalog.resolve_callable(method)?;
        let callable = self.catalog.callable(id);
        let (ty, arity) = (callable.declaring_type, callable.parameter_types.len());
        let handle = self.instantiate(ty)?;
        let frame = self.frame()?;
        let at = frame
            .stack
            .len()
            .checked_sub(arity)
            .ok_or_else(|| RuntimeError::StackUnderflow {
                method: method.to_string(),
            })?;
        frame.stack.insert(at, Value::Ref(handle));
        self.execute(id)?;
        self.push(Value::Ref(handle))
    }

    /// Arithmetic, comparison, conversion and load/store instructions.
    fn next(&mut self, inst: &Instruction) -> Result<()> {
        if let Some(op) = binary_op(inst.opcode) {
            let (a, b) = self.pop2()?;
            return self.push(Value::binary(op, a, b)?);
        }
        if let Some(op) = comparison(inst.opcode) {
            let (a, b) = self.pop2()?;
            return self.push(Value::from_bool(Value::compare(op, a, b)?));
        }
        if let Some(conv) = conversion(inst.opcode) {
            let value = self.pop()?;
            return self.push(value.convert(conv)?);
        }

        match inst.opcode {
            Op::Nop => {}
            Op::Ldarg0 | Op::Ldarg1 | Op::Ldarg2 | Op::Ldarg3 => {
                let index = (inst.opcode.value() - Op::Ldarg0.value()) as usize;
                let value = self.load_argument(index)?;
                self.push(value)?;
            }
            Op::LdargS | Op::Ldarg => {
                let value = self.load_argument(variable(inst)?)?;
                self.push(value)?;
            }
            Op::StargS | Op::Starg => {
                let value = self.pop()?;
                *self.argument_slot(variable(inst)?)? = value;
            }
            Op::Ldloc0 | Op::Ldloc1 | Op::Ldloc2 | Op::Ldloc3 => {
                let index = (inst.opcode.value() - Op::Ldloc0.value()) as usize;
                let value = *self.local_slot(index)?;
                self.push(value)?;
            }
            Op::LdlocS | Op::Ldloc => {
                let value = *self.local_slot(variable(inst)?)?;
                self.push(value)?;
            }
            Op::Stloc0 | Op::Stloc1 | Op::Stloc2 | Op::Stloc3 => {
                let index = (inst.opcode.value() - Op::Stloc0.value()) as usize;
                let value = self.pop()?;
                *self.local_slot(index)? = value;
            }
            Op::StlocS | Op::Stloc => {
                let value = self.pop()?;
                *self.local_slot(variable(inst)?)? = value;
            }
            Op::Ldnull => self.push(Value::Null)?,
            Op::LdcI4M1 => self.push(Value::Int32(-1))?,
            Op::LdcI40
            | Op::LdcI41
            | Op::LdcI42
            | Op::LdcI43
            | Op::LdcI44
            | Op::LdcI45
            | Op::LdcI46
            | Op::LdcI47
            | Op::LdcI48 => {
                let value = (inst.opcode.value() - Op::LdcI40.value()) as i32;
                self.push(Value::Int32(value))?;
            }
            Op::LdcI4S | Op::LdcI4 | Op::LdcI8 | Op::LdcR4 | Op::LdcR8 => {
                let value = match &inst.operand {
                    Some(Operand::Int32(v)) => Value::Int32(*v),
                    Some(Operand::Int64(v)) => Value::Int64(*v),
                    Some(Operand::Float32(v)) => Value::Float64(*v as f64),
                    Some(Operand::Float64(v)) => Value::Float64(*v),
                    _ => return Err(missing(inst)),
                };
                self.push(value)?;
            }
            Op::Dup => {
                let value = self.pop()?;
                self.push(value)?;
                self.push(value)?;
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Neg => {
                let value = self.pop()?;
                self.push(value.negate()?)?;
            }
            Op::Not => {
                let value = self.pop()?;
                self.push(value.not()?)?;
            }
            Op::Ldstr => {
                let Some(Operand::String(text)) = &inst.operand else {
                    return Err(missing(inst));
                };
                let value = self.alloc_string(text)?;
                self.push(value)?;
            }
            Op::Ldfld => {
                let field = field_operand(inst)?;
                let object = self.pop()?.as_handle()?;
                let value = self.field(object, &field.name)?;
                self.push(value)?;
            }
            Op::Stfld => {
                let field = field_operand(inst)?;
                let value = self.pop()?;
                let object = self.pop()?.as_handle()?;
                self.set_field(object, &field.name, value)?;
            }
            Op::Ldsfld => {
                let field = field_operand(inst)?;
                let key = (self.catalog.resolve_type(&field.declaring_type)?, field.name.clone());
                let value = match self.statics.get(&key) {
                    Some(&value) => value,
                    None => default_value(field.field_type.as_ref()),
                };
                self.push(value)?;
            }
            Op::Stsfld => {
                let field = field_operand(inst)?;
                let key = (self.catalog.resolve_type(&field.declaring_type)?, field.name.clone());
                let value = self.pop()?;
                self.statics.insert(key, value);
            }
            Op::Newarr => {
                let element = type_operand(inst)?;
                let length = self.pop()?.as_index()?;
                let length = self.check_array_length(length)?;
                let array = self.alloc_array(ArrayData::for_element(element, length))?;
                self.push(array)?;
            }
            Op::Ldlen => {
                let array = self.pop()?.as_handle()?;
                let length = self.array_mut(array)?.len();
                self.push(Value::Int32(length as i32))?;
            }
            Op::LdelemI1
            | Op::LdelemU1
            | Op::LdelemI2
            | Op::LdelemU2
            | Op::LdelemI4
            | Op::LdelemU4
            | Op::LdelemI8
            | Op::LdelemI
            | Op::LdelemR4
            | Op::LdelemR8
            | Op::LdelemRef
            | Op::Ldelem => {
                let index = self.pop()?.as_index()?;
                let array = self.pop()?.as_handle()?;
                let value = self.array_mut(array)?.get(index)?;
                self.push(value)?;
            }
            Op::StelemI
            | Op::StelemI1
            | Op::StelemI2
            | Op::StelemI4
            | Op::StelemI8
            | Op::StelemR4
            | Op::StelemR8
            | Op::StelemRef
            | Op::Stelem => {
                let value = self.pop()?;
                let index = self.pop()?.as_index()?;
                let array = self.pop()?.as_handle()?;
                self.array_mut(array)?.set(index, value)?;
            }
            // Values carry their own type, so boxing is the identity.
            Op::Box | Op::Unbox | Op::UnboxAny => {}
            Op::Castclass | Op::Isinst => {
                let target = type_operand(inst)?;
                let value = self.pop()?;
                let result = self.cast(value, target, inst.opcode == Op::Isinst)?;
                self.push(result)?;
            }
            _ => return Err(unsupported(inst)),
        }
        Ok(())
    }

    /// `castclass` and `isinst` on a value. References are checked against
    /// the base type chain; other values pass unchanged.
    fn cast(&self, value: Value, target: &TypeRef, null_on_failure: bool) -> Result<Value> {
        let Value::Ref(handle) = value else {
            return Ok(value);
        };
        let from = self.heap.get(handle)?.ty();
        let to = self.catalog.resolve_type(target)?;
        if self.catalog.is_assignable(from, to) {
            Ok(value)
        } else if null_on_failure {
            Ok(Value::Null)
        } else {
            Err(RuntimeError::InvalidCast {
                from: self.catalog.full_name(from),
                to: target.full_name(),
            })
        }
    }

    fn frame(&mut self) -> Result<&mut StackFrame> {
        self.calls.top_mut().ok_or(RuntimeError::StackUnderflow {
            method: "<host>".to_string(),
        })
    }

    fn pop(&mut self) -> Result<Value> {
        let frame = self.calls.top_mut().ok_or(RuntimeError::StackUnderflow {
            method: "<host>".to_string(),
        })?;
        match frame.pop() {
            Some(value) => Ok(value),
            None => Err(RuntimeError::StackUnderflow {
                method: self.catalog.callable_name(frame.callable),
            }),
        }
    }

    /// Pops two operands, returned in push order.
    fn pop2(&mut self) -> Result<(Value, Value)> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn load_argument(&mut self, index: usize) -> Result<Value> {
        self.argument_slot(index).map(|slot| *slot)
    }

    fn argument_slot(&mut self, index: usize) -> Result<&mut Value> {
        let frame = self.frame()?;
        let length = frame.arguments.len();
        frame
            .arguments
            .get_mut(index)
            .ok_or(RuntimeError::IndexOutOfRange {
                kind: "argument",
                index: index as i64,
                length,
            })
    }

    fn local_slot(&mut self, index: usize) -> Result<&mut Value> {
        let frame = self.frame()?;
        let length = frame.locals.len();
        frame
            .locals
            .get_mut(index)
            .ok_or(RuntimeError::IndexOutOfRange {
                kind: "local",
                index: index as i64,
                length,
            })
    }
}

fn unsupported(inst: &Instruction) -> RuntimeError {
    RuntimeError::UnsupportedInstruction {
        offset: inst.offset,
        mnemonic: inst.opcode.mnemonic(),
    }
}

fn missing(inst: &Instruction) -> RuntimeError {
    RuntimeError::MissingOperand {
        offset: inst.offset,
        mnemonic: inst.opcode.mnemonic(),
    }
}

fn target(inst: &Instruction) -> Result<u32> {
    match inst.operand {
        Some(Operand::Target(target)) => Ok(target),
        _ => Err(missing(inst)),
    }
}

fn variable(inst: &Instruction) -> Result<usize> {
    match inst.operand {
        Some(Operand::Variable(index)) => Ok(index as usize),
        _ => Err(missing(inst)),
    }
}

fn field_operand(inst: &Instruction) -> Result<&FieldRef> {
    match &inst.operand {
        Some(Operand::Field(field)) => Ok(field),
        _ => Err(missing(inst)),
    }
}

fn method_operand(inst: &Instruction) -> Result<&MethodRef> {
    match &inst.operand {
        Some(Operand::Method(method)) => Ok(method),
        _ => Err(missing(inst)),
    }
}

fn type_operand(inst: &Instruction) -> Result<&TypeRef> {
    match &inst.operand {
        Some(Operand::Type(ty)) => Ok(ty),
        _ => Err(missing(inst)),
    }
}

fn binary_op(opcode: Op) -> Option<BinaryOp> {
    Some(match opcode {
        Op::Add => BinaryOp::Add,
        Op::Sub => BinaryOp::Sub,
        Op::Mul => BinaryOp::Mul,
        Op::Div => BinaryOp::Div,
        Op::DivUn => BinaryOp::DivUn,
        Op::Rem => BinaryOp::Rem,
        Op::RemUn => BinaryOp::RemUn,
        Op::And => BinaryOp::And,
        Op::Or => BinaryOp::Or,
        Op::Xor => BinaryOp::Xor,
        Op::Shl => BinaryOp::Shl,
        Op::Shr => BinaryOp::Shr,
        Op::ShrUn => BinaryOp::ShrUn,
        Op::AddOvf => BinaryOp::AddOvf,
        Op::AddOvfUn => BinaryOp::AddOvfUn,
        Op::SubOvf => BinaryOp::SubOvf,
        Op::SubOvfUn => BinaryOp::SubOvfUn,
        Op::MulOvf => BinaryOp::MulOvf,
        Op::MulOvfUn => BinaryOp::MulOvfUn,
        _ => return None,
    })
}

fn comparison(opcode: Op) -> Option<CompareOp> {
    Some(match opcode {
        Op::Ceq => CompareOp::Eq,
        Op::Cgt => CompareOp::Gt,
        Op::CgtUn => CompareOp::GtUn,
        Op::Clt => CompareOp::Lt,
        Op::CltUn => CompareOp::LtUn,
        _ => return None,
    })
}

fn branch_comparison(opcode: Op) -> Option<CompareOp> {
    Some(match opcode {
        Op::Beq | Op::BeqS => CompareOp::Eq,
        Op::BneUn | Op::BneUnS => CompareOp::Ne,
        Op::Bge | Op::BgeS => CompareOp::Ge,
        Op::BgeUn | Op::BgeUnS => CompareOp::GeUn,
        Op::Bgt | Op::BgtS => CompareOp::Gt,
        Op::BgtUn | Op::BgtUnS => CompareOp::GtUn,
        Op::Ble | Op::BleS => CompareOp::Le,
        Op::BleUn | Op::BleUnS => CompareOp::LeUn,
        Op::Blt | Op::BltS => CompareOp::Lt,
        Op::BltUn | Op::BltUnS => CompareOp::LtUn,
        _ => return None,
    })
}

fn conversion(opcode: Op) -> Option<Conversion> {
    use ConvTarget::*;
    Some(match opcode {
        Op::ConvI1 => Conversion::plain(I1),
        Op::ConvI2 => Conversion::plain(I2),
        Op::ConvI4 => Conversion::plain(I4),
        Op::ConvI8 | Op::ConvI => Conversion::plain(I8),
        Op::ConvU1 => Conversion::plain(U1),
        Op::ConvU2 => Conversion::plain(U2),
        Op::ConvU4 => Conversion::plain(U4),
        Op::ConvU8 | Op::ConvU => Conversion::plain(U8),
        Op::ConvR4 => Conversion::plain(R4),
        Op::ConvR8 => Conversion::plain(R8),
        Op::ConvRUn => Conversion {
            target: R8,
            checked: false,
            unsigned_source: true,
        },
        Op::ConvOvfI1 => Conversion::checked(I1, false),
        Op::ConvOvfI2 => Conversion::checked(I2, false),
        Op::ConvOvfI4 => Conversion::checked(I4, false),
        Op::ConvOvfI8 | Op::ConvOvfI => Conversion::checked(I8, false),
        Op::ConvOvfU1 => Conversion::checked(U1, false),
        Op::ConvOvfU2 => Conversion::checked(U2, false),
        Op::ConvOvfU4 => Conversion::checked(U4, false),
        Op::ConvOvfU8 | Op::ConvOvfU => Conversion::checked(U8, false),
        Op::ConvOvfI1Un => Conversion::checked(I1, true),
        Op::ConvOvfI2Un => Conversion::checked(I2, true),
        Op::ConvOvfI4Un => Conversion::checked(I4, true),
        Op::ConvOvfI8Un | Op::ConvOvfIUn => Conversion::checked(I8, true),
        Op::ConvOvfU1Un => Conversion::checked(U1, true),
        Op::ConvOvfU2Un => Conversion::checked(U2, true),
        Op::ConvOvfU4Un => Conversion::checked(U4, true),
        Op::ConvOvfU8Un | Op::ConvOvfUUn => Conversion::checked(U8, true),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;
    use crate::error::HeapError;
    use crate::heap::Slot;
    use crate::metadata::Signature;
    use crate::module::{MemberImage, MethodImage, ModuleImage, Token, TypeImage};
    use crate::runtime::RuntimeOptions;

    fn method(name: &str, signature: &str) -> MemberImage {
        MemberImage::Method {
            declaring_type: "Tests.Program".into(),
            name: name.into(),
            signature: signature.into(),
        }
    }

    /// Builds a module with one `Tests.Program` type from
    /// `(name, signature, source)` triples.
    fn module(methods: &[(&str, &str, &str)], members: Vec<(u32, MemberImage)>) -> ModuleImage {
        let mut assembler = Assembler::new();
        let methods = methods
            .iter()
            .map(|(name, signature, source)| MethodImage {
                name: name.to_string(),
                signature: signature.to_string(),
                is_abstract: false,
                is_virtual: false,
                code: assembler.assemble(source).unwrap(),
            })
            .collect();
        ModuleImage {
            name: "Tests.exe".into(),
            types: vec![TypeImage {
                namespace: "Tests".into(),
                name: "Program".into(),
                extends: Some("[mscorlib]System.Object".into()),
                fields: vec![],
                constructors: vec![],
                methods,
            }],
            strings: assembler.into_strings(),
            members: members
                .into_iter()
                .map(|(token, member)| (Token(token), member))
                .collect(),
        }
    }

    fn load(image: &ModuleImage, options: RuntimeOptions) -> Runtime {
        let mut runtime = Runtime::new(options).unwrap();
        runtime.load_module(image).unwrap();
        runtime
    }

    fn find(runtime: &Runtime, name: &str) -> CallableId {
        let reference = MethodRef {
            declaring_type: TypeRef::new("Tests", "Tests", "Program"),
            name: name.to_string(),
            signature: Signature::parse("static ()void", "Tests").unwrap(),
        };
        runtime.catalog().resolve_callable(&reference).unwrap()
    }

    fn run(source: &str, signature: &str) -> (Runtime, Result<Option<Value>>) {
        run_with(source, signature, vec![])
    }

    fn run_with(
        source: &str,
        signature: &str,
        members: Vec<(u32, MemberImage)>,
    ) -> (Runtime, Result<Option<Value>>) {
        let image = module(&[("Main", signature, source)], members);
        let mut runtime = load(&image, RuntimeOptions::default());
        let main = find(&runtime, "Main");
        let result = runtime.call(main, vec![]);
        (runtime, result)
    }

    #[test]
    fn nop_ret_leaves_no_trace() {
        let (runtime, result) = run("nop\nnop\nret", "static ()void");
        assert_eq!(result.unwrap(), None);
        assert!(runtime.heap().is_empty());
        assert_eq!(runtime.call_depth(), 0);
        assert!(runtime.last_frame().unwrap().stack.is_empty());
    }

    #[test]
    fn integer_arithmetic() {
        for (op, expected) in [("add", 13), ("sub", 7), ("mul", 30), ("div", 3), ("rem", 1)] {
            let source = format!("ldc.i4.s 10\nldc.i4.3\n{op}\nret");
            let (_, result) = run(&source, "static ()int32");
            assert_eq!(result.unwrap(), Some(Value::Int32(expected)), "{op}");
        }
    }

    #[test]
    fn integer_division_by_zero_is_fatal() {
        let (runtime, result) = run("ldc.i4.1\nldc.i4.0\ndiv\nret", "static ()int32");
        assert!(matches!(result, Err(RuntimeError::ArithmeticFault(_))));
        assert_eq!(runtime.call_depth(), 0);
    }

    const IF_ELSE: &str = "
        ldarg.0
        stloc.0
        ldloc.0
        ldc.i4.s 10
        ceq
        brfalse.s otherwise
        ldc.i4.s 20
        stloc.1
        br.s done
    otherwise:
        ldc.i4.s 30
        stloc.1
    done:
        ret";

    #[test]
    fn if_else_takes_the_right_branch() {
        for (x, y) in [(10, 20), (11, 30)] {
            let image = module(&[("Main", "static (int32)void", IF_ELSE)], vec![]);
            let mut runtime = load(&image, RuntimeOptions::default());
            let main = find(&runtime, "Main");
            runtime.call(main, vec![Value::Int32(x)]).unwrap();
            let frame = runtime.last_frame().unwrap();
            assert_eq!(frame.locals[1], Value::Int32(y));
        }
    }

    #[test]
    fn for_loop_sums() {
        let (runtime, result) = run(
            "   ldc.i4.0
                stloc.0
                ldc.i4.0
                stloc.1
                br.s test
            body:
                ldloc.0
                ldloc.1
                add
                stloc.0
                ldloc.1
                ldc.i4.1
                add
                stloc.1
            test:
                ldloc.1
                ldc.i4.s 10
                blt.s body
                ret",
            "static ()void",
        );
        result.unwrap();
        let frame = runtime.last_frame().unwrap();
        assert_eq!(frame.locals[0], Value::Int32(45));
        assert_eq!(frame.locals[1], Value::Int32(10));
    }

    #[test]
    fn switch_dispatches_on_index() {
        let source = "
            ldarg.0
            switch (zero, one)
            ldc.i4.s 99
            ret
        zero:
            ldc.i4.s 10
            ret
        one:
            ldc.i4.s 11
            ret";
        for (arg, expected) in [(0, 10), (1, 11), (2, 99), (-1, 99)] {
            let image = module(&[("Main", "static (int32)int32", source)], vec![]);
            let mut runtime = load(&image, RuntimeOptions::default());
            let main = find(&runtime, "Main");
            let result = runtime.call(main, vec![Value::Int32(arg)]).unwrap();
            assert_eq!(result, Some(Value::Int32(expected)));
        }
    }

    #[test]
    fn call_returns_onto_caller_stack() {
        let image = module(
            &[
                ("Answer", "static ()int32", "ldc.i4.s 42\nret"),
                ("Main", "static ()void", "call @0x0A000001\nstloc.2\nret"),
            ],
            vec![(0x0A00_0001, method("Answer", "static ()int32"))],
        );
        let mut runtime = load(&image, RuntimeOptions::default());
        let main = find(&runtime, "Main");
        runtime.call(main, vec![]).unwrap();
        let frame = runtime.last_frame().unwrap();
        assert_eq!(frame.locals[2], Value::Int32(42));
        assert!(frame.stack.is_empty());
    }

    #[test]
    fn arguments_keep_parameter_order() {
        for order in [ArgumentOrder::Heuristic, ArgumentOrder::Strict] {
            let image = module(
                &[
                    ("Minus", "static (int32,int32)int32", "ldarg.0\nldarg.1\nsub\nret"),
                    ("Main", "static ()int32", "ldc.i4.s 10\nldc.i4.3\ncall @0x0A000001\nret"),
                ],
                vec![(0x0A00_0001, method("Minus", "static (int32,int32)int32"))],
            );
            let mut runtime = load(&image, RuntimeOptions::default().with_argument_order(order));
            let main = find(&runtime, "Main");
            assert_eq!(runtime.call(main, vec![]).unwrap(), Some(Value::Int32(7)));
        }
    }

    #[test]
    fn argument_correction_reverses_unless_receiver_first() {
        let image = module(&[], vec![]);
        let mut runtime = load(&image, RuntimeOptions::default());
        let program = runtime
            .catalog()
            .resolve_type(&TypeRef::new("Tests", "Tests", "Program"))
            .unwrap();
        let this = Value::Ref(runtime.instantiate(program).unwrap());

        let mut popped = vec![Value::Int32(2), Value::Int32(1), this];
        correct_argument_order(runtime.heap(), program, &mut popped);
        assert_eq!(popped, vec![this, Value::Int32(1), Value::Int32(2)]);

        let mut ordered = vec![this, Value::Int32(1)];
        correct_argument_order(runtime.heap(), program, &mut ordered);
        assert_eq!(ordered, vec![this, Value::Int32(1)]);
    }

    #[test]
    fn string_literals_become_objects() {
        let (runtime, result) = run("ldstr \"first\\r\\nsecond\"\nret", "static ()string");
        let handle = result.unwrap().unwrap().as_handle().unwrap();
        let object = runtime.heap().get(handle).unwrap();
        assert_eq!(object.slot(0), Some(&Slot::Text("first\r\nsecond".to_string())));
        assert_eq!(runtime.catalog().full_name(object.ty()), "System.String");
    }

    #[test]
    fn recursion_overflows_cleanly() {
        let image = module(
            &[("Recurse", "static ()void", "call @0x0A000001\nret")],
            vec![(0x0A00_0001, method("Recurse", "static ()void"))],
        );
        let mut runtime = load(&image, RuntimeOptions::default());
        let recurse = find(&runtime, "Recurse");
        let objects = runtime.heap().len();
        let err = runtime.call(recurse, vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::StackOverflow { depth: 26, limit: 25 }));
        assert_eq!(runtime.call_depth(), 0);
        assert_eq!(runtime.heap().len(), objects);
    }

    #[test]
    fn empty_stack_on_value_return() {
        let (_, result) = run("ret", "static ()int32");
        assert!(matches!(result, Err(RuntimeError::InvalidReturn { .. })));
    }

    #[test]
    fn exception_opcodes_are_unsupported() {
        let (runtime, result) = run("ldnull\nthrow", "static ()void");
        assert!(matches!(
            result,
            Err(RuntimeError::UnsupportedInstruction { offset: 1, mnemonic: "throw" })
        ));
        assert_eq!(runtime.call_depth(), 0);
        let (_, result) = run("endfinally", "static ()void");
        assert!(matches!(result, Err(RuntimeError::UnsupportedInstruction { .. })));
    }

    #[test]
    fn arrays_and_conversions() {
        let int32 = MemberImage::Type {
            name: "[mscorlib]System.Int32".into(),
        };
        let (runtime, result) = run_with(
            "   ldc.i4.3
                newarr @0x01000001
                stloc.0
                ldloc.0
                ldc.i4.1
                ldc.i4 300
                conv.u1
                stelem.i4
                ldloc.0
                ldc.i4.1
                ldelem.i4
                ldloc.0
                ldlen
                conv.i4
                add
                ret",
            "static ()int32",
            vec![(0x0100_0001, int32)],
        );
        assert_eq!(result.unwrap(), Some(Value::Int32(44 + 3)));
        assert_eq!(runtime.heap().len(), 1);
    }

    #[test]
    fn array_index_out_of_range() {
        let int32 = MemberImage::Type {
            name: "[mscorlib]System.Int32".into(),
        };
        let (_, result) = run_with(
            "ldc.i4.2\nnewarr @0x01000001\nldc.i4.2\nldelem.i4\nret",
            "static ()int32",
            vec![(0x0100_0001, int32)],
        );
        assert!(matches!(
            result,
            Err(RuntimeError::IndexOutOfRange { kind: "array", index: 2, length: 2 })
        ));
    }

    #[test]
    fn newarr_rejects_oversized_lengths() {
        let int32 = MemberImage::Type {
            name: "[mscorlib]System.Int32".into(),
        };
        let (runtime, result) = run_with(
            "ldc.i4 0x7fffffff\nnewarr @0x01000001\nret",
            "static ()int32[]",
            vec![(0x0100_0001, int32.clone())],
        );
        assert!(matches!(
            result,
            Err(RuntimeError::Heap(HeapError::ArrayTooLarge { length: 0x7fff_ffff, .. }))
        ));
        assert!(runtime.heap().is_empty());
        assert_eq!(runtime.call_depth(), 0);

        let image = module(
            &[("Main", "static ()int32[]", "ldc.i4.s 9\nnewarr @0x01000001\nret")],
            vec![(0x0100_0001, int32)],
        );
        let mut runtime = load(&image, RuntimeOptions::default().with_max_array_length(8));
        let main = find(&runtime, "Main");
        assert!(matches!(
            runtime.call(main, vec![]),
            Err(RuntimeError::Heap(HeapError::ArrayTooLarge { length: 9, limit: 8 }))
        ));
    }

    #[test]
    fn brtrue_takes_only_the_true_sentinel() {
        let source = "
            ldarg.0
            brtrue.s taken
            ldc.i4.0
            ret
        taken:
            ldc.i4.1
            ret";
        for (arg, expected) in [(1, 1), (2, 0), (0, 0), (-1, 0)] {
            let image = module(&[("Main", "static (int32)int32", source)], vec![]);
            let mut runtime = load(&image, RuntimeOptions::default());
            let main = find(&runtime, "Main");
            let result = runtime.call(main, vec![Value::Int32(arg)]).unwrap();
            assert_eq!(result, Some(Value::Int32(expected)), "brtrue {arg}");
        }
    }

    #[test]
    fn brfalse_takes_only_the_false_sentinel() {
        let source = "
            ldarg.0
            brfalse.s taken
            ldc.i4.0
            ret
        taken:
            ldc.i4.1
            ret";
        for (arg, expected) in [(0, 1), (1, 0), (2, 0)] {
            let image = module(&[("Main", "static (int32)int32", source)], vec![]);
            let mut runtime = load(&image, RuntimeOptions::default());
            let main = find(&runtime, "Main");
            let result = runtime.call(main, vec![Value::Int32(arg)]).unwrap();
            assert_eq!(result, Some(Value::Int32(expected)), "brfalse {arg}");
        }
    }

    #[test]
    fn references_branch_on_null() {
        let (_, result) = run(
            "ldnull\nbrtrue.s bad\nldnull\nbrfalse.s good\nbad: ldc.i4.0\nret\ngood: ldc.i4.1\nret",
            "static ()int32",
        );
        assert_eq!(result.unwrap(), Some(Value::Int32(1)));
    }
}
