//! Activation records and the call stack.
use crate::error::RuntimeError;
use crate::metadata::CallableId;
use crate::value::Value;

/// Activation record of one in-progress call.
///
/// A frame is pushed right before its callable starts and popped right after
/// it returns; the evaluation stack of the popped frame supplies the return
/// value, if any.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub caller: Option<CallableId>,
    pub callable: CallableId,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub arguments: Vec<Value>,
}

impl StackFrame {
    pub fn new(
        caller: Option<CallableId>,
        callable: CallableId,
        arguments: Vec<Value>,
        locals: usize,
    ) -> Self {
        Self {
            caller,
            callable,
            stack: Vec::new(),
            locals: vec![Value::Null; locals],
            arguments,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    pub fn peek(&self, depth: usize) -> Option<Value> {
        self.stack.iter().rev().nth(depth).copied()
    }
}

/// Stack of live frames, most recent call on top, with a depth limit.
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<StackFrame>,
    max_depth: usize,
    last_exited: Option<StackFrame>,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
            last_exited: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: StackFrame) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.max_depth {
            return Err(RuntimeError::StackOverflow {
                depth: self.frames.len() + 1,
                limit: self.max_depth,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the top frame. It stays available as [`Self::last_exited`].
    pub fn pop(&mut self) -> Option<&mut StackFrame> {
        let frame = self.frames.pop()?;
        self.last_exited = Some(frame);
        self.last_exited.as_mut()
    }

    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn last_exited(&self) -> Option<&StackFrame> {
        self.last_exited.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::instruction::MethodBody;
    use crate::metadata::{Callable, CallableKind, Catalog, TypeRef};

    fn callable() -> CallableId {
        let mut catalog = Catalog::new();
        let asm = catalog.add_assembly("Sample", false);
        let ty = catalog.add_type(asm, "Sample", "Program", None);
        catalog.add_callable(Callable {
            declaring_type: ty,
            is_static: true,
            parameter_types: vec![],
            body: Rc::new(MethodBody::default()),
            kind: CallableKind::Method {
                name: "Main".into(),
                return_type: TypeRef::void(),
                is_abstract: false,
                is_virtual: false,
            },
        })
    }

    #[test]
    fn enforces_depth_limit() {
        let id = callable();
        let mut calls = CallStack::new(2);
        calls.push(StackFrame::new(None, id, vec![], 4)).unwrap();
        calls.push(StackFrame::new(Some(id), id, vec![], 4)).unwrap();
        let err = calls.push(StackFrame::new(Some(id), id, vec![], 4)).unwrap_err();
        assert!(matches!(err, RuntimeError::StackOverflow { depth: 3, limit: 2 }));
        assert_eq!(calls.depth(), 2);
    }

    #[test]
    fn popped_frame_is_kept() {
        let id = callable();
        let mut calls = CallStack::new(4);
        let mut frame = StackFrame::new(None, id, vec![Value::Int32(1)], 4);
        frame.push(Value::Int32(42));
        calls.push(frame).unwrap();
        assert_eq!(calls.pop().and_then(|f| f.pop()), Some(Value::Int32(42)));
        assert!(calls.is_empty());
        let last = calls.last_exited().unwrap();
        assert_eq!(last.arguments, vec![Value::Int32(1)]);
        assert_eq!(last.locals.len(), 4);
    }
}
