//! Runtime module responsible for creating a new execution environment,
//! loading modules into it and running programs.
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::error::{HeapError, ResolveError, RuntimeError};
use crate::frame::{CallStack, StackFrame};
use crate::framework::{self, NativeTable};
use crate::heap::{ArrayData, Handle, Heap, ObjectInstance, Slot};
use crate::metadata::{AssemblyId, Callable, CallableKind, Catalog, TypeId};
use crate::module::{ModuleSource, TypeInfo};
use crate::value::Value;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// How call sites hand their arguments to the callee.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ArgumentOrder {
    /// Pop the receiver slot first, then the parameters, and repair the
    /// order with [`correct_argument_order`](crate::interpreter::correct_argument_order).
    #[default]
    Heuristic,
    /// Receiver then parameters, in push order.
    Strict,
}

/// Tunables of a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub max_call_depth: usize,
    pub heap_capacity: usize,
    /// Local variable slots per frame.
    pub locals: usize,
    /// Largest element count `newarr` and the natives may allocate.
    pub max_array_length: usize,
    pub argument_order: ArgumentOrder,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 25,
            heap_capacity: 65_536,
            locals: 256,
            max_array_length: 1 << 20,
            argument_order: ArgumentOrder::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_heap_capacity(mut self, capacity: usize) -> Self {
        self.heap_capacity = capacity;
        self
    }

    pub fn with_locals(mut self, locals: usize) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_max_array_length(mut self, length: usize) -> Self {
        self.max_array_length = length;
        self
    }

    pub fn with_argument_order(mut self, order: ArgumentOrder) -> Self {
        self.argument_order = order;
        self
    }
}

/// Framework types the engine allocates directly.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Builtins {
    pub string: TypeId,
    pub array: TypeId,
    pub list: TypeId,
}

/// `Runtime` is the execution context of loaded programs: it owns the type
/// catalog, the heap, the call stack and static field storage.
///
/// The call stack is empty before the first call and after the outermost
/// call returns, whether it succeeded or not.
pub struct Runtime {
    pub(crate) catalog: Catalog,
    pub(crate) heap: Heap,
    pub(crate) calls: CallStack,
    pub(crate) statics: HashMap<(TypeId, String), Value>,
    pub(crate) natives: NativeTable,
    pub(crate) builtins: Builtins,
    pub(crate) options: RuntimeOptions,
    output: Box<dyn Write>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("objects", &self.heap.len())
            .field("depth", &self.calls.depth())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Builds a runtime with the framework assembly installed.
    pub fn new(options: RuntimeOptions) -> Result<Self> {
        let mut catalog = Catalog::new();
        let mut natives = NativeTable::default();
        let builtins = framework::install(&mut catalog, &mut natives)?;
        debug!(natives = natives.len(), "framework installed");
        Ok(Self {
            catalog,
            heap: Heap::new(options.heap_capacity),
            calls: CallStack::new(options.max_call_depth),
            statics: HashMap::new(),
            natives,
            builtins,
            options,
            output: Box::new(io::stdout()),
        })
    }

    /// Redirects console output of the framework stand-ins.
    pub fn with_output(mut self, output: impl Write + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Number of live frames.
    pub fn call_depth(&self) -> usize {
        self.calls.depth()
    }

    /// The most recently exited frame, with its final locals and stack.
    pub fn last_frame(&self) -> Option<&StackFrame> {
        self.calls.last_exited()
    }

    /// Value of a static field, `Null` until first stored.
    pub fn static_field(&self, ty: TypeId, name: &str) -> Value {
        self.statics
            .get(&(ty, name.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Loads every type of `source` into the catalog. Instance layouts put
    /// the fields of base types declared in the same module first.
    pub fn load_module(&mut self, source: &dyn ModuleSource) -> Result<AssemblyId> {
        let name = source.assembly_name();
        let assembly = self.catalog.add_assembly(&name, false);
        let types = source.list_types();
        let ids: Vec<TypeId> = types
            .iter()
            .map(|t| {
                self.catalog
                    .add_type(assembly, &t.namespace, &t.name, t.base.clone())
            })
            .collect();

        if let Some(&cyclic) = ids.iter().find(|&&id| self.catalog.has_cyclic_base(id)) {
            return Err(ResolveError::CyclicInheritance(self.catalog.full_name(cyclic)).into());
        }

        for (info, &id) in types.iter().zip(&ids) {
            for ancestor in lineage(info, &types, &name) {
                let declaring = types
                    .iter()
                    .position(|t| t == ancestor)
                    .map_or(id, |i| ids[i]);
                for field in source.list_fields(ancestor)? {
                    self.catalog
                        .add_inherited_field(id, declaring, &field.name, field.field_type);
                }
            }
        }

        for (info, &id) in types.iter().zip(&ids) {
            for ctor in source.list_constructors(info)? {
                self.catalog.add_callable(Callable {
                    declaring_type: id,
                    is_static: ctor.signature.is_static,
                    parameter_types: ctor.signature.parameters,
                    body: Rc::new(ctor.body),
                    kind: CallableKind::Constructor,
                });
            }
            for method in source.list_methods(info)? {
                self.catalog.add_callable(Callable {
                    declaring_type: id,
                    is_static: method.signature.is_static,
                    parameter_types: method.signature.parameters,
                    body: Rc::new(method.body),
                    kind: CallableKind::Method {
                        name: method.name,
                        return_type: method.signature.return_type,
                        is_abstract: method.is_abstract,
                        is_virtual: method.is_virtual,
                    },
                });
            }
        }
        info!(assembly = %name, types = ids.len(), "module loaded");
        Ok(assembly)
    }

    /// Runs the first static `Main` of the loaded modules with `args` as
    /// its string array argument.
    pub fn start(&mut self, args: &[String]) -> Result<Option<Value>> {
        let entry = self.catalog.entry_point().ok_or(RuntimeError::NoEntryPoint)?;
        info!(entry = %self.catalog.callable_name(entry), "starting");
        let mut arguments = Vec::new();
        if !self.catalog.callable(entry).parameter_types.is_empty() {
            let strings = args
                .iter()
                .map(|a| self.alloc_string(a))
                .collect::<Result<Vec<_>>>()?;
            arguments.push(self.alloc_array(ArrayData::Refs(strings))?);
        }
        let result = self.call(entry, arguments)?;
        if let Some(frame) = self.last_frame().filter(|f| !f.stack.is_empty()) {
            warn!(values = frame.stack.len(), "outermost evaluation stack not drained");
        }
        self.output.flush()?;
        Ok(result)
    }

    /// Reclaims every object unreachable from the live frames and statics.
    pub fn collect_garbage(&mut self) -> usize {
        let roots: Vec<Handle> = self
            .calls
            .frames()
            .iter()
            .flat_map(|f| f.stack.iter().chain(&f.locals).chain(&f.arguments))
            .chain(self.statics.values())
            .filter_map(|v| match v {
                Value::Ref(h) => Some(*h),
                _ => None,
            })
            .collect();
        let reclaimed = self.heap.collect(roots);
        debug!(reclaimed, live = self.heap.len(), "garbage collected");
        reclaimed
    }

    /// Allocates an instance of `ty` with default field slots.
    pub fn instantiate(&mut self, ty: TypeId) -> Result<Handle> {
        let slots = if ty == self.builtins.list {
            vec![Slot::List(Vec::new())]
        } else if ty == self.builtins.string {
            vec![Slot::Text(String::new())]
        } else {
            self.catalog
                .ty(ty)
                .fields
                .iter()
                .map(|f| Slot::for_field(f.field_type.as_ref()))
                .collect()
        };
        Ok(self.heap.store(ObjectInstance::new(ty, slots))?)
    }

    pub fn alloc_string(&mut self, text: &str) -> Result<Value> {
        let object = ObjectInstance::new(self.builtins.string, vec![Slot::Text(text.to_string())]);
        Ok(Value::Ref(self.heap.store(object)?))
    }

    pub fn alloc_array(&mut self, data: ArrayData) -> Result<Value> {
        let length = self.check_array_length(i64::try_from(data.len()).unwrap_or(i64::MAX))?;
        let length = Value::Int32(length as i32);
        let slots = vec![Slot::Array(data), Slot::Value(length)];
        let object = ObjectInstance::new(self.builtins.array, slots);
        Ok(Value::Ref(self.heap.store(object)?))
    }

    pub fn alloc_list(&mut self, values: Vec<Value>) -> Result<Value> {
        let object = ObjectInstance::new(self.builtins.list, vec![Slot::List(values)]);
        Ok(Value::Ref(self.heap.store(object)?))
    }

    /// Text of a string object. `null` reads as the empty string.
    pub fn text_of(&self, value: Value) -> Result<String> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Ref(handle) => match self.heap.get(handle)?.slot(0) {
                Some(Slot::Text(text)) => Ok(text.clone()),
                _ => Err(HeapError::SlotKind {
                    handle,
                    field: "Value".to_string(),
                    expected: "string",
                }
                .into()),
            },
            other => Err(RuntimeError::TypeMismatch {
                expected: "string",
                found: other.kind().to_string(),
            }),
        }
    }

    /// How a value prints: numbers as-is, strings as their text, other
    /// objects as their type name.
    pub fn display(&self, value: Value) -> Result<String> {
        Ok(match value {
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Null => String::new(),
            Value::Ref(handle) => {
                let object = self.heap.get(handle)?;
                match object.slot(0) {
                    Some(Slot::Text(text)) if object.ty() == self.builtins.string => text.clone(),
                    _ => self.catalog.full_name(object.ty()),
                }
            }
        })
    }

    /// Elements of an array or list object.
    pub fn elements(&self, value: Value) -> Result<Vec<Value>> {
        let handle = value.as_handle()?;
        match self.heap.get(handle)?.slot(0) {
            Some(Slot::Array(data)) => Ok(data.values()),
            Some(Slot::List(values)) => Ok(values.clone()),
            _ => Err(HeapError::SlotKind {
                handle,
                field: "Values".to_string(),
                expected: "array or list",
            }
            .into()),
        }
    }

    pub fn array_mut(&mut self, handle: Handle) -> Result<&mut ArrayData> {
        match self.heap.get_mut(handle)?.slot_mut(0) {
            Some(Slot::Array(data)) => Ok(data),
            _ => Err(HeapError::SlotKind {
                handle,
                field: "Values".to_string(),
                expected: "array",
            }
            .into()),
        }
    }

    pub fn list_mut(&mut self, handle: Handle) -> Result<&mut Vec<Value>> {
        match self.heap.get_mut(handle)?.slot_mut(0) {
            Some(Slot::List(values)) => Ok(values),
            _ => Err(HeapError::SlotKind {
                handle,
                field: "Values".to_string(),
                expected: "list",
            }
            .into()),
        }
    }

    /// Reads a named field of an object.
    pub fn field(&self, handle: Handle, name: &str) -> Result<Value> {
        let object = self.heap.get(handle)?;
        let index = self.catalog.field_slot(object.ty(), name)?;
        match object.slot(index) {
            Some(Slot::Value(value)) => Ok(*value),
            _ => Err(HeapError::SlotKind {
                handle,
                field: name.to_string(),
                expected: "value",
            }
            .into()),
        }
    }

    pub fn set_field(&mut self, handle: Handle, name: &str, value: Value) -> Result<()> {
        let ty = self.heap.get(handle)?.ty();
        let index = self.catalog.field_slot(ty, name)?;
        match self.heap.get_mut(handle)?.slot_mut(index) {
            Some(slot @ Slot::Value(_)) => {
                *slot = Slot::Value(value);
                Ok(())
            }
            _ => Err(HeapError::SlotKind {
                handle,
                field: name.to_string(),
                expected: "value",
            }
            .into()),
        }
    }

    /// Values equal the way `List.IndexOf` compares them: strings by text,
    /// everything else by identity or value.
    pub fn values_equal(&self, a: Value, b: Value) -> Result<bool> {
        if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
            let (ox, oy) = (self.heap.get(x)?, self.heap.get(y)?);
            if ox.ty() == self.builtins.string && oy.ty() == self.builtins.string {
                return Ok(ox.slot(0) == oy.slot(0));
            }
        }
        Ok(a == b)
    }

    /// Argument `index` of the running frame; the receiver is argument 0
    /// of instance calls.
    pub fn argument(&self, index: usize) -> Result<Value> {
        let frame = self.calls.top().ok_or(RuntimeError::StackUnderflow {
            method: "<host>".to_string(),
        })?;
        frame
            .arguments
            .get(index)
            .copied()
            .ok_or_else(|| RuntimeError::NativeFault {
                method: self.catalog.callable_name(frame.callable),
                message: format!("missing argument {index}"),
            })
    }

    /// All arguments of the running frame.
    pub fn arguments(&self) -> Result<Vec<Value>> {
        self.calls
            .top()
            .map(|frame| frame.arguments.clone())
            .ok_or(RuntimeError::StackUnderflow {
                method: "<host>".to_string(),
            })
    }

    /// Fault raised by the running native.
    pub fn native_fault(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::NativeFault {
            method: self
                .calls
                .top()
                .map_or_else(|| "<host>".to_string(), |f| self.catalog.callable_name(f.callable)),
            message: message.into(),
        }
    }

    /// Pushes onto the running frame's evaluation stack.
    pub fn push(&mut self, value: Value) -> Result<()> {
        let frame = self.calls.top_mut().ok_or(RuntimeError::StackUnderflow {
            method: "<host>".to_string(),
        })?;
        frame.push(value);
        Ok(())
    }

    /// Writes text to the console output.
    pub fn write_output(&mut self, text: &str) -> Result<()> {
        self.output.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Validates an array length against `max_array_length`. Negative
    /// lengths overflow.
    pub(crate) fn check_array_length(&self, length: i64) -> Result<usize> {
        let limit = self.options.max_array_length.min(i32::MAX as usize);
        match usize::try_from(length) {
            Ok(n) if n <= limit => Ok(n),
            Ok(_) => Err(HeapError::ArrayTooLarge { length, limit }.into()),
            Err(_) => Err(RuntimeError::Overflow("newarr")),
        }
    }
}

/// `info` and its base types declared in the same module, root first.
fn lineage<'a>(info: &'a TypeInfo, types: &'a [TypeInfo], assembly: &str) -> Vec<&'a TypeInfo> {
    let mut chain = vec![info];
    let mut current = info;
    while let Some(base) = &current.base {
        if base.assembly != assembly {
            break;
        }
        let Some(parent) = types
            .iter()
            .find(|t| t.namespace == base.namespace && t.name == base.name)
        else {
            break;
        };
        if chain.iter().any(|&t| t == parent) {
            break;
        }
        chain.push(parent);
        current = parent;
    }
    chain.reverse();
    chain
}
