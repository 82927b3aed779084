//! Built-in `mscorlib` catalog and the native stand-ins behind it.
//!
//! Framework callables have empty bodies; the interpreter dispatches them to
//! the [`NativeFn`] registered under their type name, member name and
//! parameter count.
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::ResolveError;
use crate::instruction::MethodBody;
use crate::metadata::{
    AssemblyId, Callable, CallableKind, Catalog, Signature, TypeId, TypeRef, FRAMEWORK_ASSEMBLY,
};
use crate::runtime::{Builtins, Result, Runtime};

mod environment;
mod int32;
mod io;
mod list;
mod object;
mod string;

/// Behavior of a framework callable. Reads its arguments from the running
/// frame and pushes its result, if any, onto that frame's stack.
pub type NativeFn = fn(&mut Runtime) -> Result<()>;

/// Native stand-ins keyed by `(type full name, member name, arity)`.
#[derive(Default)]
pub struct NativeTable {
    entries: HashMap<(String, String, usize), NativeFn>,
}

impl NativeTable {
    pub fn register(&mut self, type_name: &str, member: &str, arity: usize, native: NativeFn) {
        self.entries
            .insert((type_name.to_string(), member.to_string(), arity), native);
    }

    pub fn lookup(&self, type_name: &str, member: &str, arity: usize) -> Option<NativeFn> {
        self.entries
            .get(&(type_name.to_string(), member.to_string(), arity))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type Setup = std::result::Result<(), ResolveError>;

/// Declares framework types and registers their natives side by side.
struct Builder<'a> {
    catalog: &'a mut Catalog,
    natives: &'a mut NativeTable,
    assembly: AssemblyId,
}

impl Builder<'_> {
    fn ty(&mut self, namespace: &str, name: &str) -> TypeId {
        let base = (namespace, name) != ("System", "Object");
        let base = base.then(|| TypeRef::framework("System", "Object"));
        self.catalog.add_type(self.assembly, namespace, name, base)
    }

    fn field(&mut self, ty: TypeId, name: &str, field_type: &str) -> Setup {
        let field_type = TypeRef::parse(field_type, FRAMEWORK_ASSEMBLY)?;
        self.catalog.add_field(ty, name, Some(field_type));
        Ok(())
    }

    fn callable(
        &mut self,
        ty: TypeId,
        kind: Option<&str>,
        signature: &str,
        native: NativeFn,
    ) -> Setup {
        let signature = Signature::parse(signature, FRAMEWORK_ASSEMBLY)?;
        let arity = signature.parameters.len();
        let kind = match kind {
            None => CallableKind::Constructor,
            Some(name) => CallableKind::Method {
                name: name.to_string(),
                return_type: signature.return_type,
                is_abstract: false,
                is_virtual: matches!(name, "ToString" | "Equals"),
            },
        };
        let callable = Callable {
            declaring_type: ty,
            is_static: signature.is_static,
            parameter_types: signature.parameters,
            body: Rc::new(MethodBody::default()),
            kind,
        };
        let type_name = self.catalog.full_name(ty);
        self.natives.register(&type_name, callable.name(), arity, native);
        self.catalog.add_callable(callable);
        Ok(())
    }

    fn method(&mut self, ty: TypeId, name: &str, signature: &str, native: NativeFn) -> Setup {
        self.callable(ty, Some(name), signature, native)
    }

    fn constructor(&mut self, ty: TypeId, signature: &str, native: NativeFn) -> Setup {
        self.callable(ty, None, signature, native)
    }
}

/// Adds the framework assembly to `catalog` and its natives to `natives`.
pub(crate) fn install(
    catalog: &mut Catalog,
    natives: &mut NativeTable,
) -> std::result::Result<Builtins, ResolveError> {
    let assembly = catalog.add_assembly(FRAMEWORK_ASSEMBLY, true);
    let mut b = Builder {
        catalog,
        natives,
        assembly,
    };

    let object = b.ty("System", "Object");
    b.constructor(object, "()void", object::construct)?;
    b.method(object, "ToString", "()string", object::to_string)?;
    b.method(object, "Equals", "(object)bool", object::equals)?;

    for primitive in ["Void", "Boolean", "Char", "Int64", "Double", "ValueType"] {
        b.ty("System", primitive);
    }

    let string = b.ty("System", "String");
    b.field(string, "Value", "string")?;
    string::install(&mut b, string)?;

    let int32 = b.ty("System", "Int32");
    b.method(int32, "Parse", "static (string)int32", int32::parse)?;

    let array = b.ty("System", "Array");
    b.field(array, "Values", "object")?;
    b.field(array, "Length", "int32")?;

    let list = b.ty("System.Collections.Generic", "List`1");
    b.field(list, "Values", "object")?;
    list::install(&mut b, list)?;

    io::install(&mut b)?;
    environment::install(&mut b)?;

    Ok(Builtins {
        string,
        array,
        list,
    })
}

/// Calls framework members directly from native unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::metadata::MethodRef;
    use crate::runtime::RuntimeOptions;
    use crate::value::Value;

    pub(crate) fn runtime() -> Runtime {
        Runtime::new(RuntimeOptions::default()).unwrap()
    }

    /// Resolves `ty::name` with `signature` and calls it with `arguments`,
    /// receiver first for instance members.
    pub(crate) fn call(
        rt: &mut Runtime,
        ty: &str,
        name: &str,
        signature: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>> {
        let reference = MethodRef {
            declaring_type: TypeRef::parse(ty, FRAMEWORK_ASSEMBLY)?,
            name: name.to_string(),
            signature: Signature::parse(signature, FRAMEWORK_ASSEMBLY)?,
        };
        let id = rt.catalog().resolve_callable(&reference)?;
        rt.call(id, arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MethodRef;

    #[test]
    fn framework_members_have_natives() {
        let mut catalog = Catalog::new();
        let mut natives = NativeTable::default();
        install(&mut catalog, &mut natives).unwrap();
        let assembly = catalog.find_assembly("mscorlib.dll").unwrap();
        assert!(catalog.assembly(assembly).is_builtin);
        for &ty in &catalog.assembly(assembly).types {
            let def = catalog.ty(ty);
            for &id in def.constructors.iter().chain(&def.methods) {
                let callable = catalog.callable(id);
                assert!(callable.is_native());
                let arity = callable.parameter_types.len();
                assert!(
                    natives.lookup(&catalog.full_name(ty), callable.name(), arity).is_some(),
                    "{}",
                    catalog.callable_name(id)
                );
            }
        }
    }

    #[test]
    fn resolves_list_capacity_constructor() {
        let mut catalog = Catalog::new();
        let mut natives = NativeTable::default();
        install(&mut catalog, &mut natives).unwrap();
        let reference = MethodRef {
            declaring_type: TypeRef::framework("System.Collections.Generic", "List`1"),
            name: ".ctor".to_string(),
            signature: Signature::parse("(int32)void", FRAMEWORK_ASSEMBLY).unwrap(),
        };
        let id = catalog.resolve_callable(&reference).unwrap();
        assert_eq!(catalog.callable(id).parameter_types.len(), 1);
    }
}
