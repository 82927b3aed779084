//! Type metadata model: the catalog of assemblies, types, fields and
//! callables the engine executes against, plus the name-based descriptors
//! that decoded instructions use to refer to them.
use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{HeapError, ResolveError};
use crate::instruction::MethodBody;

/// Name of the built-in framework assembly.
pub const FRAMEWORK_ASSEMBLY: &str = "mscorlib";

static FILE_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(dll|exe)$").expect("valid regex"));

static TYPE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\[([^\]]+)\])?([^\s\[\]]+)((?:\[\])*)\s*$").expect("valid regex")
});

static SIGNATURE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(static|instance)\s+)?\(([^)]*)\)\s*(\S+)\s*$").expect("valid regex")
});

/// Strips the file-extension suffix from an assembly name, so that
/// `Sample.exe` and `Sample` name the same assembly.
pub fn normalize_assembly_name(name: &str) -> String {
    FILE_EXTENSION.replace(name.trim(), "").into_owned()
}

/// Name-based reference to a type, as found in decoded metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub assembly: String,
    pub namespace: String,
    pub name: String,
}

impl TypeRef {
    pub fn new(assembly: &str, namespace: &str, name: &str) -> Self {
        Self {
            assembly: normalize_assembly_name(assembly),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Reference to a type of the framework assembly.
    pub fn framework(namespace: &str, name: &str) -> Self {
        Self::new(FRAMEWORK_ASSEMBLY, namespace, name)
    }

    pub fn void() -> Self {
        Self::framework("System", "Void")
    }

    pub fn is_void(&self) -> bool {
        *self == Self::void()
    }

    pub fn is_array(&self) -> bool {
        self.name.ends_with("[]")
    }

    /// Element type of an array type reference.
    pub fn element_type(&self) -> Option<TypeRef> {
        self.name.strip_suffix("[]").map(|name| TypeRef {
            assembly: self.assembly.clone(),
            namespace: self.namespace.clone(),
            name: name.to_string(),
        })
    }

    /// `Namespace.Name`, or just `Name` outside any namespace.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Parses `[Assembly]Namespace.Name[]` or one of the short aliases such
    /// as `int32` or `string`. Unqualified names belong to `default_assembly`.
    pub fn parse(text: &str, default_assembly: &str) -> Result<Self, ResolveError> {
        let caps = TYPE_TEXT
            .captures(text)
            .ok_or_else(|| ResolveError::Signature(text.to_string()))?;
        let path = caps.get(2).map_or("", |m| m.as_str());
        let suffix = caps.get(3).map_or("", |m| m.as_str());
        let mut base = match (caps.get(1), alias(path)) {
            (None, Some(name)) => Self::framework("System", name),
            (assembly, _) => {
                let assembly = assembly.map_or(default_assembly, |m| m.as_str());
                match path.rsplit_once('.') {
                    Some((namespace, name)) => Self::new(assembly, namespace, name),
                    None => Self::new(assembly, "", path),
                }
            }
        };
        base.name.push_str(suffix);
        Ok(base)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

fn alias(name: &str) -> Option<&'static str> {
    Some(match name {
        "void" => "Void",
        "bool" => "Boolean",
        "char" => "Char",
        "int8" => "SByte",
        "uint8" => "Byte",
        "int16" => "Int16",
        "uint16" => "UInt16",
        "int32" => "Int32",
        "uint32" => "UInt32",
        "int64" => "Int64",
        "uint64" => "UInt64",
        "float32" => "Single",
        "float64" => "Double",
        "string" => "String",
        "object" => "Object",
        _ => return None,
    })
}

/// Calling shape of a method: `[static|instance] (params)return`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub is_static: bool,
    pub parameters: Vec<TypeRef>,
    pub return_type: TypeRef,
}

impl Signature {
    /// Parses signature text such as `static (int32,string)void`. Methods
    /// are instance methods unless marked `static`.
    pub fn parse(text: &str, default_assembly: &str) -> Result<Self, ResolveError> {
        let caps = SIGNATURE_TEXT
            .captures(text)
            .ok_or_else(|| ResolveError::Signature(text.to_string()))?;
        let is_static = caps.get(1).is_some_and(|m| m.as_str() == "static");
        let params = caps.get(2).map_or("", |m| m.as_str());
        let parameters = params
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| TypeRef::parse(p, default_assembly))
            .collect::<Result<Vec<_>, _>>()?;
        let return_type = TypeRef::parse(caps.get(3).map_or("", |m| m.as_str()), default_assembly)?;
        Ok(Self {
            is_static,
            parameters,
            return_type,
        })
    }
}

/// Name-based reference to a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub field_type: Option<TypeRef>,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type, self.name)
    }
}

/// Name-based reference to a method or constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub signature: Signature,
}

impl MethodRef {
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor" || self.name == ".cctor"
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{} {}::{}()",
            if self.signature.is_static { "" } else { "instance " },
            self.signature.return_type,
            self.declaring_type,
            self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssemblyId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallableId(usize);

#[derive(Debug)]
pub struct Assembly {
    pub name: String,
    pub is_builtin: bool,
    pub types: Vec<TypeId>,
}

/// A type. Its field list is the slot layout of every instance, in
/// insertion order.
#[derive(Debug)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub assembly: AssemblyId,
    pub base: Option<TypeRef>,
    pub fields: Vec<Field>,
    pub constructors: Vec<CallableId>,
    pub methods: Vec<CallableId>,
}

/// Layout descriptor of one field slot.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub declaring_type: TypeId,
    pub field_type: Option<TypeRef>,
}

#[derive(Debug, Clone)]
pub enum CallableKind {
    Constructor,
    Method {
        name: String,
        return_type: TypeRef,
        is_abstract: bool,
        is_virtual: bool,
    },
}

/// A method or constructor. An empty body means the behavior is native.
#[derive(Debug)]
pub struct Callable {
    pub declaring_type: TypeId,
    pub is_static: bool,
    pub parameter_types: Vec<TypeRef>,
    pub body: Rc<MethodBody>,
    pub kind: CallableKind,
}

impl Callable {
    pub fn name(&self) -> &str {
        match &self.kind {
            CallableKind::Constructor => ".ctor",
            CallableKind::Method { name, .. } => name,
        }
    }

    pub fn is_constructor(&self) -> bool {
        matches!(self.kind, CallableKind::Constructor)
    }

    pub fn is_overridable(&self) -> bool {
        matches!(
            self.kind,
            CallableKind::Method { is_abstract: true, .. }
                | CallableKind::Method { is_virtual: true, .. }
        )
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, CallableKind::Method { is_abstract: true, .. })
    }

    /// Whether a value is moved to the caller on return.
    pub fn returns_value(&self) -> bool {
        match &self.kind {
            CallableKind::Constructor => false,
            CallableKind::Method { return_type, .. } => !return_type.is_void(),
        }
    }

    pub fn is_native(&self) -> bool {
        self.body.is_empty()
    }
}

/// Arena of every loaded assembly, type and callable. Cross references are
/// plain indices into the arena.
#[derive(Debug, Default)]
pub struct Catalog {
    assemblies: Vec<Assembly>,
    types: Vec<TypeDef>,
    callables: Vec<Callable>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_assembly(&mut self, name: &str, is_builtin: bool) -> AssemblyId {
        self.assemblies.push(Assembly {
            name: normalize_assembly_name(name),
            is_builtin,
            types: Vec::new(),
        });
        AssemblyId(self.assemblies.len() - 1)
    }

    pub fn add_type(
        &mut self,
        assembly: AssemblyId,
        namespace: &str,
        name: &str,
        base: Option<TypeRef>,
    ) -> TypeId {
        let id = TypeId(self.types.len());
        self.types.push(TypeDef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            assembly,
            base,
            fields: Vec::new(),
            constructors: Vec::new(),
            methods: Vec::new(),
        });
        self.assemblies[assembly.0].types.push(id);
        id
    }

    pub fn add_field(&mut self, ty: TypeId, name: &str, field_type: Option<TypeRef>) {
        self.add_inherited_field(ty, ty, name, field_type);
    }

    /// Appends a slot to the layout of `ty` for a field declared by
    /// `declaring`, one of its base types.
    pub fn add_inherited_field(
        &mut self,
        ty: TypeId,
        declaring: TypeId,
        name: &str,
        field_type: Option<TypeRef>,
    ) {
        self.types[ty.0].fields.push(Field {
            name: name.to_string(),
            declaring_type: declaring,
            field_type,
        });
    }

    pub fn add_callable(&mut self, callable: Callable) -> CallableId {
        let id = CallableId(self.callables.len());
        let ty = &mut self.types[callable.declaring_type.0];
        if callable.is_constructor() {
            ty.constructors.push(id);
        } else {
            ty.methods.push(id);
        }
        self.callables.push(callable);
        id
    }

    pub fn assembly(&self, id: AssemblyId) -> &Assembly {
        &self.assemblies[id.0]
    }

    pub fn assemblies(&self) -> impl Iterator<Item = &Assembly> {
        self.assemblies.iter()
    }

    pub fn ty(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0]
    }

    pub fn callable(&self, id: CallableId) -> &Callable {
        &self.callables[id.0]
    }

    /// Reference describing a catalog type.
    pub fn type_ref(&self, id: TypeId) -> TypeRef {
        let ty = self.ty(id);
        TypeRef::new(&self.assembly(ty.assembly).name, &ty.namespace, &ty.name)
    }

    pub fn full_name(&self, id: TypeId) -> String {
        self.type_ref(id).full_name()
    }

    /// `Namespace.Type::Member`, for logs and error messages.
    pub fn callable_name(&self, id: CallableId) -> String {
        let callable = self.callable(id);
        format!("{}::{}", self.full_name(callable.declaring_type), callable.name())
    }

    pub fn find_assembly(&self, name: &str) -> Option<AssemblyId> {
        let name = normalize_assembly_name(name);
        self.assemblies
            .iter()
            .position(|a| a.name == name)
            .map(AssemblyId)
    }

    /// Resolves a type reference by owning assembly, then type name.
    pub fn resolve_type(&self, reference: &TypeRef) -> Result<TypeId, ResolveError> {
        if reference.is_array() {
            return self.resolve_type(&TypeRef::framework("System", "Array"));
        }
        let assembly = self
            .find_assembly(&reference.assembly)
            .ok_or_else(|| ResolveError::Assembly(reference.assembly.clone()))?;
        self.assembly(assembly)
            .types
            .iter()
            .copied()
            .find(|&id| {
                let ty = self.ty(id);
                ty.name == reference.name && ty.namespace == reference.namespace
            })
            .ok_or_else(|| ResolveError::Type {
                assembly: reference.assembly.clone(),
                name: reference.full_name(),
            })
    }

    /// Resolves a method reference: constructors by parameter types,
    /// methods by name with the parameter count picking among overloads.
    pub fn resolve_callable(&self, reference: &MethodRef) -> Result<CallableId, ResolveError> {
        let ty = self.resolve_type(&reference.declaring_type)?;
        let def = self.ty(ty);
        let found = if reference.is_constructor() {
            def.constructors.iter().copied().find(|&id| {
                self.callable(id).parameter_types == reference.signature.parameters
            })
        } else {
            let arity = reference.signature.parameters.len();
            let mut named = def
                .methods
                .iter()
                .copied()
                .filter(|&id| self.callable(id).name() == reference.name);
            let first = named.clone().next();
            named
                .find(|&id| self.callable(id).parameter_types.len() == arity)
                .or(first)
        };
        found.ok_or_else(|| ResolveError::Member {
            type_name: reference.declaring_type.full_name(),
            member: reference.name.clone(),
        })
    }

    /// Slot index of a field in the layout of `ty`.
    pub fn field_slot(&self, ty: TypeId, name: &str) -> Result<usize, HeapError> {
        self.ty(ty)
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| HeapError::UnknownField {
                type_name: self.full_name(ty),
                field: name.to_string(),
            })
    }

    /// Base type of `ty`, when it is part of the catalog.
    pub fn base_of(&self, ty: TypeId) -> Option<TypeId> {
        self.ty(ty)
            .base
            .as_ref()
            .and_then(|base| self.resolve_type(base).ok())
            .filter(|&base| base != ty)
    }

    /// `ty` followed by its base types, most derived first. A walk that
    /// comes back to a type already seen stops there.
    pub fn ancestry(&self, ty: TypeId) -> Vec<TypeId> {
        let mut chain = vec![ty];
        while let Some(base) = chain.last().and_then(|&t| self.base_of(t)) {
            if chain.contains(&base) {
                break;
            }
            chain.push(base);
        }
        chain
    }

    /// Whether following the base types of `ty` leads back to a type
    /// already on the chain.
    pub fn has_cyclic_base(&self, ty: TypeId) -> bool {
        let chain = self.ancestry(ty);
        chain
            .last()
            .and_then(|&t| self.base_of(t))
            .is_some_and(|base| chain.contains(&base))
    }

    /// Whether an instance of `from` may be used where `to` is expected.
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        if self.ancestry(from).contains(&to) {
            return true;
        }
        // Everything derives from System.Object.
        self.full_name(to) == "System.Object" && self.assembly(self.ty(to).assembly).is_builtin
    }

    /// Most derived implementation of `name`/`arity` visible from `ty`.
    pub fn find_override(&self, ty: TypeId, name: &str, arity: usize) -> Option<CallableId> {
        self.ancestry(ty).into_iter().find_map(|ty| {
            self.ty(ty).methods.iter().copied().find(|&id| {
                let callable = self.callable(id);
                callable.name() == name
                    && callable.parameter_types.len() == arity
                    && !callable.is_abstract()
            })
        })
    }

    /// The first static `Main` of a non-framework assembly.
    pub fn entry_point(&self) -> Option<CallableId> {
        self.assemblies
            .iter()
            .filter(|a| !a.is_builtin)
            .flat_map(|a| a.types.iter())
            .flat_map(|&ty| self.ty(ty).methods.iter())
            .copied()
            .find(|&id| {
                let callable = self.callable(id);
                callable.is_static && callable.name() == "Main"
            })
    }
}
