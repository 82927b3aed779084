//! Module loading: the [`ModuleSource`] interface the runtime loads types
//! from, and [`ModuleImage`], a JSON serialized module that implements it.
use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::decoder::{disassemble, Decoder, MetadataResolver};
use crate::error::{DecodeError, ResolveError};
use crate::instruction::MethodBody;
use crate::metadata::{normalize_assembly_name, FieldRef, MethodRef, Signature, TypeRef};

/// A type as a module source describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    pub namespace: String,
    pub name: String,
    pub base: Option<TypeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: Option<TypeRef>,
}

/// A method or constructor with its decoded body.
#[derive(Debug, Clone)]
pub struct CallableInfo {
    pub name: String,
    pub signature: Signature,
    pub is_abstract: bool,
    pub is_virtual: bool,
    pub body: MethodBody,
}

/// Anything the runtime can load types from. Sources hand out the engine's
/// own shapes; how they walk their underlying format is their business.
pub trait ModuleSource {
    fn assembly_name(&self) -> String;

    fn list_types(&self) -> Vec<TypeInfo>;

    /// Fields declared by `ty` itself, in layout order.
    fn list_fields(&self, ty: &TypeInfo) -> Result<Vec<FieldInfo>, DecodeError>;

    fn list_constructors(&self, ty: &TypeInfo) -> Result<Vec<CallableInfo>, DecodeError>;

    fn list_methods(&self, ty: &TypeInfo) -> Result<Vec<CallableInfo>, DecodeError>;
}

/// Metadata token, written as `0x70000001` in images.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => text.parse().ok()?,
        };
        Some(Self(value))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TokenVisitor;

        impl Visitor<'_> for TokenVisitor {
            type Value = Token;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a metadata token such as \"0x0A000001\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Token, E> {
                Token::parse(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Token, E> {
                u32::try_from(v)
                    .map(Token)
                    .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
            }
        }

        deserializer.deserialize_str(TokenVisitor)
    }
}

/// A referenced member, keyed by token in [`ModuleImage::members`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MemberImage {
    Field {
        #[serde(rename = "type")]
        declaring_type: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field_type: Option<String>,
    },
    Method {
        #[serde(rename = "type")]
        declaring_type: String,
        name: String,
        signature: String,
    },
    Type {
        #[serde(rename = "type")]
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodImage {
    #[serde(default = "constructor_name")]
    pub name: String,
    pub signature: String,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    #[serde(default)]
    pub code: Vec<u8>,
}

fn constructor_name() -> String {
    ".ctor".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeImage {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub extends: Option<String>,
    /// `"<type> <name>"` entries.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub constructors: Vec<MethodImage>,
    #[serde(default)]
    pub methods: Vec<MethodImage>,
}

/// Serialized module: type definitions with raw method bodies, plus the
/// token tables those bodies refer to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    #[serde(default)]
    pub types: Vec<TypeImage>,
    #[serde(default)]
    pub strings: BTreeMap<Token, String>,
    #[serde(default)]
    pub members: BTreeMap<Token, MemberImage>,
}

impl ModuleImage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn assembly(&self) -> String {
        normalize_assembly_name(&self.name)
    }

    fn type_image(&self, ty: &TypeInfo) -> Option<&TypeImage> {
        self.types
            .iter()
            .find(|t| t.namespace == ty.namespace && t.name == ty.name)
    }

    fn callables(&self, methods: &[MethodImage]) -> Result<Vec<CallableInfo>, DecodeError> {
        let assembly = self.assembly();
        let decoder = Decoder::new(self);
        methods
            .iter()
            .map(|m| {
                Ok(CallableInfo {
                    name: m.name.clone(),
                    signature: Signature::parse(&m.signature, &assembly)?,
                    is_abstract: m.is_abstract,
                    is_virtual: m.is_virtual,
                    body: decoder.decode_body(&m.code)?,
                })
            })
            .collect()
    }

    /// Listing of every method body, one block per method. Tokens that do
    /// not resolve are shown as unsupported rather than failing.
    pub fn listing(&self) -> Result<String, DecodeError> {
        let mut blocks = Vec::new();
        for ty in &self.types {
            let full_name = if ty.namespace.is_empty() {
                ty.name.clone()
            } else {
                format!("{}.{}", ty.namespace, ty.name)
            };
            for m in ty.constructors.iter().chain(&ty.methods) {
                let mut block = format!(".method {full_name}::{} {}", m.name, m.signature);
                let body = disassemble(&m.code, self)?;
                if !body.is_empty() {
                    block.push('\n');
                    block.push_str(&body);
                }
                blocks.push(block);
            }
        }
        Ok(blocks.join("\n\n"))
    }

    fn member(&self, token: u32) -> Result<&MemberImage, ResolveError> {
        self.members
            .get(&Token(token))
            .ok_or(ResolveError::UnknownToken(token))
    }

    fn method_ref(&self, token: u32) -> Result<MethodRef, ResolveError> {
        match self.member(token)? {
            MemberImage::Method {
                declaring_type,
                name,
                signature,
            } => {
                let assembly = self.assembly();
                Ok(MethodRef {
                    declaring_type: TypeRef::parse(declaring_type, &assembly)?,
                    name: name.clone(),
                    signature: Signature::parse(signature, &assembly)?,
                })
            }
            _ => Err(ResolveError::WrongTokenKind {
                token,
                expected: "method",
            }),
        }
    }
}

impl MetadataResolver for ModuleImage {
    fn resolve_string(&self, token: u32) -> Result<String, ResolveError> {
        self.strings
            .get(&Token(token))
            .cloned()
            .ok_or(ResolveError::UnknownToken(token))
    }

    fn resolve_field(&self, token: u32) -> Result<FieldRef, ResolveError> {
        match self.member(token)? {
            MemberImage::Field {
                declaring_type,
                name,
                field_type,
            } => {
                let assembly = self.assembly();
                Ok(FieldRef {
                    declaring_type: TypeRef::parse(declaring_type, &assembly)?,
                    name: name.clone(),
                    field_type: field_type
                        .as_deref()
                        .map(|t| TypeRef::parse(t, &assembly))
                        .transpose()?,
                })
            }
            _ => Err(ResolveError::WrongTokenKind {
                token,
                expected: "field",
            }),
        }
    }

    /// Plain methods only; constructors go through `resolve_member`.
    fn resolve_method(&self, token: u32) -> Result<MethodRef, ResolveError> {
        let method = self.method_ref(token)?;
        if method.is_constructor() {
            return Err(ResolveError::WrongTokenKind {
                token,
                expected: "method",
            });
        }
        Ok(method)
    }

    fn resolve_member(&self, token: u32) -> Result<MethodRef, ResolveError> {
        self.method_ref(token)
    }

    fn resolve_type(&self, token: u32) -> Result<TypeRef, ResolveError> {
        match self.member(token)? {
            MemberImage::Type { name } => TypeRef::parse(name, &self.assembly()),
            _ => Err(ResolveError::WrongTokenKind {
                token,
                expected: "type",
            }),
        }
    }
}

impl ModuleSource for ModuleImage {
    fn assembly_name(&self) -> String {
        self.assembly()
    }

    fn list_types(&self) -> Vec<TypeInfo> {
        let assembly = self.assembly();
        self.types
            .iter()
            .map(|t| TypeInfo {
                namespace: t.namespace.clone(),
                name: t.name.clone(),
                base: t
                    .extends
                    .as_deref()
                    .and_then(|base| TypeRef::parse(base, &assembly).ok()),
            })
            .collect()
    }

    fn list_fields(&self, ty: &TypeInfo) -> Result<Vec<FieldInfo>, DecodeError> {
        let Some(image) = self.type_image(ty) else {
            return Ok(Vec::new());
        };
        let assembly = self.assembly();
        image
            .fields
            .iter()
            .map(|text| {
                let text = text.trim();
                Ok(match text.rsplit_once(char::is_whitespace) {
                    Some((field_type, name)) => FieldInfo {
                        name: name.to_string(),
                        field_type: Some(TypeRef::parse(field_type, &assembly)?),
                    },
                    None => FieldInfo {
                        name: text.to_string(),
                        field_type: None,
                    },
                })
            })
            .collect()
    }

    fn list_constructors(&self, ty: &TypeInfo) -> Result<Vec<CallableInfo>, DecodeError> {
        match self.type_image(ty) {
            Some(image) => self.callables(&image.constructors),
            None => Ok(Vec::new()),
        }
    }

    fn list_methods(&self, ty: &TypeInfo) -> Result<Vec<CallableInfo>, DecodeError> {
        match self.type_image(ty) {
            Some(image) => self.callables(&image.methods),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::path::Path;

    fn load_fixture(name: &str) -> ModuleImage {
        let env_var = env::var("CARGO_MANIFEST_DIR").unwrap();
        let path = Path::new(&env_var).join("support").join(name);
        ModuleImage::from_json(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn can_load_image() {
        let image = load_fixture("hello.json");
        assert_eq!(image.assembly_name(), "Hello");
        let types = image.list_types();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].base, Some(TypeRef::framework("System", "Object")));
        let methods = image.list_methods(&types[0]).unwrap();
        assert_eq!(methods[0].name, "Main");
        assert!(methods[0].signature.is_static);
        assert_eq!(
            methods[0].body.to_string(),
            "IL_0000: ldstr \"Hello, World!\"\n\
             IL_0005: call System.Void System.Console::WriteLine()\n\
             IL_0010: ret"
        );
    }

    #[test]
    fn resolves_tokens() {
        let image = load_fixture("hello.json");
        assert_eq!(image.resolve_string(0x7000_0001).unwrap(), "Hello, World!");
        assert!(image.resolve_method(0x0A00_0001).is_ok());
        assert_eq!(
            image.resolve_field(0x0A00_0001),
            Err(ResolveError::WrongTokenKind {
                token: 0x0A00_0001,
                expected: "field"
            })
        );
        assert_eq!(
            image.resolve_string(0x7000_0099),
            Err(ResolveError::UnknownToken(0x7000_0099))
        );
    }

    #[test]
    fn constructors_resolve_as_members() {
        let mut image = ModuleImage {
            name: "Sample.exe".into(),
            ..Default::default()
        };
        image.members.insert(
            Token(0x0A00_0002),
            MemberImage::Method {
                declaring_type: "[mscorlib]System.Object".into(),
                name: ".ctor".into(),
                signature: "()void".into(),
            },
        );
        assert!(image.resolve_method(0x0A00_0002).is_err());
        let ctor = image.resolve_member(0x0A00_0002).unwrap();
        assert!(ctor.is_constructor());
        assert_eq!(ctor.declaring_type.assembly, "mscorlib");
    }

    #[test]
    fn parses_fields_and_tokens() {
        let image = ModuleImage::from_json(
            r#"{
                "name": "Sample.exe",
                "types": [{ "namespace": "Sample", "name": "Node",
                            "fields": ["int32 count", "Sample.Node[] children", "tag"] }],
                "strings": { "0x70000001": "a", "1879048194": "b" }
            }"#,
        )
        .unwrap();
        let ty = &image.list_types()[0];
        let fields = image.list_fields(ty).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].field_type, Some(TypeRef::framework("System", "Int32")));
        assert!(fields[1].field_type.as_ref().unwrap().is_array());
        assert_eq!(fields[2].field_type, None);
        assert_eq!(image.resolve_string(0x7000_0002).unwrap(), "b");
    }
}
