//! Uniform view over compiled .NET type metadata.
//!
//! The decompiler never touches a backend directly. It walks types through
//! the [`CilType`] family of traits, which are implemented twice:
//!
//! - [`clr`]: a reflection-style backend over managed assembly records
//! - [`il2cpp`]: an AOT backend over IL2CPP metadata tables, decoding custom
//!   attributes with [`crate::attribute`]
//!
//! Both backends intern their type handles per loader, so two handles for the
//! same underlying type compare equal and hash identically.

pub mod clr;
pub mod dump;
pub mod il2cpp;

use crate::attribute::AttributeValue;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::cell::OnceCell;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;

pub use dump::MetadataDump;

/// Full name and owning assembly of `Google.Protobuf.IMessage`
pub const MESSAGE_MARKER: (&str, &str) = ("Google.Protobuf.IMessage", "Google.Protobuf");

/// Full name and owning assembly of the gRPC client base class
pub const CLIENT_BASE: (&str, &str) = ("Grpc.Core.ClientBase", "Grpc.Core.Api");

/// Full name and owning assembly of the gRPC server binding marker attribute
pub const BIND_SERVICE_METHOD_ATTRIBUTE: (&str, &str) =
    ("Grpc.Core.BindServiceMethodAttribute", "Grpc.Core.Api");

/// A compile-time constant stored on a literal field
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", content = "value")]
#[allow(missing_docs)]
pub enum ConstantValue {
    Bool(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    String(String),
    Null,
}

impl ConstantValue {
    /// Returns the value if it is a 32-bit signed integer
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I4(v) => Some(*v),
            _ => None,
        }
    }
}

/// A type handle.
///
/// Handles are cheap to clone and are interned by their loader: equality and
/// hashing follow the identity of the underlying type.
pub trait CilType: Clone + Eq + Hash + Debug {
    /// Field handle type of this backend
    type Field: CilField<Attribute = Self::Attribute>;
    /// Method handle type of this backend
    type Method: CilMethod<Type = Self, Attribute = Self::Attribute>;
    /// Property handle type of this backend
    type Property: CilProperty<Type = Self, Method = Self::Method, Attribute = Self::Attribute>;
    /// Attribute handle type of this backend
    type Attribute: CilAttribute<Type = Self>;

    /// Simple name, including any generic arity suffix (`` RepeatedField`1 ``)
    fn name(&self) -> &str;
    /// Fully-qualified name; unique per loader
    fn full_name(&self) -> &str;
    /// Namespace, if any
    fn namespace(&self) -> Option<&str>;
    /// Name of the assembly that defines this type
    fn declaring_assembly_name(&self) -> &str;
    /// Name of the module that defines this type
    fn declaring_module_name(&self) -> &str;
    /// Enclosing type of a nested type
    fn declaring_type(&self) -> Option<Self>;
    /// Direct base type
    fn base_type(&self) -> Option<Self>;

    /// `abstract` flag
    fn is_abstract(&self) -> bool;
    /// Reference type that is neither an interface nor a value type
    fn is_class(&self) -> bool;
    /// Enum type
    fn is_enum(&self) -> bool;
    /// Declared inside another type
    fn is_nested(&self) -> bool;
    /// `sealed` flag
    fn is_sealed(&self) -> bool;

    /// Generic arguments of a constructed generic type; empty otherwise
    fn generic_type_arguments(&self) -> Vec<Self>;
    /// Custom attributes applied to the type
    fn custom_attributes(&self) -> Result<Vec<Self::Attribute>>;
    /// Fields in declaration order
    fn fields(&self) -> Vec<Self::Field>;
    /// Methods in declaration order, followed by inherited ones
    fn methods(&self) -> Vec<Self::Method>;
    /// Types declared inside this type
    fn nested_types(&self) -> Vec<Self>;
    /// Properties in declaration order
    fn properties(&self) -> Vec<Self::Property>;
    /// Whether a value of this type can be assigned to `other`
    fn is_assignable_to(&self, other: &Self) -> bool;
}

/// A field handle
pub trait CilField {
    /// Attribute handle type of this backend
    type Attribute: CilAttribute;

    /// Field name
    fn name(&self) -> &str;
    /// Constant value of a literal field
    fn constant_value(&self) -> Option<ConstantValue>;
    /// `const` (or enum member)
    fn is_literal(&self) -> bool;
    /// Public visibility
    fn is_public(&self) -> bool;
    /// Static field
    fn is_static(&self) -> bool;
    /// Custom attributes applied to the field
    fn custom_attributes(&self) -> Result<Vec<Self::Attribute>>;
}

/// A method handle
pub trait CilMethod {
    /// Type handle type of this backend
    type Type: CilType;
    /// Attribute handle type of this backend
    type Attribute: CilAttribute;

    /// Method name
    fn name(&self) -> &str;
    /// Instance or static constructor
    fn is_constructor(&self) -> bool;
    /// Declared on a base type rather than the type it was enumerated from
    fn is_inherited(&self) -> bool;
    /// Public visibility
    fn is_public(&self) -> bool;
    /// Static method
    fn is_static(&self) -> bool;
    /// Virtual method
    fn is_virtual(&self) -> bool;
    /// Return type
    fn return_type(&self) -> Self::Type;
    /// Parameter types in order
    fn parameter_types(&self) -> Vec<Self::Type>;
    /// Custom attributes applied to the method
    fn custom_attributes(&self) -> Result<Vec<Self::Attribute>>;
}

/// A property handle
pub trait CilProperty {
    /// Type handle type of this backend
    type Type: CilType;
    /// Method handle type of this backend
    type Method: CilMethod<Type = Self::Type>;
    /// Attribute handle type of this backend
    type Attribute: CilAttribute;

    /// Property name
    fn name(&self) -> &str;
    /// Property type
    fn property_type(&self) -> Self::Type;
    /// Declared on a base type
    fn is_inherited(&self) -> bool;
    /// Has a getter
    fn can_read(&self) -> bool;
    /// Has a setter
    fn can_write(&self) -> bool;
    /// Getter method
    fn getter(&self) -> Option<Self::Method>;
    /// Setter method
    fn setter(&self) -> Option<Self::Method>;
    /// Custom attributes applied to the property
    fn custom_attributes(&self) -> Result<Vec<Self::Attribute>>;
}

/// A custom attribute instance
pub trait CilAttribute {
    /// Type handle type of this backend
    type Type: CilType;

    /// The attribute class
    fn attribute_type(&self) -> Self::Type;
    /// False only for legacy IL2CPP metadata, which stores attribute types alone
    fn can_read_constructor_arguments(&self) -> bool;
    /// Constructor argument values.
    ///
    /// Fails with [`Error::AttributeArgumentsUnavailable`] when
    /// [`can_read_constructor_arguments`](Self::can_read_constructor_arguments) is false.
    fn constructor_arguments(&self) -> Result<&[AttributeValue]>;
}

/// Lazily resolved well-known support types, one slot per marker
#[derive(Debug)]
pub struct WellKnownTypes<T> {
    message_marker: OnceCell<T>,
    client_base: OnceCell<T>,
    bind_service_method_attribute: OnceCell<T>,
}

impl<T> Default for WellKnownTypes<T> {
    fn default() -> Self {
        Self {
            message_marker: OnceCell::new(),
            client_base: OnceCell::new(),
            bind_service_method_attribute: OnceCell::new(),
        }
    }
}

/// A loaded set of types plus access to the support assemblies they reference.
pub trait CilAssemblyLoader {
    /// Type handle type of this backend
    type Type: CilType;

    /// Every type of the target assemblies, in load order
    fn loaded_types(&self) -> &[Self::Type];

    /// Loads `full_name` from the assembly with simple name `assembly`
    fn find_type(&self, full_name: &str, assembly: &str) -> Result<Self::Type>;

    /// Cache slots for the well-known support types
    fn well_known(&self) -> &WellKnownTypes<Self::Type>;

    /// Resolves a support type: loaded types first, then the owning assembly
    fn resolve_well_known(&self, (full_name, assembly): (&str, &str)) -> Result<Self::Type> {
        if let Some(found) = self
            .loaded_types()
            .iter()
            .find(|ty| ty.full_name() == full_name)
        {
            return Ok(found.clone());
        }

        debug!(full_name, assembly, "loading support assembly for well-known type");
        self.find_type(full_name, assembly)
    }

    /// `Google.Protobuf.IMessage`
    fn message_marker(&self) -> Result<Self::Type> {
        cached(&self.well_known().message_marker, || {
            self.resolve_well_known(MESSAGE_MARKER)
        })
    }

    /// `Grpc.Core.ClientBase`
    fn client_base(&self) -> Result<Self::Type> {
        cached(&self.well_known().client_base, || {
            self.resolve_well_known(CLIENT_BASE)
        })
    }

    /// `Grpc.Core.BindServiceMethodAttribute`
    fn bind_service_method_attribute(&self) -> Result<Self::Type> {
        cached(&self.well_known().bind_service_method_attribute, || {
            self.resolve_well_known(BIND_SERVICE_METHOD_ATTRIBUTE)
        })
    }

    /// Top-level sealed types implementing the message marker.
    ///
    /// Types from the protobuf runtime itself are excluded.
    fn message_types(&self) -> Result<Vec<Self::Type>> {
        let marker = self.message_marker()?;
        Ok(self
            .loaded_types()
            .iter()
            .filter(|ty| {
                !ty.is_nested()
                    && ty.is_sealed()
                    && !ty
                        .namespace()
                        .is_some_and(|ns| ns.starts_with("Google.Protobuf"))
                    && ty.is_assignable_to(&marker)
            })
            .cloned()
            .collect())
    }

    /// Nested concrete types deriving from the gRPC client base
    fn service_client_types(&self) -> Result<Vec<Self::Type>> {
        let client_base = self.client_base()?;
        Ok(self
            .loaded_types()
            .iter()
            .filter(|ty| ty.is_nested() && !ty.is_abstract() && ty.is_assignable_to(&client_base))
            .cloned()
            .collect())
    }

    /// Nested abstract service bases on a static holder that carry the bind marker
    fn service_server_types(&self) -> Result<Vec<Self::Type>> {
        let marker = self.bind_service_method_attribute()?;
        let mut servers = Vec::new();

        for ty in self.loaded_types() {
            if !ty.is_nested() || !ty.is_abstract() {
                continue;
            }
            let Some(holder) = ty.declaring_type() else {
                continue;
            };
            if !(holder.is_sealed() && holder.is_abstract()) {
                continue;
            }
            if ty
                .custom_attributes()?
                .iter()
                .any(|attr| attr.attribute_type() == marker)
            {
                servers.push(ty.clone());
            }
        }

        Ok(servers)
    }
}

fn cached<T: Clone>(cell: &OnceCell<T>, resolve: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(value) = cell.get() {
        return Ok(value.clone());
    }
    let value = resolve()?;
    Ok(cell.get_or_init(|| value).clone())
}

/// Name of the outermost segment of a CLR type full name, without namespace.
///
/// Both backends store full names; this splits them back into namespace and
/// simple name for types that are only known by reference.
pub(crate) fn split_full_name(full_name: &str) -> (Option<&str>, &str) {
    let base = full_name.split('[').next().unwrap_or(full_name);
    let outer_end = base.find(['+', '/']).unwrap_or(base.len());
    let simple_start = base.rfind(['+', '/']).map(|i| i + 1);

    match (base[..outer_end].rfind('.'), simple_start) {
        (Some(dot), Some(start)) => (Some(&base[..dot]), &base[start..]),
        (Some(dot), None) => (Some(&base[..dot]), &base[dot + 1..]),
        (None, Some(start)) => (None, &base[start..]),
        (None, None) => (None, base),
    }
}

pub(crate) fn missing_type(full_name: &str, assembly: &str) -> Error {
    Error::missing_well_known(full_name, assembly)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_full_name() {
        assert_eq!(split_full_name("System.Int32"), (Some("System"), "Int32"));
        assert_eq!(split_full_name("Foo.Bar+Types+Baz"), (Some("Foo"), "Baz"));
        assert_eq!(split_full_name("Outer/Inner"), (None, "Inner"));
        assert_eq!(split_full_name("Plain"), (None, "Plain"));
        assert_eq!(
            split_full_name("Google.Protobuf.Collections.MapField`2[[System.String],[System.Int32]]"),
            (Some("Google.Protobuf.Collections"), "MapField`2")
        );
    }

    #[test]
    fn test_constant_as_i32() {
        assert_eq!(ConstantValue::I4(7).as_i32(), Some(7));
        assert_eq!(ConstantValue::I8(7).as_i32(), None);
    }

    #[test]
    fn test_constant_deserialize() {
        let v: ConstantValue = serde_json::from_str(r#"{"kind":"I4","value":5}"#).unwrap();
        assert_eq!(v, ConstantValue::I4(5));
        let v: ConstantValue = serde_json::from_str(r#"{"kind":"Null"}"#).unwrap();
        assert_eq!(v, ConstantValue::Null);
    }
}
