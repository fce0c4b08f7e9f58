//! Reflection-style backend over managed assembly records.
//!
//! An external loader (a reflection host, a metadata reader) exports each
//! assembly as a [`ClrAssembly`] record. [`ClrLoader`] indexes the target
//! assemblies plus any referenced support assemblies and hands out interned
//! [`ClrType`] handles. Types are named the way reflection names them:
//! nested types join their declaring type with `+`, constructed generics carry
//! their arguments in brackets (`` MapField`2[[System.String],[System.Int32]] ``).

use super::{
    missing_type, split_full_name, CilAssemblyLoader, CilAttribute, CilField, CilMethod,
    CilProperty, CilType, ConstantValue, WellKnownTypes,
};
use crate::attribute::AttributeValue;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use tracing::{debug, info, trace};

// Guards recursive walks over inheritance and nesting chains against cyclic input.
const MAX_CHAIN_DEPTH: usize = 64;

/// One exported assembly
#[derive(Debug, Clone, Deserialize)]
pub struct ClrAssembly {
    /// Simple assembly name (`Google.Protobuf`)
    pub name: String,
    /// Module file name; defaults to the assembly name
    #[serde(default)]
    pub module: Option<String>,
    /// Every type defined in the assembly, nested types included
    #[serde(default)]
    pub types: Vec<ClrTypeDef>,
}

/// A type definition
#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct ClrTypeDef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Full name of the enclosing type, for nested types
    #[serde(default)]
    pub declaring_type: Option<String>,
    #[serde(default)]
    pub base_type: Option<TypeRef>,
    #[serde(default)]
    pub interfaces: Vec<TypeRef>,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_sealed: bool,
    #[serde(default)]
    pub is_enum: bool,
    #[serde(default)]
    pub is_interface: bool,
    #[serde(default)]
    pub is_value_type: bool,
    #[serde(default)]
    pub fields: Vec<ClrFieldDef>,
    #[serde(default)]
    pub methods: Vec<ClrMethodDef>,
    #[serde(default)]
    pub properties: Vec<ClrPropertyDef>,
    #[serde(default)]
    pub attributes: Vec<ClrAttributeData>,
}

/// A reference to a (possibly constructed generic) type.
///
/// Deserializes from either a bare full name or `{ "name": .., "args": [..] }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "TypeRefRepr")]
pub struct TypeRef {
    /// Full name of the type definition
    pub name: String,
    /// Generic arguments of a constructed type
    pub args: Vec<TypeRef>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TypeRefRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        args: Vec<TypeRef>,
    },
}

impl From<TypeRefRepr> for TypeRef {
    fn from(repr: TypeRefRepr) -> Self {
        match repr {
            TypeRefRepr::Name(name) => Self::named(name),
            TypeRefRepr::Full { name, args } => Self { name, args },
        }
    }
}

impl TypeRef {
    /// A reference to a non-generic type
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// A reference to a constructed generic type
    pub fn generic(name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Reflection-style display name, unique per constructed type
    pub fn key(&self) -> String {
        if self.args.is_empty() {
            return self.name.clone();
        }
        let args: Vec<String> = self.args.iter().map(|a| format!("[{}]", a.key())).collect();
        format!("{}[{}]", self.name, args.join(","))
    }
}

fn void_type() -> TypeRef {
    TypeRef::named("System.Void")
}

/// A field definition
#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct ClrFieldDef {
    pub name: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_literal: bool,
    #[serde(default)]
    pub constant: Option<ConstantValue>,
    #[serde(default)]
    pub attributes: Vec<ClrAttributeData>,
}

/// A method definition
#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct ClrMethodDef {
    pub name: String,
    #[serde(default = "void_type")]
    pub return_type: TypeRef,
    #[serde(default)]
    pub parameters: Vec<TypeRef>,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub attributes: Vec<ClrAttributeData>,
}

/// A property definition; accessors name methods of the same type
#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct ClrPropertyDef {
    pub name: String,
    pub property_type: TypeRef,
    #[serde(default)]
    pub getter: Option<String>,
    #[serde(default)]
    pub setter: Option<String>,
    #[serde(default)]
    pub attributes: Vec<ClrAttributeData>,
}

/// A custom attribute with its constructor arguments already decoded
#[derive(Debug, Clone, Deserialize)]
pub struct ClrAttributeData {
    /// Full name of the attribute class
    pub attribute_type: String,
    /// Constructor argument values
    #[serde(default)]
    pub arguments: Vec<AttributeValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DefLoc {
    assembly: usize,
    index: usize,
}

struct ClrContext {
    assemblies: Vec<ClrAssembly>,
    target_count: usize,
    by_name: HashMap<String, DefLoc>,
    nested: HashMap<String, Vec<DefLoc>>,
    interned: RefCell<HashMap<String, Rc<ClrTypeData>>>,
}

#[derive(Debug)]
struct ClrTypeData {
    full_name: String,
    name: String,
    namespace: Option<String>,
    def: Option<DefLoc>,
    generic_args: Vec<TypeRef>,
}

impl ClrContext {
    fn def(&self, loc: DefLoc) -> &ClrTypeDef {
        &self.assemblies[loc.assembly].types[loc.index]
    }

    fn def_full_name(def: &ClrTypeDef) -> String {
        match (&def.declaring_type, &def.namespace) {
            (Some(outer), _) => format!("{}+{}", outer, def.name),
            (None, Some(ns)) if !ns.is_empty() => format!("{}.{}", ns, def.name),
            _ => def.name.clone(),
        }
    }

    // Nested types share the namespace of their outermost declaring type.
    fn namespace_of(&self, loc: DefLoc) -> Option<String> {
        let mut def = self.def(loc);
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(outer) = def
                .declaring_type
                .as_ref()
                .and_then(|name| self.by_name.get(name))
            else {
                break;
            };
            def = self.def(*outer);
        }
        def.namespace.clone().filter(|ns| !ns.is_empty())
    }
}

fn resolve(ctx: &Rc<ClrContext>, type_ref: &TypeRef) -> ClrType {
    let key = type_ref.key();
    if let Some(data) = ctx.interned.borrow().get(&key) {
        return ClrType {
            ctx: Rc::clone(ctx),
            data: Rc::clone(data),
        };
    }

    let def = ctx.by_name.get(&type_ref.name).copied();
    let (name, namespace) = match def {
        Some(loc) => (ctx.def(loc).name.clone(), ctx.namespace_of(loc)),
        None => {
            let (ns, name) = split_full_name(&type_ref.name);
            (name.to_owned(), ns.map(str::to_owned))
        }
    };

    trace!(key = %key, defined = def.is_some(), "interning clr type");
    let data = Rc::new(ClrTypeData {
        full_name: key.clone(),
        name,
        namespace,
        def,
        generic_args: type_ref.args.clone(),
    });
    ctx.interned.borrow_mut().insert(key, Rc::clone(&data));

    ClrType {
        ctx: Rc::clone(ctx),
        data,
    }
}

/// Loader over a set of target assemblies and their support references
pub struct ClrLoader {
    ctx: Rc<ClrContext>,
    loaded: Vec<ClrType>,
    well_known: WellKnownTypes<ClrType>,
}

impl fmt::Debug for ClrLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClrLoader")
            .field("assemblies", &self.ctx.assemblies.len())
            .field("loaded_types", &self.loaded.len())
            .finish()
    }
}

impl ClrLoader {
    /// Indexes `targets` (whose types are parsed) and `references` (consulted
    /// only to resolve types the targets mention).
    pub fn new(targets: Vec<ClrAssembly>, references: Vec<ClrAssembly>) -> Result<Self> {
        let target_count = targets.len();
        let assemblies: Vec<ClrAssembly> = targets.into_iter().chain(references).collect();

        let mut by_name = HashMap::new();
        let mut nested: HashMap<String, Vec<DefLoc>> = HashMap::new();

        for (assembly, asm) in assemblies.iter().enumerate() {
            for (index, def) in asm.types.iter().enumerate() {
                validate_accessors(asm, def)?;

                let loc = DefLoc { assembly, index };
                let full_name = ClrContext::def_full_name(def);
                if let Some(outer) = &def.declaring_type {
                    nested.entry(outer.clone()).or_default().push(loc);
                }
                if by_name.contains_key(&full_name) {
                    debug!(full_name = %full_name, assembly = %asm.name, "duplicate type definition ignored");
                    continue;
                }
                by_name.insert(full_name, loc);
            }
        }

        let ctx = Rc::new(ClrContext {
            assemblies,
            target_count,
            by_name,
            nested,
            interned: RefCell::new(HashMap::new()),
        });

        let mut loaded = Vec::new();
        for (assembly, asm) in ctx.assemblies[..target_count].iter().enumerate() {
            for (index, def) in asm.types.iter().enumerate() {
                let full_name = ClrContext::def_full_name(def);
                if ctx.by_name.get(&full_name) != Some(&DefLoc { assembly, index }) {
                    continue;
                }
                loaded.push(resolve(&ctx, &TypeRef::named(full_name)));
            }
        }

        info!(
            "Loaded {} types from {} assemblies for parsing.",
            loaded.len(),
            target_count
        );

        Ok(Self {
            ctx,
            loaded,
            well_known: WellKnownTypes::default(),
        })
    }

    /// Looks up a type by reflection name in any indexed assembly
    pub fn get_type(&self, full_name: &str) -> Option<ClrType> {
        self.ctx
            .by_name
            .contains_key(full_name)
            .then(|| resolve(&self.ctx, &TypeRef::named(full_name)))
    }

    /// Returns the handle for an arbitrary type reference
    pub fn resolve(&self, type_ref: &TypeRef) -> ClrType {
        resolve(&self.ctx, type_ref)
    }
}

fn validate_accessors(asm: &ClrAssembly, def: &ClrTypeDef) -> Result<()> {
    for prop in &def.properties {
        for accessor in [&prop.getter, &prop.setter].into_iter().flatten() {
            if !def.methods.iter().any(|m| &m.name == accessor) {
                return Err(Error::invalid_metadata(format!(
                    "property '{}' of '{}' in '{}' names missing accessor '{}'",
                    prop.name, def.name, asm.name, accessor
                )));
            }
        }
    }
    Ok(())
}

impl CilAssemblyLoader for ClrLoader {
    type Type = ClrType;

    fn loaded_types(&self) -> &[ClrType] {
        &self.loaded
    }

    fn find_type(&self, full_name: &str, assembly: &str) -> Result<ClrType> {
        let Some(asm_index) = self
            .ctx
            .assemblies
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(assembly))
        else {
            return Err(missing_type(full_name, assembly));
        };

        match self.ctx.by_name.get(full_name) {
            Some(loc) if loc.assembly == asm_index || loc.assembly < self.ctx.target_count => {
                Ok(resolve(&self.ctx, &TypeRef::named(full_name)))
            }
            _ => Err(missing_type(full_name, assembly)),
        }
    }

    fn well_known(&self) -> &WellKnownTypes<ClrType> {
        &self.well_known
    }
}

/// Interned type handle of the reflection-style backend
#[derive(Clone)]
pub struct ClrType {
    ctx: Rc<ClrContext>,
    data: Rc<ClrTypeData>,
}

impl PartialEq for ClrType {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for ClrType {}

impl Hash for ClrType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.full_name.hash(state);
    }
}

impl fmt::Debug for ClrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClrType").field(&self.data.full_name).finish()
    }
}

impl ClrType {
    fn def(&self) -> Option<&ClrTypeDef> {
        self.data.def.map(|loc| self.ctx.def(loc))
    }

    fn resolve(&self, type_ref: &TypeRef) -> ClrType {
        resolve(&self.ctx, type_ref)
    }

    // The type itself, then each defined base type.
    fn with_bases(&self) -> Vec<ClrType> {
        let mut chain = vec![self.clone()];
        while chain.len() < MAX_CHAIN_DEPTH {
            match chain.last().and_then(<ClrType as CilType>::base_type) {
                Some(base) if base.data.def.is_some() => chain.push(base),
                _ => break,
            }
        }
        chain
    }

    fn assignable(&self, other: &ClrType, depth: usize) -> bool {
        if self == other {
            return true;
        }
        if depth >= MAX_CHAIN_DEPTH {
            return false;
        }
        let Some(def) = self.def() else {
            return false;
        };
        def.interfaces
            .iter()
            .chain(def.base_type.iter())
            .any(|r| self.resolve(r).assignable(other, depth + 1))
    }
}

fn attributes(ctx: &Rc<ClrContext>, data: &[ClrAttributeData]) -> Vec<ClrAttribute> {
    data.iter()
        .map(|a| ClrAttribute {
            attribute_type: resolve(ctx, &TypeRef::named(a.attribute_type.as_str())),
            arguments: a.arguments.clone(),
        })
        .collect()
}

impl CilType for ClrType {
    type Field = ClrField;
    type Method = ClrMethod;
    type Property = ClrProperty;
    type Attribute = ClrAttribute;

    fn name(&self) -> &str {
        &self.data.name
    }

    fn full_name(&self) -> &str {
        &self.data.full_name
    }

    fn namespace(&self) -> Option<&str> {
        self.data.namespace.as_deref()
    }

    fn declaring_assembly_name(&self) -> &str {
        self.data
            .def
            .map_or("", |loc| self.ctx.assemblies[loc.assembly].name.as_str())
    }

    fn declaring_module_name(&self) -> &str {
        self.data.def.map_or("", |loc| {
            let asm = &self.ctx.assemblies[loc.assembly];
            asm.module.as_deref().unwrap_or(&asm.name)
        })
    }

    fn declaring_type(&self) -> Option<Self> {
        let outer = self.def()?.declaring_type.as_ref()?;
        Some(self.resolve(&TypeRef::named(outer.as_str())))
    }

    fn base_type(&self) -> Option<Self> {
        let base = self.def()?.base_type.as_ref()?;
        Some(self.resolve(base))
    }

    fn is_abstract(&self) -> bool {
        self.def().is_some_and(|d| d.is_abstract)
    }

    fn is_class(&self) -> bool {
        self.def()
            .map_or(true, |d| !d.is_interface && !d.is_value_type && !d.is_enum)
    }

    fn is_enum(&self) -> bool {
        self.def().is_some_and(|d| d.is_enum)
    }

    fn is_nested(&self) -> bool {
        self.def().is_some_and(|d| d.declaring_type.is_some())
    }

    fn is_sealed(&self) -> bool {
        self.def().is_some_and(|d| d.is_sealed)
    }

    fn generic_type_arguments(&self) -> Vec<Self> {
        self.data
            .generic_args
            .iter()
            .map(|arg| self.resolve(arg))
            .collect()
    }

    fn custom_attributes(&self) -> Result<Vec<ClrAttribute>> {
        Ok(self
            .def()
            .map(|d| attributes(&self.ctx, &d.attributes))
            .unwrap_or_default())
    }

    fn fields(&self) -> Vec<ClrField> {
        let Some(loc) = self.data.def else {
            return Vec::new();
        };
        (0..self.ctx.def(loc).fields.len())
            .map(|index| ClrField {
                ctx: Rc::clone(&self.ctx),
                loc,
                index,
            })
            .collect()
    }

    fn methods(&self) -> Vec<ClrMethod> {
        let mut methods = Vec::new();
        for (depth, ty) in self.with_bases().iter().enumerate() {
            let Some(loc) = ty.data.def else { continue };
            for (index, def) in self.ctx.def(loc).methods.iter().enumerate() {
                if depth > 0 && def.is_static {
                    continue;
                }
                methods.push(ClrMethod {
                    ctx: Rc::clone(&self.ctx),
                    loc,
                    index,
                    inherited: depth > 0,
                });
            }
        }
        methods
    }

    fn nested_types(&self) -> Vec<Self> {
        if self.data.def.is_none() {
            return Vec::new();
        }
        self.ctx
            .nested
            .get(&self.data.full_name)
            .into_iter()
            .flatten()
            .map(|loc| {
                let name = ClrContext::def_full_name(self.ctx.def(*loc));
                self.resolve(&TypeRef::named(name))
            })
            .collect()
    }

    fn properties(&self) -> Vec<ClrProperty> {
        let mut properties = Vec::new();
        for (depth, ty) in self.with_bases().iter().enumerate() {
            let Some(loc) = ty.data.def else { continue };
            for index in 0..self.ctx.def(loc).properties.len() {
                properties.push(ClrProperty {
                    ctx: Rc::clone(&self.ctx),
                    loc,
                    index,
                    inherited: depth > 0,
                });
            }
        }
        properties
    }

    fn is_assignable_to(&self, other: &Self) -> bool {
        self.assignable(other, 0)
    }
}

/// Field handle of the reflection-style backend
#[derive(Clone)]
pub struct ClrField {
    ctx: Rc<ClrContext>,
    loc: DefLoc,
    index: usize,
}

impl ClrField {
    fn def(&self) -> &ClrFieldDef {
        &self.ctx.def(self.loc).fields[self.index]
    }
}

impl fmt::Debug for ClrField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClrField").field(&self.def().name).finish()
    }
}

impl CilField for ClrField {
    type Attribute = ClrAttribute;

    fn name(&self) -> &str {
        &self.def().name
    }

    fn constant_value(&self) -> Option<ConstantValue> {
        self.def().constant.clone()
    }

    fn is_literal(&self) -> bool {
        self.def().is_literal
    }

    fn is_public(&self) -> bool {
        self.def().is_public
    }

    fn is_static(&self) -> bool {
        self.def().is_static
    }

    fn custom_attributes(&self) -> Result<Vec<ClrAttribute>> {
        Ok(attributes(&self.ctx, &self.def().attributes))
    }
}

/// Method handle of the reflection-style backend
#[derive(Clone)]
pub struct ClrMethod {
    ctx: Rc<ClrContext>,
    loc: DefLoc,
    index: usize,
    inherited: bool,
}

impl ClrMethod {
    fn def(&self) -> &ClrMethodDef {
        &self.ctx.def(self.loc).methods[self.index]
    }
}

impl fmt::Debug for ClrMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClrMethod").field(&self.def().name).finish()
    }
}

impl CilMethod for ClrMethod {
    type Type = ClrType;
    type Attribute = ClrAttribute;

    fn name(&self) -> &str {
        &self.def().name
    }

    fn is_constructor(&self) -> bool {
        matches!(self.def().name.as_str(), ".ctor" | ".cctor")
    }

    fn is_inherited(&self) -> bool {
        self.inherited
    }

    fn is_public(&self) -> bool {
        self.def().is_public
    }

    fn is_static(&self) -> bool {
        self.def().is_static
    }

    fn is_virtual(&self) -> bool {
        self.def().is_virtual
    }

    fn return_type(&self) -> ClrType {
        resolve(&self.ctx, &self.def().return_type)
    }

    fn parameter_types(&self) -> Vec<ClrType> {
        self.def()
            .parameters
            .iter()
            .map(|p| resolve(&self.ctx, p))
            .collect()
    }

    fn custom_attributes(&self) -> Result<Vec<ClrAttribute>> {
        Ok(attributes(&self.ctx, &self.def().attributes))
    }
}

/// Property handle of the reflection-style backend
#[derive(Clone)]
pub struct ClrProperty {
    ctx: Rc<ClrContext>,
    loc: DefLoc,
    index: usize,
    inherited: bool,
}

impl ClrProperty {
    fn def(&self) -> &ClrPropertyDef {
        &self.ctx.def(self.loc).properties[self.index]
    }

    fn accessor(&self, name: Option<&String>) -> Option<ClrMethod> {
        let name = name?;
        let index = self
            .ctx
            .def(self.loc)
            .methods
            .iter()
            .position(|m| &m.name == name)?;
        Some(ClrMethod {
            ctx: Rc::clone(&self.ctx),
            loc: self.loc,
            index,
            inherited: self.inherited,
        })
    }
}

impl fmt::Debug for ClrProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClrProperty").field(&self.def().name).finish()
    }
}

impl CilProperty for ClrProperty {
    type Type = ClrType;
    type Method = ClrMethod;
    type Attribute = ClrAttribute;

    fn name(&self) -> &str {
        &self.def().name
    }

    fn property_type(&self) -> ClrType {
        resolve(&self.ctx, &self.def().property_type)
    }

    fn is_inherited(&self) -> bool {
        self.inherited
    }

    fn can_read(&self) -> bool {
        self.def().getter.is_some()
    }

    fn can_write(&self) -> bool {
        self.def().setter.is_some()
    }

    fn getter(&self) -> Option<ClrMethod> {
        self.accessor(self.def().getter.as_ref())
    }

    fn setter(&self) -> Option<ClrMethod> {
        self.accessor(self.def().setter.as_ref())
    }

    fn custom_attributes(&self) -> Result<Vec<ClrAttribute>> {
        Ok(attributes(&self.ctx, &self.def().attributes))
    }
}

/// Attribute handle of the reflection-style backend
#[derive(Debug, Clone)]
pub struct ClrAttribute {
    attribute_type: ClrType,
    arguments: Vec<AttributeValue>,
}

impl CilAttribute for ClrAttribute {
    type Type = ClrType;

    fn attribute_type(&self) -> ClrType {
        self.attribute_type.clone()
    }

    fn can_read_constructor_arguments(&self) -> bool {
        true
    }

    fn constructor_arguments(&self) -> Result<&[AttributeValue]> {
        Ok(&self.arguments)
    }
}
