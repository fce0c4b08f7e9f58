//! AOT backend over IL2CPP metadata tables.
//!
//! [`Il2CppMetadata`] mirrors the tables of a `global-metadata.dat` file plus
//! the type table of the matching native binary, already split into records
//! by an external reader. Cross-table references are plain indices, exactly as
//! the runtime stores them:
//!
//! - `types` entries (binary type table) point at type definitions
//! - type definitions point at contiguous runs of fields, methods, properties,
//!   nested types and interfaces
//! - custom attributes are located by member token (or, on very old metadata,
//!   by a per-member index) and decoded with [`crate::attribute`]
//!
//! Every index is validated once in [`Il2CppLoader::new`]; handles index the
//! tables directly afterwards.

use super::{
    missing_type, CilAssemblyLoader, CilAttribute, CilField, CilMethod, CilProperty, CilType,
    ConstantValue, WellKnownTypes,
};
use crate::attribute::{
    decode_attribute_blob, find_token_range, AttributeMode, AttributeValue, TokenRange,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use tracing::{debug, info, trace};

const MAX_CHAIN_DEPTH: usize = 64;

const TYPE_ATTRIBUTE_INTERFACE: u32 = 0x20;
const TYPE_ATTRIBUTE_ABSTRACT: u32 = 0x80;
const TYPE_ATTRIBUTE_SEALED: u32 = 0x100;

const MEMBER_ACCESS_MASK: u32 = 0x7;
const MEMBER_ACCESS_PUBLIC: u32 = 0x6;
const MEMBER_STATIC: u32 = 0x10;
const FIELD_LITERAL: u32 = 0x40;
const METHOD_VIRTUAL: u32 = 0x40;

/// An IL2CPP metadata dump
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Il2CppMetadata {
    /// Metadata format version (24, 24.5, 27, 29, 31, ...)
    pub version: f32,
    /// Assembly images
    pub images: Vec<Il2CppImageDef>,
    /// Type definitions
    pub type_defs: Vec<Il2CppTypeDef>,
    /// Field definitions
    pub field_defs: Vec<Il2CppFieldDef>,
    /// Method definitions
    pub method_defs: Vec<Il2CppMethodDef>,
    /// Parameter definitions
    pub parameter_defs: Vec<Il2CppParameterDef>,
    /// Property definitions
    pub property_defs: Vec<Il2CppPropertyDef>,
    /// Type definition indices referenced by nested type runs
    pub nested_type_indices: Vec<usize>,
    /// Type table indices referenced by interface runs
    pub interface_indices: Vec<usize>,
    /// Token-sorted attribute blob ranges (version 29+)
    pub attribute_data_ranges: Vec<Il2CppAttributeDataRange>,
    /// Packed attribute blobs (version 29+)
    pub attribute_data: Vec<u8>,
    /// Attribute type ranges (before version 29)
    pub attribute_type_ranges: Vec<Il2CppAttributeTypeRange>,
    /// Type table indices referenced by attribute type ranges
    pub attribute_types: Vec<usize>,
    /// Type table of the native binary
    pub types: Vec<Il2CppTypeEntry>,
}

/// An assembly image
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppImageDef {
    pub name: String,
    pub type_start: usize,
    pub type_count: usize,
    pub custom_attribute_start: usize,
    pub custom_attribute_count: usize,
}

/// A type definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppTypeDef {
    pub name: String,
    pub namespace: String,
    /// Type table index of the enclosing type, or -1
    pub declaring_type: i32,
    /// Type table index of the base type, or -1
    pub parent: i32,
    /// Type table index of an enum's underlying type, or -1
    pub element_type: i32,
    pub flags: u32,
    pub is_value_type: bool,
    pub is_enum: bool,
    pub field_start: usize,
    pub field_count: usize,
    pub method_start: usize,
    pub method_count: usize,
    pub property_start: usize,
    pub property_count: usize,
    pub nested_start: usize,
    pub nested_count: usize,
    pub interfaces_start: usize,
    pub interfaces_count: usize,
    pub token: u32,
    pub custom_attribute_index: i32,
}

impl Default for Il2CppTypeDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: String::new(),
            declaring_type: -1,
            parent: -1,
            element_type: -1,
            flags: 0,
            is_value_type: false,
            is_enum: false,
            field_start: 0,
            field_count: 0,
            method_start: 0,
            method_count: 0,
            property_start: 0,
            property_count: 0,
            nested_start: 0,
            nested_count: 0,
            interfaces_start: 0,
            interfaces_count: 0,
            token: 0,
            custom_attribute_index: -1,
        }
    }
}

/// A field definition; its flags live on the referenced type table entry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppFieldDef {
    pub name: String,
    pub type_index: usize,
    pub token: u32,
    pub custom_attribute_index: i32,
    pub default_value: Option<ConstantValue>,
}

impl Default for Il2CppFieldDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            type_index: 0,
            token: 0,
            custom_attribute_index: -1,
            default_value: None,
        }
    }
}

/// A method definition
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppMethodDef {
    pub name: String,
    /// Type definition index of the declaring type
    pub declaring_type: usize,
    /// Type table index of the return type
    pub return_type: usize,
    pub parameter_start: usize,
    pub parameter_count: usize,
    pub flags: u32,
    pub token: u32,
    pub custom_attribute_index: i32,
}

impl Default for Il2CppMethodDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            declaring_type: 0,
            return_type: 0,
            parameter_start: 0,
            parameter_count: 0,
            flags: 0,
            token: 0,
            custom_attribute_index: -1,
        }
    }
}

/// A method parameter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppParameterDef {
    pub name: String,
    pub type_index: usize,
}

/// A property definition; accessors are relative to the declaring type's first method
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppPropertyDef {
    pub name: String,
    pub get: i32,
    pub set: i32,
    pub token: u32,
    pub custom_attribute_index: i32,
}

impl Default for Il2CppPropertyDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            get: -1,
            set: -1,
            token: 0,
            custom_attribute_index: -1,
        }
    }
}

/// Start of one member's attribute blob within `attribute_data`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppAttributeDataRange {
    pub token: u32,
    pub start_offset: u32,
}

impl TokenRange for Il2CppAttributeDataRange {
    fn token(&self) -> u32 {
        self.token
    }
}

/// One member's run of attribute types within `attribute_types`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Il2CppAttributeTypeRange {
    pub token: u32,
    pub start: usize,
    pub count: usize,
}

impl TokenRange for Il2CppAttributeTypeRange {
    fn token(&self) -> u32 {
        self.token
    }
}

/// An entry of the binary's type table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Il2CppTypeEntry {
    /// Raw IL2CPP type enum byte
    pub type_enum: u8,
    /// Member attribute flags for field types
    pub attrs: u16,
    /// What the entry refers to
    pub data: Il2CppTypeData,
}

/// Payload of a type table entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Il2CppTypeData {
    /// A class or value type definition
    Class(usize),
    /// A constructed generic over a definition
    GenericInst {
        /// Type definition index
        class: usize,
        /// Type table indices of the arguments
        args: Vec<usize>,
    },
    /// Primitives and anything else without a definition reference
    #[default]
    None,
}

fn primitive_name(type_enum: u8) -> Option<&'static str> {
    Some(match type_enum {
        0x01 => "System.Void",
        0x02 => "System.Boolean",
        0x03 => "System.Char",
        0x04 => "System.SByte",
        0x05 => "System.Byte",
        0x06 => "System.Int16",
        0x07 => "System.UInt16",
        0x08 => "System.Int32",
        0x09 => "System.UInt32",
        0x0A => "System.Int64",
        0x0B => "System.UInt64",
        0x0C => "System.Single",
        0x0D => "System.Double",
        0x0E => "System.String",
        0x18 => "System.IntPtr",
        0x19 => "System.UIntPtr",
        0x1C => "System.Object",
        _ => return None,
    })
}

fn opt_index(index: i32) -> Option<usize> {
    usize::try_from(index).ok()
}

fn range_ok(start: usize, count: usize, len: usize) -> bool {
    start.checked_add(count).is_some_and(|end| end <= len)
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::invalid_metadata(msg()))
    }
}

fn validate(meta: &Il2CppMetadata) -> Result<()> {
    let types = meta.types.len();
    let defs = meta.type_defs.len();

    for (i, image) in meta.images.iter().enumerate() {
        ensure(range_ok(image.type_start, image.type_count, defs), || {
            format!("image {} ('{}') type run out of bounds", i, image.name)
        })?;
    }

    for (i, entry) in meta.types.iter().enumerate() {
        match &entry.data {
            Il2CppTypeData::Class(def) => {
                ensure(*def < defs, || format!("type entry {} references type def {}", i, def))?
            }
            Il2CppTypeData::GenericInst { class, args } => {
                ensure(*class < defs, || {
                    format!("generic type entry {} references type def {}", i, class)
                })?;
                ensure(args.iter().all(|a| *a < types), || {
                    format!("generic type entry {} has an argument out of bounds", i)
                })?;
            }
            Il2CppTypeData::None => {}
        }
    }

    for (i, def) in meta.type_defs.iter().enumerate() {
        let name = &def.name;
        for (what, index) in [
            ("declaring type", def.declaring_type),
            ("parent", def.parent),
            ("element type", def.element_type),
        ] {
            ensure(opt_index(index).map_or(true, |t| t < types), || {
                format!("type def {} ('{}') {} index {} out of bounds", i, name, what, index)
            })?;
        }
        if let Some(outer) = opt_index(def.declaring_type) {
            ensure(
                matches!(meta.types[outer].data, Il2CppTypeData::Class(_)),
                || format!("type def {} ('{}') declaring type is not a class", i, name),
            )?;
        }
        for (what, start, count, len) in [
            ("field", def.field_start, def.field_count, meta.field_defs.len()),
            ("method", def.method_start, def.method_count, meta.method_defs.len()),
            ("property", def.property_start, def.property_count, meta.property_defs.len()),
            ("nested type", def.nested_start, def.nested_count, meta.nested_type_indices.len()),
            ("interface", def.interfaces_start, def.interfaces_count, meta.interface_indices.len()),
        ] {
            ensure(range_ok(start, count, len), || {
                format!("type def {} ('{}') {} run out of bounds", i, name, what)
            })?;
        }

        for prop in &meta.property_defs[def.property_start..def.property_start + def.property_count] {
            for accessor in [prop.get, prop.set] {
                ensure(opt_index(accessor).map_or(true, |m| m < def.method_count), || {
                    format!("property '{}' of '{}' has accessor {} out of bounds", prop.name, name, accessor)
                })?;
            }
            match (opt_index(prop.get), opt_index(prop.set)) {
                (Some(_), _) => {}
                (None, Some(set)) => {
                    let setter = &meta.method_defs[def.method_start + set];
                    ensure(setter.parameter_count > 0, || {
                        format!("setter of property '{}' of '{}' takes no value", prop.name, name)
                    })?;
                }
                (None, None) => {
                    return Err(Error::invalid_metadata(format!(
                        "property '{}' of '{}' has no accessors",
                        prop.name, name
                    )))
                }
            }
        }
    }

    for field in &meta.field_defs {
        ensure(field.type_index < types, || {
            format!("field '{}' type index {} out of bounds", field.name, field.type_index)
        })?;
    }

    for method in &meta.method_defs {
        ensure(method.declaring_type < defs, || {
            format!("method '{}' declaring type out of bounds", method.name)
        })?;
        ensure(method.return_type < types, || {
            format!("method '{}' return type out of bounds", method.name)
        })?;
        ensure(
            range_ok(method.parameter_start, method.parameter_count, meta.parameter_defs.len()),
            || format!("method '{}' parameter run out of bounds", method.name),
        )?;
    }

    for param in &meta.parameter_defs {
        ensure(param.type_index < types, || {
            format!("parameter '{}' type index out of bounds", param.name)
        })?;
    }

    ensure(meta.nested_type_indices.iter().all(|d| *d < defs), || {
        "nested type index out of bounds".to_owned()
    })?;
    ensure(meta.interface_indices.iter().all(|t| *t < types), || {
        "interface index out of bounds".to_owned()
    })?;
    ensure(meta.attribute_types.iter().all(|t| *t < types), || {
        "attribute type index out of bounds".to_owned()
    })?;

    for range in &meta.attribute_type_ranges {
        ensure(range_ok(range.start, range.count, meta.attribute_types.len()), || {
            format!("attribute type range for token 0x{:08x} out of bounds", range.token)
        })?;
    }
    for range in &meta.attribute_data_ranges {
        ensure(range.start_offset as usize <= meta.attribute_data.len(), || {
            format!("attribute data range for token 0x{:08x} out of bounds", range.token)
        })?;
    }

    Ok(())
}

struct Il2CppContext {
    meta: Il2CppMetadata,
    mode: AttributeMode,
    type_image: Vec<Option<usize>>,
    full_names: Vec<String>,
    namespaces: Vec<Option<String>>,
    by_name: HashMap<String, usize>,
    interned: RefCell<HashMap<InternKey, Rc<Il2CppTypeInfo>>>,
}

// Definitions are keyed by table row so same-named rows stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum InternKey {
    Def(usize),
    Named(String),
}

#[derive(Debug)]
struct Il2CppTypeInfo {
    full_name: String,
    name: String,
    namespace: Option<String>,
    def: Option<usize>,
    generic_args: Vec<usize>,
}

impl Il2CppContext {
    fn def_of_type(&self, index: usize) -> Option<usize> {
        let entry = &self.meta.types[index];
        match &entry.data {
            Il2CppTypeData::Class(def) | Il2CppTypeData::GenericInst { class: def, .. } => Some(*def),
            Il2CppTypeData::None => self.by_name.get(primitive_name(entry.type_enum)?).copied(),
        }
    }

    fn type_key(&self, index: usize, depth: usize) -> String {
        let entry = &self.meta.types[index];
        match &entry.data {
            Il2CppTypeData::Class(def) => self.full_names[*def].clone(),
            Il2CppTypeData::GenericInst { class, args } => {
                if depth >= MAX_CHAIN_DEPTH {
                    return self.full_names[*class].clone();
                }
                let args: Vec<String> = args
                    .iter()
                    .map(|a| format!("[{}]", self.type_key(*a, depth + 1)))
                    .collect();
                format!("{}[{}]", self.full_names[*class], args.join(","))
            }
            Il2CppTypeData::None => primitive_name(entry.type_enum)
                .map_or_else(|| format!("<type #{}>", index), str::to_owned),
        }
    }

    fn image_name(&self, def: usize) -> &str {
        self.type_image[def].map_or("", |image| self.meta.images[image].name.as_str())
    }
}

// Full names join nested types with '/'; nested types report their outermost namespace.
fn compute_names(meta: &Il2CppMetadata) -> (Vec<String>, Vec<Option<String>>) {
    let outer_of = |def: &Il2CppTypeDef| -> Option<usize> {
        match meta.types[opt_index(def.declaring_type)?].data {
            Il2CppTypeData::Class(outer) => Some(outer),
            _ => None,
        }
    };

    let mut full_names = Vec::with_capacity(meta.type_defs.len());
    let mut namespaces = Vec::with_capacity(meta.type_defs.len());

    for def in &meta.type_defs {
        let mut segments = vec![def.name.as_str()];
        let mut outermost = def;
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(outer) = outer_of(outermost) else { break };
            outermost = &meta.type_defs[outer];
            segments.push(outermost.name.as_str());
        }
        segments.reverse();

        let namespace = Some(outermost.namespace.clone()).filter(|ns| !ns.is_empty());
        let joined = segments.join("/");
        full_names.push(match &namespace {
            Some(ns) => format!("{}.{}", ns, joined),
            None => joined,
        });
        namespaces.push(namespace);
    }

    (full_names, namespaces)
}

fn intern(ctx: &Rc<Il2CppContext>, key: InternKey, make: impl FnOnce() -> Il2CppTypeInfo) -> Il2CppType {
    if let Some(data) = ctx.interned.borrow().get(&key) {
        return Il2CppType {
            ctx: Rc::clone(ctx),
            data: Rc::clone(data),
        };
    }
    trace!(?key, "interning il2cpp type");
    let data = Rc::new(make());
    ctx.interned.borrow_mut().insert(key, Rc::clone(&data));
    Il2CppType {
        ctx: Rc::clone(ctx),
        data,
    }
}

fn resolve_def(ctx: &Rc<Il2CppContext>, def: usize) -> Il2CppType {
    intern(ctx, InternKey::Def(def), || Il2CppTypeInfo {
        full_name: ctx.full_names[def].clone(),
        name: ctx.meta.type_defs[def].name.clone(),
        namespace: ctx.namespaces[def].clone(),
        def: Some(def),
        generic_args: Vec::new(),
    })
}

fn resolve_type(ctx: &Rc<Il2CppContext>, index: usize) -> Il2CppType {
    let entry = &ctx.meta.types[index];
    match &entry.data {
        Il2CppTypeData::Class(def) => resolve_def(ctx, *def),
        Il2CppTypeData::GenericInst { class, args } => {
            let key = ctx.type_key(index, 0);
            intern(ctx, InternKey::Named(key.clone()), || Il2CppTypeInfo {
                full_name: key,
                name: ctx.meta.type_defs[*class].name.clone(),
                namespace: ctx.namespaces[*class].clone(),
                def: Some(*class),
                generic_args: args.clone(),
            })
        }
        Il2CppTypeData::None => {
            if let Some(def) = ctx.def_of_type(index) {
                return resolve_def(ctx, def);
            }
            let key = ctx.type_key(index, 0);
            let (namespace, name) = super::split_full_name(&key);
            let (namespace, name) = (namespace.map(str::to_owned), name.to_owned());
            intern(ctx, InternKey::Named(key.clone()), || Il2CppTypeInfo {
                full_name: key,
                name,
                namespace,
                def: None,
                generic_args: Vec::new(),
            })
        }
    }
}

/// Which table row a set of custom attributes belongs to
#[derive(Clone, Copy)]
struct AttributeOwner {
    token: u32,
    custom_attribute_index: i32,
    image: Option<usize>,
}

fn load_attributes(ctx: &Rc<Il2CppContext>, owner: AttributeOwner) -> Result<Vec<Il2CppAttribute>> {
    let meta = &ctx.meta;
    let window = owner
        .image
        .map(|i| &meta.images[i])
        .map(|img| (img.custom_attribute_start, img.custom_attribute_count));

    let range = match ctx.mode {
        AttributeMode::DataBlobs => {
            return load_attribute_blob(ctx, owner, window);
        }
        AttributeMode::DirectIndex => match opt_index(owner.custom_attribute_index) {
            Some(index) => Some(meta.attribute_type_ranges.get(index).ok_or_else(|| {
                Error::invalid_metadata(format!("custom attribute index {} out of bounds", index))
            })?),
            None => None,
        },
        AttributeMode::TypeRanges => window
            .and_then(|(start, count)| {
                find_token_range(&meta.attribute_type_ranges, owner.token, start, count)
            })
            .map(|i| &meta.attribute_type_ranges[i]),
    };

    let Some(range) = range else {
        return Ok(Vec::new());
    };

    meta.attribute_types[range.start..range.start + range.count]
        .iter()
        .map(|&type_index| match meta.types[type_index].data {
            Il2CppTypeData::Class(def) => Ok(Il2CppAttribute {
                attribute_type: resolve_def(ctx, def),
                arguments: None,
                version: meta.version,
            }),
            _ => Err(Error::invalid_metadata(format!(
                "attribute type entry {} is not a class",
                type_index
            ))),
        })
        .collect()
}

fn load_attribute_blob(
    ctx: &Rc<Il2CppContext>,
    owner: AttributeOwner,
    window: Option<(usize, usize)>,
) -> Result<Vec<Il2CppAttribute>> {
    let meta = &ctx.meta;
    let Some(index) = window.and_then(|(start, count)| {
        find_token_range(&meta.attribute_data_ranges, owner.token, start, count)
    }) else {
        return Ok(Vec::new());
    };

    let start = meta.attribute_data_ranges[index].start_offset as usize;
    let end = meta
        .attribute_data_ranges
        .get(index + 1)
        .map_or(meta.attribute_data.len(), |next| next.start_offset as usize);
    let blob = meta.attribute_data.get(start..end).ok_or_else(|| {
        Error::invalid_metadata(format!(
            "attribute blob for token 0x{:08x} spans {}..{}",
            owner.token, start, end
        ))
    })?;

    let resolver = |type_index: i32| -> Result<u8> {
        let underlying = opt_index(type_index)
            .and_then(|t| meta.types.get(t))
            .and_then(|entry| match entry.data {
                Il2CppTypeData::Class(def) => opt_index(meta.type_defs[def].element_type),
                _ => None,
            })
            .ok_or_else(|| {
                Error::invalid_metadata(format!("type {} is not an enum with an underlying type", type_index))
            })?;
        Ok(meta.types[underlying].type_enum)
    };

    let decoded = decode_attribute_blob(blob, &resolver)?;
    trace!(token = owner.token, count = decoded.len(), "decoded attribute blob");

    decoded
        .into_iter()
        .map(|attr| {
            let ctor = meta
                .method_defs
                .get(attr.constructor_index as usize)
                .ok_or_else(|| {
                    Error::invalid_metadata(format!(
                        "attribute constructor {} out of bounds",
                        attr.constructor_index
                    ))
                })?;
            Ok(Il2CppAttribute {
                attribute_type: resolve_def(ctx, ctor.declaring_type),
                arguments: Some(attr.arguments.into_iter().map(|v| resolve_type_values(ctx, v)).collect()),
                version: meta.version,
            })
        })
        .collect()
}

fn resolve_type_values(ctx: &Rc<Il2CppContext>, value: AttributeValue) -> AttributeValue {
    match value {
        AttributeValue::TypeIndex(index) => match opt_index(index).filter(|i| *i < ctx.meta.types.len()) {
            Some(i) => AttributeValue::Type(ctx.type_key(i, 0)),
            None => AttributeValue::TypeIndex(index),
        },
        AttributeValue::Array(Some(items)) => AttributeValue::Array(Some(
            items.into_iter().map(|v| resolve_type_values(ctx, v)).collect(),
        )),
        other => other,
    }
}

/// Loader over one IL2CPP metadata dump
pub struct Il2CppLoader {
    ctx: Rc<Il2CppContext>,
    loaded: Vec<Il2CppType>,
    well_known: WellKnownTypes<Il2CppType>,
}

impl fmt::Debug for Il2CppLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Il2CppLoader")
            .field("version", &self.ctx.meta.version)
            .field("images", &self.ctx.meta.images.len())
            .field("loaded_types", &self.loaded.len())
            .finish()
    }
}

impl Il2CppLoader {
    /// Validates the metadata tables and indexes every type definition
    pub fn new(meta: Il2CppMetadata) -> Result<Self> {
        validate(&meta)?;

        let mode = AttributeMode::for_version(meta.version);
        debug!(version = meta.version, ?mode, "selected attribute mode");

        let mut type_image = vec![None; meta.type_defs.len()];
        for (image_index, image) in meta.images.iter().enumerate() {
            for slot in &mut type_image[image.type_start..image.type_start + image.type_count] {
                *slot = Some(image_index);
            }
        }

        let (full_names, namespaces) = compute_names(&meta);
        let mut by_name = HashMap::with_capacity(full_names.len());
        for (index, name) in full_names.iter().enumerate() {
            by_name.entry(name.clone()).or_insert(index);
        }

        let ctx = Rc::new(Il2CppContext {
            meta,
            mode,
            type_image,
            full_names,
            namespaces,
            by_name,
            interned: RefCell::new(HashMap::new()),
        });

        let loaded: Vec<Il2CppType> = (0..ctx.meta.type_defs.len())
            .map(|def| resolve_def(&ctx, def))
            .collect();

        info!(
            "Loaded {} types from {} assemblies for parsing.",
            loaded.len(),
            ctx.meta.images.len()
        );

        Ok(Self {
            ctx,
            loaded,
            well_known: WellKnownTypes::default(),
        })
    }

    /// Metadata version in effect
    pub fn version(&self) -> f32 {
        self.ctx.meta.version
    }

    /// Looks up a type definition by full name (`Ns.Outer/Inner`)
    pub fn get_type(&self, full_name: &str) -> Option<Il2CppType> {
        let def = *self.ctx.by_name.get(full_name)?;
        Some(resolve_def(&self.ctx, def))
    }
}

impl CilAssemblyLoader for Il2CppLoader {
    type Type = Il2CppType;

    fn loaded_types(&self) -> &[Il2CppType] {
        &self.loaded
    }

    // Every image lives in the same metadata file, so the assembly name is not consulted.
    fn find_type(&self, full_name: &str, assembly: &str) -> Result<Il2CppType> {
        self.get_type(full_name)
            .ok_or_else(|| missing_type(full_name, assembly))
    }

    fn well_known(&self) -> &WellKnownTypes<Il2CppType> {
        &self.well_known
    }
}

/// Interned type handle of the IL2CPP backend
#[derive(Clone)]
pub struct Il2CppType {
    ctx: Rc<Il2CppContext>,
    data: Rc<Il2CppTypeInfo>,
}

impl PartialEq for Il2CppType {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Il2CppType {}

impl Hash for Il2CppType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.full_name.hash(state);
    }
}

impl fmt::Debug for Il2CppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Il2CppType").field(&self.data.full_name).finish()
    }
}

impl Il2CppType {
    fn def(&self) -> Option<&Il2CppTypeDef> {
        self.data.def.map(|d| &self.ctx.meta.type_defs[d])
    }

    fn flags(&self) -> u32 {
        self.def().map_or(0, |d| d.flags)
    }

    /// Type definition index, if this type has a definition
    pub fn definition_index(&self) -> Option<usize> {
        self.data.def
    }
}

impl CilType for Il2CppType {
    type Field = Il2CppField;
    type Method = Il2CppMethod;
    type Property = Il2CppProperty;
    type Attribute = Il2CppAttribute;

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
        self.data.def.map_or("", |d| self.ctx.image_name(d))
    }

    fn declaring_module_name(&self) -> &str {
        self.declaring_assembly_name()
    }

    fn declaring_type(&self) -> Option<Self> {
        let outer = opt_index(self.def()?.declaring_type)?;
        Some(resolve_type(&self.ctx, outer))
    }

    fn base_type(&self) -> Option<Self> {
        let parent = opt_index(self.def()?.parent)?;
        Some(resolve_type(&self.ctx, parent))
    }

    fn is_abstract(&self) -> bool {
        self.flags() & TYPE_ATTRIBUTE_ABSTRACT != 0
    }

    fn is_class(&self) -> bool {
        self.def()
            .is_some_and(|d| d.flags & TYPE_ATTRIBUTE_INTERFACE == 0 && !d.is_value_type)
    }

    fn is_enum(&self) -> bool {
        self.def().is_some_and(|d| d.is_enum)
    }

    fn is_nested(&self) -> bool {
        self.def().is_some_and(|d| d.declaring_type >= 0)
    }

    fn is_sealed(&self) -> bool {
        self.flags() & TYPE_ATTRIBUTE_SEALED != 0
    }

    fn generic_type_arguments(&self) -> Vec<Self> {
        self.data
            .generic_args
            .iter()
            .map(|a| resolve_type(&self.ctx, *a))
            .collect()
    }

    fn custom_attributes(&self) -> Result<Vec<Il2CppAttribute>> {
        let (Some(index), Some(def)) = (self.data.def, self.def()) else {
            return Ok(Vec::new());
        };
        load_attributes(
            &self.ctx,
            AttributeOwner {
                token: def.token,
                custom_attribute_index: def.custom_attribute_index,
                image: self.ctx.type_image[index],
            },
        )
    }

    fn fields(&self) -> Vec<Il2CppField> {
        let (Some(owner), Some(def)) = (self.data.def, self.def()) else {
            return Vec::new();
        };
        (def.field_start..def.field_start + def.field_count)
            .map(|index| Il2CppField {
                ctx: Rc::clone(&self.ctx),
                owner,
                index,
            })
            .collect()
    }

    fn methods(&self) -> Vec<Il2CppMethod> {
        let Some(def) = self.def() else {
            return Vec::new();
        };
        (def.method_start..def.method_start + def.method_count)
            .map(|index| Il2CppMethod {
                ctx: Rc::clone(&self.ctx),
                index,
            })
            .collect()
    }

    fn nested_types(&self) -> Vec<Self> {
        let Some(def) = self.def() else {
            return Vec::new();
        };
        self.ctx.meta.nested_type_indices[def.nested_start..def.nested_start + def.nested_count]
            .iter()
            .map(|nested| resolve_def(&self.ctx, *nested))
            .collect()
    }

    fn properties(&self) -> Vec<Il2CppProperty> {
        let (Some(owner), Some(def)) = (self.data.def, self.def()) else {
            return Vec::new();
        };
        (def.property_start..def.property_start + def.property_count)
            .map(|index| Il2CppProperty {
                ctx: Rc::clone(&self.ctx),
                owner,
                index,
            })
            .collect()
    }

    fn is_assignable_to(&self, other: &Self) -> bool {
        if self == other {
            return true;
        }
        let Some(target) = other.data.def else {
            return false;
        };

        let meta = &self.ctx.meta;
        let mut current = self.data.def;
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(def_index) = current else {
                return false;
            };
            if def_index == target {
                return true;
            }
            let def = &meta.type_defs[def_index];
            let implements = meta.interface_indices
                [def.interfaces_start..def.interfaces_start + def.interfaces_count]
                .iter()
                .any(|iface| self.ctx.def_of_type(*iface) == Some(target));
            if implements {
                return true;
            }
            current = opt_index(def.parent).and_then(|p| self.ctx.def_of_type(p));
        }
        false
    }
}

/// Field handle of the IL2CPP backend
#[derive(Clone)]
pub struct Il2CppField {
    ctx: Rc<Il2CppContext>,
    owner: usize,
    index: usize,
}

impl Il2CppField {
    fn def(&self) -> &Il2CppFieldDef {
        &self.ctx.meta.field_defs[self.index]
    }

    fn attrs(&self) -> u32 {
        u32::from(self.ctx.meta.types[self.def().type_index].attrs)
    }
}

impl fmt::Debug for Il2CppField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Il2CppField").field(&self.def().name).finish()
    }
}

impl CilField for Il2CppField {
    type Attribute = Il2CppAttribute;

    fn name(&self) -> &str {
        &self.def().name
    }

    fn constant_value(&self) -> Option<ConstantValue> {
        self.def().default_value.clone()
    }

    fn is_literal(&self) -> bool {
        self.attrs() & FIELD_LITERAL != 0
    }

    fn is_public(&self) -> bool {
        self.attrs() & MEMBER_ACCESS_MASK == MEMBER_ACCESS_PUBLIC
    }

    fn is_static(&self) -> bool {
        self.attrs() & MEMBER_STATIC != 0
    }

    fn custom_attributes(&self) -> Result<Vec<Il2CppAttribute>> {
        let def = self.def();
        load_attributes(
            &self.ctx,
            AttributeOwner {
                token: def.token,
                custom_attribute_index: def.custom_attribute_index,
                image: self.ctx.type_image[self.owner],
            },
        )
    }
}

/// Method handle of the IL2CPP backend
#[derive(Clone)]
pub struct Il2CppMethod {
    ctx: Rc<Il2CppContext>,
    index: usize,
}

impl Il2CppMethod {
    fn def(&self) -> &Il2CppMethodDef {
        &self.ctx.meta.method_defs[self.index]
    }
}

impl fmt::Debug for Il2CppMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Il2CppMethod").field(&self.def().name).finish()
    }
}

impl CilMethod for Il2CppMethod {
    type Type = Il2CppType;
    type Attribute = Il2CppAttribute;

    fn name(&self) -> &str {
        &self.def().name
    }

    fn is_constructor(&self) -> bool {
        matches!(self.def().name.as_str(), ".ctor" | ".cctor")
    }

    fn is_inherited(&self) -> bool {
        false
    }

    fn is_public(&self) -> bool {
        self.def().flags & MEMBER_ACCESS_MASK == MEMBER_ACCESS_PUBLIC
    }

    fn is_static(&self) -> bool {
        self.def().flags & MEMBER_STATIC != 0
    }

    fn is_virtual(&self) -> bool {
        self.def().flags & METHOD_VIRTUAL != 0
    }

    fn return_type(&self) -> Il2CppType {
        resolve_type(&self.ctx, self.def().return_type)
    }

    fn parameter_types(&self) -> Vec<Il2CppType> {
        let def = self.def();
        self.ctx.meta.parameter_defs[def.parameter_start..def.parameter_start + def.parameter_count]
            .iter()
            .map(|p| resolve_type(&self.ctx, p.type_index))
            .collect()
    }

    fn custom_attributes(&self) -> Result<Vec<Il2CppAttribute>> {
        let def = self.def();
        load_attributes(
            &self.ctx,
            AttributeOwner {
                token: def.token,
                custom_attribute_index: def.custom_attribute_index,
                image: self.ctx.type_image[def.declaring_type],
            },
        )
    }
}

/// Property handle of the IL2CPP backend
#[derive(Clone)]
pub struct Il2CppProperty {
    ctx: Rc<Il2CppContext>,
    owner: usize,
    index: usize,
}

impl Il2CppProperty {
    fn def(&self) -> &Il2CppPropertyDef {
        &self.ctx.meta.property_defs[self.index]
    }

    fn accessor(&self, relative: i32) -> Option<Il2CppMethod> {
        let relative = opt_index(relative)?;
        Some(Il2CppMethod {
            ctx: Rc::clone(&self.ctx),
            index: self.ctx.meta.type_defs[self.owner].method_start + relative,
        })
    }
}

impl fmt::Debug for Il2CppProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Il2CppProperty").field(&self.def().name).finish()
    }
}

impl CilProperty for Il2CppProperty {
    type Type = Il2CppType;
    type Method = Il2CppMethod;
    type Attribute = Il2CppAttribute;

    fn name(&self) -> &str {
        &self.def().name
    }

    // Getter return type, else the setter's value parameter; validated at load.
    fn property_type(&self) -> Il2CppType {
        if let Some(getter) = self.getter() {
            return getter.return_type();
        }
        let setter = &self.ctx.meta.method_defs
            [self.ctx.meta.type_defs[self.owner].method_start + self.def().set.max(0) as usize];
        resolve_type(
            &self.ctx,
            self.ctx.meta.parameter_defs[setter.parameter_start].type_index,
        )
    }

    fn is_inherited(&self) -> bool {
        false
    }

    fn can_read(&self) -> bool {
        self.def().get >= 0
    }

    fn can_write(&self) -> bool {
        self.def().set >= 0
    }

    fn getter(&self) -> Option<Il2CppMethod> {
        self.accessor(self.def().get)
    }

    fn setter(&self) -> Option<Il2CppMethod> {
        self.accessor(self.def().set)
    }

    fn custom_attributes(&self) -> Result<Vec<Il2CppAttribute>> {
        let def = self.def();
        load_attributes(
            &self.ctx,
            AttributeOwner {
                token: def.token,
                custom_attribute_index: def.custom_attribute_index,
                image: self.ctx.type_image[self.owner],
            },
        )
    }
}

/// Attribute handle of the IL2CPP backend
#[derive(Debug, Clone)]
pub struct Il2CppAttribute {
    attribute_type: Il2CppType,
    arguments: Option<Vec<AttributeValue>>,
    version: f32,
}

impl CilAttribute for Il2CppAttribute {
    type Type = Il2CppType;

    fn attribute_type(&self) -> Il2CppType {
        self.attribute_type.clone()
    }

    fn can_read_constructor_arguments(&self) -> bool {
        self.arguments.is_some()
    }

    fn constructor_arguments(&self) -> Result<&[AttributeValue]> {
        self.arguments
            .as_deref()
            .ok_or(Error::AttributeArgumentsUnavailable {
                version: self.version,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::TypeTag;

    const OBSOLETE_TOKEN: u32 = 0x0200_0003;

    fn class_entry(def: usize) -> Il2CppTypeEntry {
        Il2CppTypeEntry {
            type_enum: 0x12,
            attrs: 0,
            data: Il2CppTypeData::Class(def),
        }
    }

    // Outer (sealed) with nested Inner, plus an attribute class whose
    // constructor takes a string. Outer carries the attribute.
    fn sample(version: f32) -> Il2CppMetadata {
        let mut meta = Il2CppMetadata {
            version,
            ..Default::default()
        };
        meta.images.push(Il2CppImageDef {
            name: "App.dll".to_owned(),
            type_start: 0,
            type_count: 3,
            custom_attribute_start: 0,
            custom_attribute_count: 1,
        });
        meta.type_defs = vec![
            Il2CppTypeDef {
                name: "Outer".to_owned(),
                namespace: "App".to_owned(),
                flags: TYPE_ATTRIBUTE_SEALED,
                nested_start: 0,
                nested_count: 1,
                token: OBSOLETE_TOKEN,
                custom_attribute_index: 0,
                field_start: 0,
                field_count: 1,
                ..Default::default()
            },
            Il2CppTypeDef {
                name: "Inner".to_owned(),
                declaring_type: 0,
                ..Default::default()
            },
            Il2CppTypeDef {
                name: "ObsoleteAttribute".to_owned(),
                namespace: "System".to_owned(),
                method_start: 0,
                method_count: 1,
                ..Default::default()
            },
        ];
        meta.types = vec![
            class_entry(0),
            class_entry(1),
            class_entry(2),
            Il2CppTypeEntry {
                type_enum: 0x08,
                attrs: (MEMBER_ACCESS_PUBLIC | MEMBER_STATIC | FIELD_LITERAL) as u16,
                data: Il2CppTypeData::None,
            },
            Il2CppTypeEntry {
                type_enum: 0x0E,
                ..Default::default()
            },
        ];
        meta.nested_type_indices = vec![1];
        meta.field_defs = vec![Il2CppFieldDef {
            name: "ValueFieldNumber".to_owned(),
            type_index: 3,
            default_value: Some(ConstantValue::I4(4)),
            ..Default::default()
        }];
        meta.method_defs = vec![Il2CppMethodDef {
            name: ".ctor".to_owned(),
            declaring_type: 2,
            return_type: 4,
            flags: MEMBER_ACCESS_PUBLIC,
            ..Default::default()
        }];

        // v29 blob: one attribute, ctor 0, one string arg "gone"
        let mut blob = vec![0x01];
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&[0x01, 0x00, 0x00, TypeTag::String as u8, 0x08]);
        blob.extend_from_slice(b"gone");
        meta.attribute_data = blob;
        meta.attribute_data_ranges = vec![Il2CppAttributeDataRange {
            token: OBSOLETE_TOKEN,
            start_offset: 0,
        }];

        meta.attribute_type_ranges = vec![Il2CppAttributeTypeRange {
            token: OBSOLETE_TOKEN,
            start: 0,
            count: 1,
        }];
        meta.attribute_types = vec![2];
        meta
    }

    #[test]
    fn test_nested_names() {
        let loader = Il2CppLoader::new(sample(29.0)).unwrap();
        let inner = loader.get_type("App.Outer/Inner").unwrap();
        assert_eq!(inner.name(), "Inner");
        assert_eq!(inner.namespace(), Some("App"));
        assert!(inner.is_nested());
        assert_eq!(inner.declaring_type().unwrap().full_name(), "App.Outer");
        assert_eq!(inner.declaring_assembly_name(), "App.dll");

        let outer = loader.get_type("App.Outer").unwrap();
        assert_eq!(outer.nested_types(), vec![inner]);
        assert!(outer.is_sealed());
        assert!(!outer.is_abstract());
    }

    #[test]
    fn test_field_flags_from_type_entry() {
        let loader = Il2CppLoader::new(sample(29.0)).unwrap();
        let fields = loader.get_type("App.Outer").unwrap().fields();
        assert_eq!(fields.len(), 1);
        assert!(fields[0].is_public() && fields[0].is_static() && fields[0].is_literal());
        assert_eq!(fields[0].constant_value().and_then(|c| c.as_i32()), Some(4));
    }

    #[test]
    fn test_blob_attributes() {
        let loader = Il2CppLoader::new(sample(29.0)).unwrap();
        let attrs = loader.get_type("App.Outer").unwrap().custom_attributes().unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].attribute_type().name(), "ObsoleteAttribute");
        assert!(attrs[0].can_read_constructor_arguments());
        assert_eq!(
            attrs[0].constructor_arguments().unwrap(),
            &[AttributeValue::String(Some("gone".to_owned()))]
        );
    }

    #[test]
    fn test_legacy_attributes_have_no_arguments() {
        for version in [24.0, 27.0] {
            let loader = Il2CppLoader::new(sample(version)).unwrap();
            let attrs = loader.get_type("App.Outer").unwrap().custom_attributes().unwrap();
            assert_eq!(attrs.len(), 1);
            assert_eq!(attrs[0].attribute_type().full_name(), "System.ObsoleteAttribute");
            assert!(!attrs[0].can_read_constructor_arguments());
            assert!(matches!(
                attrs[0].constructor_arguments(),
                Err(Error::AttributeArgumentsUnavailable { .. })
            ));
        }
    }

    #[test]
    fn test_members_without_attributes() {
        let loader = Il2CppLoader::new(sample(29.0)).unwrap();
        let inner = loader.get_type("App.Outer/Inner").unwrap();
        assert!(inner.custom_attributes().unwrap().is_empty());
    }

    #[test]
    fn test_primitive_placeholder() {
        let loader = Il2CppLoader::new(sample(29.0)).unwrap();
        let methods = loader.get_type("System.ObsoleteAttribute").unwrap().methods();
        let ctor = &methods[0];
        assert!(ctor.is_constructor());
        assert!(ctor.is_public());
        let ret = ctor.return_type();
        assert_eq!(ret.full_name(), "System.String");
        assert_eq!(ret.name(), "String");
    }

    #[test]
    fn test_same_named_definitions_stay_distinct() {
        let dup = || Il2CppTypeDef {
            name: "Dup".to_owned(),
            namespace: "App".to_owned(),
            ..Default::default()
        };
        let meta = Il2CppMetadata {
            version: 29.0,
            images: vec![Il2CppImageDef {
                name: "App.dll".to_owned(),
                type_start: 0,
                type_count: 2,
                ..Default::default()
            }],
            type_defs: vec![dup(), dup()],
            types: vec![class_entry(0), class_entry(1)],
            ..Default::default()
        };

        let loader = Il2CppLoader::new(meta).unwrap();
        let loaded = loader.loaded_types();
        assert_eq!(loaded.len(), 2);
        assert_ne!(loaded[0], loaded[1]);
        assert_eq!(loaded[0].full_name(), loaded[1].full_name());
        assert_eq!(loader.get_type("App.Dup").unwrap(), loaded[0]);
    }

    #[test]
    fn test_invalid_index_rejected() {
        let mut meta = sample(29.0);
        meta.nested_type_indices = vec![9];
        assert!(matches!(Il2CppLoader::new(meta), Err(Error::InvalidMetadata(_))));

        let mut meta = sample(29.0);
        meta.type_defs[0].field_count = 5;
        assert!(matches!(Il2CppLoader::new(meta), Err(Error::InvalidMetadata(_))));
    }

    #[test]
    fn test_deserialize_type_entry() {
        let entry: Il2CppTypeEntry =
            serde_json::from_str(r#"{"type_enum":21,"data":{"generic_inst":{"class":0,"args":[1]}}}"#)
                .unwrap();
        assert_eq!(
            entry.data,
            Il2CppTypeData::GenericInst {
                class: 0,
                args: vec![1]
            }
        );
        let def: Il2CppTypeDef = serde_json::from_str(r#"{"name":"Foo"}"#).unwrap();
        assert_eq!(def.declaring_type, -1);
    }
}
