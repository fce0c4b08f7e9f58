//! Schema reconstruction engine.
//!
//! A [`Decompiler`] turns compiled protoc/gRPC output back into schema
//! declarations. It is a single-use accumulator: every `parse_*` call adds
//! to one [`Schema`], recursing lazily into whatever types the parsed
//! declaration references. Each source type is reconstructed once; repeated
//! and recursive references resolve to the same [`TopLevelId`].
//!
//! ## Message layout recovery
//!
//! protoc's C# generator emits, per message class, one `public const int
//! XFieldNumber` per field and one property per field, both in declaration
//! order. The engine walks the two sequences side by side. Oneof
//! discriminators (`XCase` properties typed by an enum nested in the class)
//! consume no field number, and an optional field's `HasX` companion is
//! folded into the field before it.

mod field_type;
mod service;

use crate::attribute::AttributeValue;
use crate::error::{Error, Result};
use crate::metadata::{CilAttribute, CilField, CilMethod, CilProperty, CilType};
use crate::naming::{NameLookup, NameTranslator};
use crate::proto::{
    Enum, EnumField, FileId, Import, Message, MessageField, OneOf, ProtoFile, Schema,
    TopLevelId, TopLevelKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, debug_span, trace, warn};

const OBSOLETE_ATTRIBUTE: &str = "System.ObsoleteAttribute";
const NON_USER_CODE_ATTRIBUTE: &str = "System.Diagnostics.DebuggerNonUserCodeAttribute";
const GENERATED_CODE_ATTRIBUTE: &str = "System.CodeDom.Compiler.GeneratedCodeAttribute";
const ORIGINAL_NAME_ATTRIBUTE: &str = "Google.Protobuf.Reflection.OriginalNameAttribute";
const GRPC_GENERATOR: &str = "grpc_csharp_plugin";
const BOOLEAN_TYPE: &str = "System.Boolean";

/// Options that relax the engine's recognition rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Render enum-typed fields as `int32` without reconstructing the enum
    pub skip_enums: bool,
    /// Accept properties that lack `DebuggerNonUserCodeAttribute`
    pub include_properties_without_non_user_code_attribute: bool,
    /// Accept service methods that lack the gRPC `GeneratedCodeAttribute`
    pub include_service_methods_without_generated_code_attribute: bool,
}

impl ParseOptions {
    /// Creates options with every relaxation off
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether enum-typed fields become `int32`
    pub fn skip_enums(mut self, skip: bool) -> Self {
        self.skip_enums = skip;
        self
    }

    /// Sets whether unmarked properties are considered
    pub fn include_properties_without_non_user_code_attribute(mut self, include: bool) -> Self {
        self.include_properties_without_non_user_code_attribute = include;
        self
    }

    /// Sets whether unmarked service methods are considered
    pub fn include_service_methods_without_generated_code_attribute(mut self, include: bool) -> Self {
        self.include_service_methods_without_generated_code_attribute = include;
        self
    }
}

/// A recoverable anomaly met while reconstructing a declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Full name of the type being reconstructed
    pub type_name: String,
    /// Property, oneof or method the anomaly concerns
    pub member: String,
    /// What went wrong
    pub kind: DiagnosticKind,
}

/// Kinds of recoverable anomalies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A property needed a field number but none were left; the property was skipped
    MissingIdField,
    /// A second property claimed an already used field number; it was skipped
    DuplicateFieldId(i32),
    /// A oneof listed a field number that no field (or an earlier oneof) has; it was dropped
    DanglingOneofMember(i32),
    /// A oneof lost all its members and was dropped
    EmptyOneof,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: ", self.type_name, self.member)?;
        match &self.kind {
            DiagnosticKind::MissingIdField => write!(f, "no field number constant left; property skipped"),
            DiagnosticKind::DuplicateFieldId(id) => write!(f, "field number {} already used; property skipped", id),
            DiagnosticKind::DanglingOneofMember(id) => write!(f, "oneof member {} has no field; dropped", id),
            DiagnosticKind::EmptyOneof => write!(f, "oneof has no members; dropped"),
        }
    }
}

/// Reconstructs schema declarations from type metadata
#[derive(Default)]
pub struct Decompiler {
    schema: Schema,
    memo: HashMap<String, TopLevelId>,
    name_lookup: Option<Box<dyn NameLookup>>,
    diagnostics: Vec<Diagnostic>,
}

impl fmt::Debug for Decompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decompiler")
            .field("schema", &self.schema)
            .field("memo", &self.memo)
            .field("has_name_lookup", &self.name_lookup.is_some())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

impl Decompiler {
    /// Creates an engine with heuristic naming only
    pub fn new() -> Self {
        Self::default()
    }

    /// Consults `lookup` before every naming heuristic
    pub fn with_name_lookup(mut self, lookup: impl NameLookup + 'static) -> Self {
        self.name_lookup = Some(Box::new(lookup));
        self
    }

    /// The schema built so far
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Consumes the engine, returning its schema
    pub fn into_schema(self) -> Schema {
        self.schema
    }

    /// Recoverable anomalies recorded so far
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Declaration built for a source type, by full name
    pub fn lookup(&self, full_name: &str) -> Option<TopLevelId> {
        self.memo.get(full_name).copied()
    }

    fn translator(&self) -> NameTranslator<'_> {
        NameTranslator::new(self.name_lookup.as_deref())
    }

    fn diagnose(&mut self, type_name: &str, member: &str, kind: DiagnosticKind) {
        let diagnostic = Diagnostic {
            type_name: type_name.to_owned(),
            member: member.to_owned(),
            kind,
        };
        warn!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    /// Reconstructs a message class.
    ///
    /// The type must be a sealed, non-abstract class. Nested messages and
    /// enums land inside their owning message; anything else starts a new
    /// file.
    pub fn parse_message<T: CilType>(&mut self, ty: &T, options: ParseOptions) -> Result<TopLevelId> {
        if !is_message_shape(ty) {
            return Err(Error::precondition(
                ty.full_name(),
                "message types must be sealed, non-abstract classes",
            ));
        }
        if let Some(id) = self.lookup(ty.full_name()) {
            return Ok(id);
        }

        let _span = debug_span!("message", name = ty.full_name()).entered();
        let name = self.translator().type_name(ty.name());
        let is_obsolete = has_attribute(&ty.custom_attributes()?, OBSOLETE_ATTRIBUTE);
        let id = self
            .schema
            .add_top_level(name, is_obsolete, TopLevelKind::Message(Message::default()));
        self.memo.insert(ty.full_name().to_owned(), id);

        self.place(ty, id, options)?;
        let (fields, oneofs) = self.collect_fields(ty, id, options)?;
        debug!(fields = fields.len(), oneofs = oneofs.len(), "message reconstructed");

        if let TopLevelKind::Message(message) = &mut self.schema.top_level_mut(id).kind {
            message.fields = fields;
            message.oneofs = oneofs;
        }
        Ok(id)
    }

    /// Reconstructs an enum type
    pub fn parse_enum<T: CilType>(&mut self, ty: &T, options: ParseOptions) -> Result<TopLevelId> {
        if !ty.is_enum() {
            return Err(Error::precondition(ty.full_name(), "expected an enum type"));
        }
        if let Some(id) = self.lookup(ty.full_name()) {
            return Ok(id);
        }

        let _span = debug_span!("enum", name = ty.full_name()).entered();
        let name = self.translator().type_name(ty.name());
        let is_obsolete = has_attribute(&ty.custom_attributes()?, OBSOLETE_ATTRIBUTE);
        let id = self
            .schema
            .add_top_level(name.clone(), is_obsolete, TopLevelKind::Enum(Enum::default()));
        self.memo.insert(ty.full_name().to_owned(), id);

        self.place(ty, id, options)?;

        let mut fields = Vec::new();
        for field in ty.fields() {
            if !(field.is_static() && field.is_literal()) {
                continue;
            }
            let value = field
                .constant_value()
                .and_then(|c| c.as_i32())
                .ok_or_else(|| {
                    Error::precondition(
                        ty.full_name(),
                        format!("enum member '{}' is not a 32-bit integer", field.name()),
                    )
                })?;
            let attributes = field.custom_attributes()?;
            let member_name = match original_name(&attributes)? {
                Some(original) => original,
                None => self.translator().enum_member_name(field.name(), &name),
            };
            trace!(member = field.name(), value, "enum member");
            fields.push(EnumField {
                name: member_name,
                id: value,
                is_obsolete: has_attribute(&attributes, OBSOLETE_ATTRIBUTE),
            });
        }

        let is_closed = !fields.iter().any(|f| f.id == 0);
        if let TopLevelKind::Enum(enum_type) = &mut self.schema.top_level_mut(id).kind {
            enum_type.fields = fields;
            enum_type.is_closed = is_closed;
        }
        if is_closed {
            debug!("enum has no zero value; marking closed");
            if let Some(file) = self.schema.top_level(id).file {
                self.schema.require_closed_enum_edition(file);
            }
        }
        Ok(id)
    }

    /// Puts a fresh declaration in its owning message, or in a new file
    fn place<T: CilType>(&mut self, ty: &T, id: TopLevelId, options: ParseOptions) -> Result<()> {
        match owning_message(ty) {
            Some(owner) => {
                let parent = self.parse_message(&owner, options)?;
                self.schema.nest(parent, id);
            }
            None => {
                let file = self.new_file(ty);
                self.schema.attach(id, file);
            }
        }
        Ok(())
    }

    fn new_file<T: CilType>(&mut self, ty: &T) -> FileId {
        self.schema.add_file(ProtoFile {
            assembly_name: Some(ty.declaring_assembly_name().to_owned()),
            namespace: ty.namespace().map(str::to_owned),
            ..Default::default()
        })
    }

    /// Imports the file of `target` into the file of `from` when they differ
    fn import_declaration(&mut self, from: TopLevelId, target: TopLevelId) {
        let (Some(from_file), Some(target_file)) = (
            self.schema.top_level(from).file,
            self.schema.top_level(target).file,
        ) else {
            return;
        };
        if from_file != target_file {
            self.schema.add_import(from_file, Import::File(target_file));
        }
    }

    fn collect_fields<T: CilType>(
        &mut self,
        ty: &T,
        id: TopLevelId,
        options: ParseOptions,
    ) -> Result<(BTreeMap<i32, MessageField>, Vec<OneOf>)> {
        let properties: Vec<_> = ty.properties().into_iter().filter(|p| !p.is_inherited()).collect();
        let id_fields: Vec<_> = ty
            .fields()
            .into_iter()
            .filter(|f| f.is_public() && f.is_static() && f.is_literal())
            .collect();

        let mut message = Message::default();
        let mut id_cursor = id_fields.iter();
        let mut index = 0;

        while index < properties.len() {
            let property = &properties[index];
            index += 1;

            match property.getter() {
                Some(getter) if !getter.is_virtual() => {}
                _ => continue,
            }
            let attributes = property.custom_attributes()?;
            if !options.include_properties_without_non_user_code_attribute
                && !has_attribute(&attributes, NON_USER_CODE_ATTRIBUTE)
            {
                trace!(property = property.name(), "skipping unmarked property");
                continue;
            }

            let property_type = property.property_type();
            if property_type.is_enum() && property_type.declaring_type().as_ref() == Some(ty) {
                message.oneofs.push(OneOf {
                    name: self.translator().oneof_name(property.name()),
                    field_ids: oneof_case_values(&property_type),
                });
                continue;
            }

            let Some(id_field) = id_cursor.next() else {
                self.diagnose(ty.full_name(), property.name(), DiagnosticKind::MissingIdField);
                continue;
            };
            let field_id = id_field
                .constant_value()
                .and_then(|c| c.as_i32())
                .ok_or_else(|| {
                    Error::precondition(
                        ty.full_name(),
                        format!("field number constant '{}' is not a 32-bit integer", id_field.name()),
                    )
                })?;

            let is_optional = properties.get(index).is_some_and(|next| {
                !next.can_write() && next.property_type().full_name() == BOOLEAN_TYPE
            });
            if is_optional {
                index += 1;
            }

            if message.fields.contains_key(&field_id) {
                self.diagnose(
                    ty.full_name(),
                    property.name(),
                    DiagnosticKind::DuplicateFieldId(field_id),
                );
                continue;
            }
            let field_type = self.resolve_field_type(&property_type, id, options)?;

            trace!(property = property.name(), field_id, is_optional, "field");
            message.fields.insert(
                field_id,
                MessageField {
                    name: self.translator().field_name(property.name()),
                    id: field_id,
                    field_type,
                    is_obsolete: has_attribute(&attributes, OBSOLETE_ATTRIBUTE),
                    is_optional,
                },
            );
        }

        self.normalize_oneofs(ty.full_name(), &mut message);
        Ok((message.fields, message.oneofs))
    }

    /// Enforces the oneof invariants on a freshly collected message
    fn normalize_oneofs(&mut self, type_name: &str, message: &mut Message) {
        let mut claimed = HashSet::new();
        let mut dropped = Vec::new();

        for oneof in &mut message.oneofs {
            let ids = std::mem::take(&mut oneof.field_ids);
            for field_id in ids {
                if message.fields.contains_key(&field_id) && claimed.insert(field_id) {
                    oneof.field_ids.push(field_id);
                } else {
                    dropped.push((oneof.name.clone(), DiagnosticKind::DanglingOneofMember(field_id)));
                }
            }
            if oneof.field_ids.is_empty() {
                dropped.push((oneof.name.clone(), DiagnosticKind::EmptyOneof));
            }
        }
        message.oneofs.retain(|o| !o.field_ids.is_empty());

        for (member, kind) in dropped {
            self.diagnose(type_name, &member, kind);
        }

        for field in message.fields.values_mut() {
            if claimed.contains(&field.id) || field.field_type.is_collection() {
                field.is_optional = false;
            }
        }
    }
}

/// Sealed, non-abstract class
fn is_message_shape<T: CilType>(ty: &T) -> bool {
    ty.is_class() && ty.is_sealed() && !ty.is_abstract()
}

/// Static class, as protoc emits for the `Types` holder of nested declarations
fn is_static_holder<T: CilType>(ty: &T) -> bool {
    ty.is_sealed() && ty.is_abstract()
}

/// The message a nested declaration belongs to, looking through a `Types` holder
fn owning_message<T: CilType>(ty: &T) -> Option<T> {
    let mut owner = ty.declaring_type()?;
    if is_static_holder(&owner) {
        owner = owner.declaring_type()?;
    }
    is_message_shape(&owner).then_some(owner)
}

/// Positive member values of a oneof case enum; zero is the unset case
fn oneof_case_values<T: CilType>(case_enum: &T) -> Vec<i32> {
    case_enum
        .fields()
        .into_iter()
        .filter(|f| f.is_static() && f.is_literal())
        .filter_map(|f| f.constant_value().and_then(|c| c.as_i32()))
        .filter(|&v| v > 0)
        .collect()
}

fn has_attribute<A: CilAttribute>(attributes: &[A], full_name: &str) -> bool {
    attributes
        .iter()
        .any(|a| a.attribute_type().full_name() == full_name)
}

/// First string argument of the named attribute, when arguments are readable
fn attribute_string<A: CilAttribute>(attributes: &[A], full_name: &str) -> Result<Option<String>> {
    let Some(attribute) = attributes
        .iter()
        .find(|a| a.attribute_type().full_name() == full_name)
    else {
        return Ok(None);
    };
    if !attribute.can_read_constructor_arguments() {
        return Ok(None);
    }
    Ok(attribute
        .constructor_arguments()?
        .first()
        .and_then(AttributeValue::as_str)
        .map(str::to_owned))
}

fn original_name<A: CilAttribute>(attributes: &[A]) -> Result<Option<String>> {
    attribute_string(attributes, ORIGINAL_NAME_ATTRIBUTE)
}

/// Carries the gRPC generator marker; under legacy metadata its presence suffices
fn is_grpc_generated<A: CilAttribute>(attributes: &[A]) -> Result<bool> {
    for attribute in attributes {
        if attribute.attribute_type().full_name() != GENERATED_CODE_ATTRIBUTE {
            continue;
        }
        if !attribute.can_read_constructor_arguments() {
            return Ok(true);
        }
        let generator = attribute.constructor_arguments()?.first().and_then(AttributeValue::as_str);
        if generator == Some(GRPC_GENERATOR) {
            return Ok(true);
        }
    }
    Ok(false)
}
