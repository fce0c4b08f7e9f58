//! In-memory schema model.
//!
//! Declarations live in a flat arena owned by [`Schema`] and refer to each
//! other by [`TopLevelId`]. That lets a message reference itself, a sibling
//! or an enclosing message while it is still being built, which is how
//! recursive schemas are reconstructed.

use super::CLOSED_ENUM_EDITION;
use std::collections::BTreeMap;

/// Handle of a file unit within a [`Schema`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) usize);

/// Handle of a message, enum or service within a [`Schema`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopLevelId(pub(crate) usize);

/// One `.proto` file
#[derive(Debug, Clone, Default)]
pub struct ProtoFile {
    /// Edition string; `None` renders as `syntax = "proto3"`
    pub edition: Option<String>,
    /// Assembly the declarations were recovered from
    pub assembly_name: Option<String>,
    /// C# namespace, rendered as `option csharp_namespace`
    pub namespace: Option<String>,
    /// Imports in first-use order, without duplicates
    pub imports: Vec<Import>,
    /// Top-level declarations in discovery order
    pub top_levels: Vec<TopLevelId>,
}

/// An import of another file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Import {
    /// A reconstructed file
    File(FileId),
    /// A `google/protobuf/*.proto` file
    WellKnown(&'static str),
}

/// A named declaration
#[derive(Debug, Clone)]
pub struct TopLevel {
    /// Declared name
    pub name: String,
    /// Carries `ObsoleteAttribute`
    pub is_obsolete: bool,
    /// Owning file; unset only while the declaration is being built
    pub file: Option<FileId>,
    /// Enclosing message of a nested declaration
    pub parent: Option<TopLevelId>,
    /// The declaration body
    pub kind: TopLevelKind,
}

/// Declaration bodies
#[derive(Debug, Clone)]
pub enum TopLevelKind {
    /// `message`
    Message(Message),
    /// `enum`
    Enum(Enum),
    /// `service`
    Service(Service),
}

impl TopLevel {
    /// Message body, if this is a message
    pub fn as_message(&self) -> Option<&Message> {
        match &self.kind {
            TopLevelKind::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Enum body, if this is an enum
    pub fn as_enum(&self) -> Option<&Enum> {
        match &self.kind {
            TopLevelKind::Enum(e) => Some(e),
            _ => None,
        }
    }

    /// Service body, if this is a service
    pub fn as_service(&self) -> Option<&Service> {
        match &self.kind {
            TopLevelKind::Service(s) => Some(s),
            _ => None,
        }
    }
}

/// A message body
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Fields keyed by number
    pub fields: BTreeMap<i32, MessageField>,
    /// Oneof groups in discovery order
    pub oneofs: Vec<OneOf>,
    /// Nested messages and enums in discovery order
    pub nested: Vec<TopLevelId>,
}

impl Message {
    /// Finds the oneof group that claims `id`
    pub fn oneof_of(&self, id: i32) -> Option<usize> {
        self.oneofs.iter().position(|o| o.field_ids.contains(&id))
    }
}

/// A oneof group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneOf {
    /// Group name
    pub name: String,
    /// Member field numbers in declaration order
    pub field_ids: Vec<i32>,
}

/// A message field
#[derive(Debug, Clone, PartialEq)]
pub struct MessageField {
    /// Field name
    pub name: String,
    /// Field number
    pub id: i32,
    /// Field type
    pub field_type: FieldType,
    /// Carries `ObsoleteAttribute`
    pub is_obsolete: bool,
    /// Has an explicit presence companion; rendered as `optional`
    pub is_optional: bool,
}

/// A resolved field, request or response type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// A scalar keyword
    Scalar(Scalar),
    /// A `google.protobuf.*` type
    WellKnown(WellKnown),
    /// `repeated T`
    Repeated(Box<FieldType>),
    /// `map<K, V>`
    Map(Box<FieldType>, Box<FieldType>),
    /// A reconstructed message or enum
    Reference(TopLevelId),
}

impl FieldType {
    /// True for `repeated` and `map` types
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Repeated(_) | Self::Map(..))
    }
}

/// Scalar keywords recovered from CLR primitive types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Scalar {
    Bool,
    Bytes,
    Double,
    Float,
    Int32,
    Int64,
    String,
    UInt32,
    UInt64,
}

impl Scalar {
    /// Maps a CLR full type name to its scalar keyword
    pub fn from_clr_name(full_name: &str) -> Option<Self> {
        Some(match full_name {
            "System.String" => Self::String,
            "System.Boolean" => Self::Bool,
            "System.Double" => Self::Double,
            "System.UInt32" => Self::UInt32,
            "System.UInt64" => Self::UInt64,
            "System.Int32" => Self::Int32,
            "System.Int64" => Self::Int64,
            "System.Single" => Self::Float,
            "Google.Protobuf.ByteString" => Self::Bytes,
            _ => return None,
        })
    }

    /// The `.proto` keyword
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::Double => "double",
            Self::Float => "float",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
        }
    }
}

/// A well-known type and the file that defines it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WellKnown {
    /// Fully-qualified proto name (`google.protobuf.Timestamp`)
    pub name: &'static str,
    /// Import path (`google/protobuf/timestamp.proto`)
    pub file: &'static str,
}

const CLR_WELL_KNOWN_NAMESPACE: &str = "Google.Protobuf.WellKnownTypes.";

const WELL_KNOWN_TYPES: &[WellKnown] = &[
    wk("google.protobuf.Any", "google/protobuf/any.proto"),
    wk("google.protobuf.Api", "google/protobuf/api.proto"),
    wk("google.protobuf.BoolValue", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.BytesValue", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.DoubleValue", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.Duration", "google/protobuf/duration.proto"),
    wk("google.protobuf.Empty", "google/protobuf/empty.proto"),
    wk("google.protobuf.Enum", "google/protobuf/type.proto"),
    wk("google.protobuf.EnumValue", "google/protobuf/type.proto"),
    wk("google.protobuf.Field", "google/protobuf/type.proto"),
    wk("google.protobuf.FieldMask", "google/protobuf/field_mask.proto"),
    wk("google.protobuf.FloatValue", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.Int32Value", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.Int64Value", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.ListValue", "google/protobuf/struct.proto"),
    wk("google.protobuf.Method", "google/protobuf/api.proto"),
    wk("google.protobuf.Mixin", "google/protobuf/api.proto"),
    wk("google.protobuf.NullValue", "google/protobuf/struct.proto"),
    wk("google.protobuf.Option", "google/protobuf/type.proto"),
    wk("google.protobuf.SourceContext", "google/protobuf/source_context.proto"),
    wk("google.protobuf.StringValue", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.Struct", "google/protobuf/struct.proto"),
    wk("google.protobuf.Syntax", "google/protobuf/type.proto"),
    wk("google.protobuf.Timestamp", "google/protobuf/timestamp.proto"),
    wk("google.protobuf.Type", "google/protobuf/type.proto"),
    wk("google.protobuf.UInt32Value", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.UInt64Value", "google/protobuf/wrappers.proto"),
    wk("google.protobuf.Value", "google/protobuf/struct.proto"),
];

const fn wk(name: &'static str, file: &'static str) -> WellKnown {
    WellKnown { name, file }
}

impl WellKnown {
    /// Looks up a proto name such as `google.protobuf.Duration`
    pub fn by_name(name: &str) -> Option<Self> {
        WELL_KNOWN_TYPES.iter().find(|w| w.name == name).copied()
    }

    /// Maps a CLR type from `Google.Protobuf.WellKnownTypes`
    pub fn from_clr_name(full_name: &str) -> Option<Self> {
        let simple = full_name.strip_prefix(CLR_WELL_KNOWN_NAMESPACE)?;
        WELL_KNOWN_TYPES
            .iter()
            .find(|w| w.name.strip_prefix("google.protobuf.") == Some(simple))
            .copied()
    }

    /// Maps `System.Nullable<T>` of a primitive to its wrapper type
    pub fn wrapper_for_clr_name(full_name: &str) -> Option<Self> {
        let name = match full_name {
            "System.Boolean" => "google.protobuf.BoolValue",
            "System.Double" => "google.protobuf.DoubleValue",
            "System.Single" => "google.protobuf.FloatValue",
            "System.Int32" => "google.protobuf.Int32Value",
            "System.Int64" => "google.protobuf.Int64Value",
            "System.UInt32" => "google.protobuf.UInt32Value",
            "System.UInt64" => "google.protobuf.UInt64Value",
            _ => return None,
        };
        Self::by_name(name)
    }
}

/// An enum body
#[derive(Debug, Clone, Default)]
pub struct Enum {
    /// Members in declaration order
    pub fields: Vec<EnumField>,
    /// No member has value 0; requires editions syntax
    pub is_closed: bool,
}

impl Enum {
    /// True if two members share a value, which requires `allow_alias`
    pub fn has_aliases(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.fields.len());
        self.fields.iter().any(|f| !seen.insert(f.id))
    }
}

/// An enum member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumField {
    /// Member name
    pub name: String,
    /// Member value
    pub id: i32,
    /// Carries `ObsoleteAttribute`
    pub is_obsolete: bool,
}

/// A service body
#[derive(Debug, Clone, Default)]
pub struct Service {
    /// RPC methods in declaration order
    pub methods: Vec<ServiceMethod>,
}

impl Service {
    /// True if a method with this name is already present
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

/// An RPC method
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMethod {
    /// Method name
    pub name: String,
    /// Request message type
    pub request: FieldType,
    /// Response message type
    pub response: FieldType,
    /// Client streaming
    pub request_streamed: bool,
    /// Server streaming
    pub response_streamed: bool,
    /// Carries `ObsoleteAttribute`
    pub is_obsolete: bool,
}

/// Arena of files and declarations built by one decompilation run
#[derive(Debug, Clone, Default)]
pub struct Schema {
    files: Vec<ProtoFile>,
    top_levels: Vec<TopLevel>,
}

impl Schema {
    /// Creates an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// All files in creation order
    pub fn files(&self) -> impl ExactSizeIterator<Item = (FileId, &ProtoFile)> + '_ {
        self.files.iter().enumerate().map(|(i, f)| (FileId(i), f))
    }

    /// Number of files
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of declarations, nested ones included
    pub fn top_level_count(&self) -> usize {
        self.top_levels.len()
    }

    /// A file by id
    pub fn file(&self, id: FileId) -> &ProtoFile {
        &self.files[id.0]
    }

    /// A file by id, mutably
    pub fn file_mut(&mut self, id: FileId) -> &mut ProtoFile {
        &mut self.files[id.0]
    }

    /// A declaration by id
    pub fn top_level(&self, id: TopLevelId) -> &TopLevel {
        &self.top_levels[id.0]
    }

    /// A declaration by id, mutably
    pub fn top_level_mut(&mut self, id: TopLevelId) -> &mut TopLevel {
        &mut self.top_levels[id.0]
    }

    /// Adds a file
    pub fn add_file(&mut self, file: ProtoFile) -> FileId {
        self.files.push(file);
        FileId(self.files.len() - 1)
    }

    /// Adds a detached declaration; attach it with [`attach`](Self::attach) or [`nest`](Self::nest)
    pub fn add_top_level(&mut self, name: impl Into<String>, is_obsolete: bool, kind: TopLevelKind) -> TopLevelId {
        self.top_levels.push(TopLevel {
            name: name.into(),
            is_obsolete,
            file: None,
            parent: None,
            kind,
        });
        TopLevelId(self.top_levels.len() - 1)
    }

    /// Makes `id` a top-level declaration of `file`
    pub fn attach(&mut self, id: TopLevelId, file: FileId) {
        self.files[file.0].top_levels.push(id);
        self.assign_file(id, file);
    }

    /// Makes `child` a nested declaration of the message `parent`, sharing its file.
    ///
    /// The parent may itself still be unplaced; its descendants receive a
    /// file once it does.
    pub fn nest(&mut self, parent: TopLevelId, child: TopLevelId) {
        if let TopLevelKind::Message(message) = &mut self.top_levels[parent.0].kind {
            message.nested.push(child);
        }
        self.top_levels[child.0].parent = Some(parent);
        if let Some(file) = self.top_levels[parent.0].file {
            self.assign_file(child, file);
        }
    }

    /// Sets the file of `id` and everything nested in it.
    ///
    /// A closed enum upgrades the file to the edition it needs.
    fn assign_file(&mut self, id: TopLevelId, file: FileId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let declaration = &mut self.top_levels[id.0];
            declaration.file = Some(file);
            let is_closed_enum = match &declaration.kind {
                TopLevelKind::Message(message) => {
                    pending.extend(message.nested.iter().copied());
                    false
                }
                TopLevelKind::Enum(e) => e.is_closed,
                TopLevelKind::Service(_) => false,
            };
            if is_closed_enum {
                self.require_closed_enum_edition(file);
            }
        }
    }

    /// Upgrades a proto3 file to the edition closed enums need
    pub fn require_closed_enum_edition(&mut self, file: FileId) {
        self.files[file.0]
            .edition
            .get_or_insert_with(|| CLOSED_ENUM_EDITION.to_string());
    }

    /// Records an import, keeping first-use order
    pub fn add_import(&mut self, file: FileId, import: Import) {
        let imports = &mut self.files[file.0].imports;
        if !imports.contains(&import) {
            imports.push(import);
        }
    }

    /// Output file name: the first top-level declaration's name plus `.proto`
    pub fn file_name(&self, id: FileId) -> String {
        let first = self.files[id.0]
            .top_levels
            .first()
            .map_or("", |t| self.top_levels[t.0].name.as_str());
        format!("{}.proto", first)
    }

    /// Import path of an import
    pub fn import_path(&self, import: Import) -> String {
        match import {
            Import::File(file) => self.file_name(file),
            Import::WellKnown(path) => path.to_owned(),
        }
    }

    /// Name of `target` as written inside `from`.
    ///
    /// Declarations nested under a strict ancestor of `from` are written as
    /// a dotted path relative to that ancestor; everything else by bare name.
    pub fn qualify_type_name(&self, from: TopLevelId, target: TopLevelId) -> String {
        let declaration = &self.top_levels[target.0];
        let parent = match declaration.parent {
            Some(parent) if parent != from => parent,
            _ => return declaration.name.clone(),
        };

        let mut names = vec![declaration.name.as_str()];
        let mut current = Some(parent);
        while let Some(id) = current.filter(|id| *id != from) {
            let ancestor = &self.top_levels[id.0];
            names.push(&ancestor.name);
            current = ancestor.parent;
        }
        names.reverse();
        names.join(".")
    }

    /// Rendered type name, `repeated` and `map<..>` included
    pub fn type_name(&self, from: TopLevelId, field_type: &FieldType) -> String {
        match field_type {
            FieldType::Scalar(s) => s.as_str().to_owned(),
            FieldType::WellKnown(w) => w.name.to_owned(),
            FieldType::Repeated(inner) => format!("repeated {}", self.type_name(from, inner)),
            FieldType::Map(key, value) => format!(
                "map<{}, {}>",
                self.type_name(from, key),
                self.type_name(from, value)
            ),
            FieldType::Reference(id) => self.qualify_type_name(from, *id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(schema: &mut Schema, name: &str) -> TopLevelId {
        schema.add_top_level(name, false, TopLevelKind::Message(Message::default()))
    }

    #[test]
    fn test_qualify_type_name() {
        let mut schema = Schema::new();
        let file = schema.add_file(ProtoFile::default());
        let outer = message(&mut schema, "Outer");
        let inner = message(&mut schema, "Inner");
        let deep = message(&mut schema, "Deep");
        let other = message(&mut schema, "Other");
        schema.attach(outer, file);
        schema.attach(other, file);
        schema.nest(outer, inner);
        schema.nest(inner, deep);

        assert_eq!(schema.qualify_type_name(outer, inner), "Inner");
        assert_eq!(schema.qualify_type_name(inner, deep), "Deep");
        assert_eq!(schema.qualify_type_name(outer, deep), "Inner.Deep");
        assert_eq!(schema.qualify_type_name(other, deep), "Outer.Inner.Deep");
        assert_eq!(schema.qualify_type_name(deep, other), "Other");
        assert_eq!(schema.top_level(deep).file, Some(file));
    }

    #[test]
    fn test_late_placement_reaches_descendants() {
        let mut schema = Schema::new();
        let outer = message(&mut schema, "Outer");
        let inner = message(&mut schema, "Inner");
        let closed = schema.add_top_level(
            "Closed",
            false,
            TopLevelKind::Enum(Enum {
                fields: Vec::new(),
                is_closed: true,
            }),
        );
        schema.nest(outer, inner);
        schema.nest(inner, closed);
        assert_eq!(schema.top_level(closed).file, None);

        let file = schema.add_file(ProtoFile::default());
        schema.attach(outer, file);
        assert_eq!(schema.top_level(inner).file, Some(file));
        assert_eq!(schema.top_level(closed).file, Some(file));
        assert_eq!(schema.file(file).edition.as_deref(), Some("2023"));
    }

    #[test]
    fn test_file_name_and_imports() {
        let mut schema = Schema::new();
        let a = schema.add_file(ProtoFile::default());
        assert_eq!(schema.file_name(a), ".proto");
        let foo = message(&mut schema, "Foo");
        schema.attach(foo, a);
        assert_eq!(schema.file_name(a), "Foo.proto");

        let ts = WellKnown::by_name("google.protobuf.Timestamp").unwrap();
        schema.add_import(a, Import::WellKnown(ts.file));
        schema.add_import(a, Import::WellKnown(ts.file));
        assert_eq!(schema.file(a).imports.len(), 1);
        assert_eq!(schema.import_path(schema.file(a).imports[0]), "google/protobuf/timestamp.proto");
    }

    #[test]
    fn test_well_known_lookup() {
        let duration = WellKnown::from_clr_name("Google.Protobuf.WellKnownTypes.Duration").unwrap();
        assert_eq!(duration.name, "google.protobuf.Duration");
        assert_eq!(duration.file, "google/protobuf/duration.proto");
        assert!(WellKnown::from_clr_name("Google.Protobuf.WellKnownTypes.Nope").is_none());
        assert!(WellKnown::from_clr_name("System.String").is_none());
        assert_eq!(
            WellKnown::wrapper_for_clr_name("System.Int64").map(|w| w.name),
            Some("google.protobuf.Int64Value")
        );
    }

    #[test]
    fn test_type_names() {
        let mut schema = Schema::new();
        let foo = message(&mut schema, "Foo");
        let map = FieldType::Map(
            Box::new(FieldType::Scalar(Scalar::String)),
            Box::new(FieldType::Scalar(Scalar::Int32)),
        );
        assert_eq!(schema.type_name(foo, &map), "map<string, int32>");
        let list = FieldType::Repeated(Box::new(FieldType::Reference(foo)));
        assert_eq!(schema.type_name(foo, &list), "repeated Foo");
        assert!(list.is_collection());
        assert_eq!(Scalar::from_clr_name("Google.Protobuf.ByteString"), Some(Scalar::Bytes));
    }

    #[test]
    fn test_enum_aliases() {
        let field = |name: &str, id| EnumField {
            name: name.to_owned(),
            id,
            is_obsolete: false,
        };
        let mut e = Enum {
            fields: vec![field("A", 0), field("B", 5)],
            is_closed: false,
        };
        assert!(!e.has_aliases());
        e.fields.push(field("C", 5));
        assert!(e.has_aliases());
    }
}
