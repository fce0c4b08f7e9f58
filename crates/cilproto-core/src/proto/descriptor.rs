//! Conversion of a reconstructed schema into `prost_types` descriptors.
//!
//! The resulting `FileDescriptorSet` can be encoded and fed to `protoc
//! --descriptor_set_in` or any reflection library. Type references are
//! fully qualified with a leading dot; there is no package, so a nested
//! message `Outer.Inner` becomes `.Outer.Inner`.

use super::model::{
    Enum, FieldType, FileId, Message, Scalar, Schema, Service, TopLevelId, TopLevelKind,
};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumOptions, EnumValueDescriptorProto, EnumValueOptions,
    FieldDescriptorProto, FieldOptions, FileDescriptorProto, FileDescriptorSet, FileOptions,
    MessageOptions, MethodDescriptorProto, MethodOptions, OneofDescriptorProto,
    ServiceDescriptorProto, ServiceOptions,
};

impl Schema {
    /// Builds one `FileDescriptorProto` per file unit
    pub fn to_file_descriptor_set(&self) -> FileDescriptorSet {
        FileDescriptorSet {
            file: self.files().map(|(id, _)| self.file_descriptor(id)).collect(),
        }
    }

    /// Builds the descriptor of one file unit
    pub fn file_descriptor(&self, id: FileId) -> FileDescriptorProto {
        let file = self.file(id);
        let syntax = if file.edition.is_some() { "editions" } else { "proto3" };
        let mut proto = FileDescriptorProto {
            name: Some(self.file_name(id)),
            dependency: file.imports.iter().map(|&i| self.import_path(i)).collect(),
            syntax: Some(syntax.to_string()),
            options: file.namespace.as_ref().map(|ns| FileOptions {
                csharp_namespace: Some(ns.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        for &top_level in &file.top_levels {
            let declaration = self.top_level(top_level);
            match &declaration.kind {
                TopLevelKind::Message(message) => {
                    proto.message_type.push(self.message_descriptor(top_level, message))
                }
                TopLevelKind::Enum(enum_type) => {
                    proto.enum_type.push(self.enum_descriptor(top_level, enum_type))
                }
                TopLevelKind::Service(service) => {
                    proto.service.push(self.service_descriptor(top_level, service))
                }
            }
        }

        proto
    }

    /// Fully-qualified name: every enclosing message joined with dots
    fn full_proto_name(&self, id: TopLevelId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let declaration = self.top_level(id);
            names.push(declaration.name.as_str());
            current = declaration.parent;
        }
        names.reverse();
        format!(".{}", names.join("."))
    }

    fn message_descriptor(&self, id: TopLevelId, message: &Message) -> DescriptorProto {
        let declaration = self.top_level(id);
        let mut proto = DescriptorProto {
            name: Some(declaration.name.clone()),
            options: declaration.is_obsolete.then(|| MessageOptions {
                deprecated: Some(true),
                ..Default::default()
            }),
            oneof_decl: message
                .oneofs
                .iter()
                .map(|o| OneofDescriptorProto {
                    name: Some(o.name.clone()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let mut synthetic_oneofs = Vec::new();
        for field in message.fields.values() {
            let mut field_proto = FieldDescriptorProto {
                name: Some(field.name.clone()),
                number: Some(field.id),
                label: Some(Label::Optional as i32),
                options: field.is_obsolete.then(|| FieldOptions {
                    deprecated: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            };

            match &field.field_type {
                FieldType::Map(key, value) => {
                    let entry_name = format!("{}Entry", to_upper_camel_case(&field.name));
                    field_proto.label = Some(Label::Repeated as i32);
                    field_proto.r#type = Some(Type::Message as i32);
                    field_proto.type_name =
                        Some(format!("{}.{}", self.full_proto_name(id), entry_name));
                    proto.nested_type.push(self.map_entry(entry_name, key, value));
                }
                FieldType::Repeated(inner) => {
                    field_proto.label = Some(Label::Repeated as i32);
                    self.set_field_type(&mut field_proto, inner);
                }
                other => self.set_field_type(&mut field_proto, other),
            }

            if let Some(index) = message.oneof_of(field.id) {
                field_proto.oneof_index = Some(index as i32);
            } else if field.is_optional && !field.field_type.is_collection() {
                field_proto.proto3_optional = Some(true);
                synthetic_oneofs.push((field_proto.name().to_string(), proto.field.len()));
            }

            proto.field.push(field_proto);
        }

        // Synthetic oneofs of proto3 `optional` fields follow every real oneof.
        for (name, field_index) in synthetic_oneofs {
            proto.field[field_index].oneof_index = Some(proto.oneof_decl.len() as i32);
            proto.oneof_decl.push(OneofDescriptorProto {
                name: Some(format!("_{}", name)),
                ..Default::default()
            });
        }

        for &nested in &message.nested {
            match &self.top_level(nested).kind {
                TopLevelKind::Message(m) => proto.nested_type.push(self.message_descriptor(nested, m)),
                TopLevelKind::Enum(e) => proto.enum_type.push(self.enum_descriptor(nested, e)),
                TopLevelKind::Service(_) => {}
            }
        }

        proto
    }

    fn map_entry(&self, name: String, key: &FieldType, value: &FieldType) -> DescriptorProto {
        let mut fields = Vec::with_capacity(2);
        for (number, (field_name, field_type)) in [("key", key), ("value", value)].into_iter().enumerate() {
            let mut field = FieldDescriptorProto {
                name: Some(field_name.to_string()),
                number: Some(number as i32 + 1),
                label: Some(Label::Optional as i32),
                ..Default::default()
            };
            self.set_field_type(&mut field, field_type);
            fields.push(field);
        }

        DescriptorProto {
            name: Some(name),
            field: fields,
            options: Some(MessageOptions {
                map_entry: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn set_field_type(&self, field: &mut FieldDescriptorProto, field_type: &FieldType) {
        match field_type {
            FieldType::Scalar(scalar) => field.r#type = Some(scalar_type(*scalar) as i32),
            FieldType::WellKnown(wk) => {
                let is_enum = wk.name == "google.protobuf.NullValue" || wk.name == "google.protobuf.Syntax";
                field.r#type = Some(reference_type(is_enum) as i32);
                field.type_name = Some(format!(".{}", wk.name));
            }
            FieldType::Reference(target) => {
                let is_enum = matches!(self.top_level(*target).kind, TopLevelKind::Enum(_));
                field.r#type = Some(reference_type(is_enum) as i32);
                field.type_name = Some(self.full_proto_name(*target));
            }
            // Collections never nest inside each other or inside a map entry.
            FieldType::Repeated(_) | FieldType::Map(..) => {}
        }
    }

    fn enum_descriptor(&self, id: TopLevelId, enum_type: &Enum) -> EnumDescriptorProto {
        let declaration = self.top_level(id);
        let has_aliases = enum_type.has_aliases();
        let options = (has_aliases || declaration.is_obsolete).then(|| EnumOptions {
            allow_alias: has_aliases.then_some(true),
            deprecated: declaration.is_obsolete.then_some(true),
            ..Default::default()
        });

        EnumDescriptorProto {
            name: Some(declaration.name.clone()),
            value: enum_type
                .fields
                .iter()
                .map(|f| EnumValueDescriptorProto {
                    name: Some(f.name.clone()),
                    number: Some(f.id),
                    options: f.is_obsolete.then(|| EnumValueOptions {
                        deprecated: Some(true),
                        ..Default::default()
                    }),
                })
                .collect(),
            options,
            ..Default::default()
        }
    }

    fn service_descriptor(&self, id: TopLevelId, service: &Service) -> ServiceDescriptorProto {
        let declaration = self.top_level(id);
        let type_name = |t: &FieldType| match t {
            FieldType::Reference(target) => self.full_proto_name(*target),
            FieldType::WellKnown(wk) => format!(".{}", wk.name),
            other => self.type_name(id, other),
        };

        ServiceDescriptorProto {
            name: Some(declaration.name.clone()),
            method: service
                .methods
                .iter()
                .map(|m| MethodDescriptorProto {
                    name: Some(m.name.clone()),
                    input_type: Some(type_name(&m.request)),
                    output_type: Some(type_name(&m.response)),
                    client_streaming: Some(m.request_streamed),
                    server_streaming: Some(m.response_streamed),
                    options: m.is_obsolete.then(|| MethodOptions {
                        deprecated: Some(true),
                        ..Default::default()
                    }),
                })
                .collect(),
            options: declaration.is_obsolete.then(|| ServiceOptions {
                deprecated: Some(true),
                ..Default::default()
            }),
        }
    }
}

fn scalar_type(scalar: Scalar) -> Type {
    match scalar {
        Scalar::Bool => Type::Bool,
        Scalar::Bytes => Type::Bytes,
        Scalar::Double => Type::Double,
        Scalar::Float => Type::Float,
        Scalar::Int32 => Type::Int32,
        Scalar::Int64 => Type::Int64,
        Scalar::String => Type::String,
        Scalar::UInt32 => Type::Uint32,
        Scalar::UInt64 => Type::Uint64,
    }
}

fn reference_type(is_enum: bool) -> Type {
    if is_enum {
        Type::Enum
    } else {
        Type::Message
    }
}

/// Map entry naming: `snake_case` field to `PascalCase`
fn to_upper_camel_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut capitalize_next = true;

    for c in s.chars() {
        if c == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            result.push(c.to_ascii_uppercase());
            capitalize_next = false;
        } else {
            result.push(c);
        }
    }

    result
}
