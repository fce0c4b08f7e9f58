//! Extensible schema walking.
//!
//! [`Schema::visit`] walks every file and declaration in output order and
//! reports each element to a [`ProtoWriter`]. The text renderer does not go
//! through this trait; it exists for alternative outputs such as
//! [`StatsWriter`].

use super::model::{
    Enum, FileId, Message, MessageField, OneOf, ProtoFile, Schema, Service, ServiceMethod,
    TopLevel, TopLevelId, TopLevelKind,
};
use std::fmt::Result;

/// Receives schema elements in output order.
///
/// Every method defaults to doing nothing, so implementations override only
/// what they care about.
pub trait ProtoWriter {
    /// A file unit, before its declarations
    fn write_file(&mut self, file: &ProtoFile) -> Result {
        let _ = file;
        Ok(())
    }

    /// A message, before its fields and nested declarations
    fn write_message(&mut self, declaration: &TopLevel, message: &Message) -> Result {
        let _ = (declaration, message);
        Ok(())
    }

    /// A message field, oneof members included
    fn write_field(&mut self, field: &MessageField) -> Result {
        let _ = field;
        Ok(())
    }

    /// A oneof group, before its member fields
    fn write_oneof(&mut self, oneof: &OneOf) -> Result {
        let _ = oneof;
        Ok(())
    }

    /// An enum
    fn write_enum(&mut self, declaration: &TopLevel, enum_type: &Enum) -> Result {
        let _ = (declaration, enum_type);
        Ok(())
    }

    /// A service, before its methods
    fn write_service(&mut self, declaration: &TopLevel, service: &Service) -> Result {
        let _ = (declaration, service);
        Ok(())
    }

    /// A service method
    fn write_method(&mut self, method: &ServiceMethod) -> Result {
        let _ = method;
        Ok(())
    }
}

/// Counts declarations and members
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsWriter {
    /// Number of files
    pub file_count: usize,
    /// Number of messages, nested ones included
    pub message_count: usize,
    /// Number of message fields
    pub field_count: usize,
    /// Number of oneof groups
    pub oneof_count: usize,
    /// Number of enums, nested ones included
    pub enum_count: usize,
    /// Number of services
    pub service_count: usize,
    /// Number of service methods
    pub method_count: usize,
}

impl ProtoWriter for StatsWriter {
    fn write_file(&mut self, _file: &ProtoFile) -> Result {
        self.file_count += 1;
        Ok(())
    }

    fn write_message(&mut self, _declaration: &TopLevel, _message: &Message) -> Result {
        self.message_count += 1;
        Ok(())
    }

    fn write_field(&mut self, _field: &MessageField) -> Result {
        self.field_count += 1;
        Ok(())
    }

    fn write_oneof(&mut self, _oneof: &OneOf) -> Result {
        self.oneof_count += 1;
        Ok(())
    }

    fn write_enum(&mut self, _declaration: &TopLevel, _enum_type: &Enum) -> Result {
        self.enum_count += 1;
        Ok(())
    }

    fn write_service(&mut self, _declaration: &TopLevel, _service: &Service) -> Result {
        self.service_count += 1;
        Ok(())
    }

    fn write_method(&mut self, _method: &ServiceMethod) -> Result {
        self.method_count += 1;
        Ok(())
    }
}

impl Schema {
    /// Walks every file in creation order
    pub fn visit(&self, writer: &mut impl ProtoWriter) -> Result {
        for (id, _) in self.files() {
            self.visit_file(id, writer)?;
        }
        Ok(())
    }

    /// Walks one file
    pub fn visit_file(&self, id: FileId, writer: &mut impl ProtoWriter) -> Result {
        let file = self.file(id);
        writer.write_file(file)?;
        for &top_level in &file.top_levels {
            self.visit_top_level(top_level, writer)?;
        }
        Ok(())
    }

    fn visit_top_level(&self, id: TopLevelId, writer: &mut impl ProtoWriter) -> Result {
        let declaration = self.top_level(id);
        match &declaration.kind {
            TopLevelKind::Message(message) => {
                writer.write_message(declaration, message)?;
                for field in message.fields.values() {
                    if message.oneof_of(field.id).is_none() {
                        writer.write_field(field)?;
                    }
                }
                for oneof in &message.oneofs {
                    writer.write_oneof(oneof)?;
                    for field in oneof.field_ids.iter().filter_map(|i| message.fields.get(i)) {
                        writer.write_field(field)?;
                    }
                }
                for &nested in &message.nested {
                    self.visit_top_level(nested, writer)?;
                }
            }
            TopLevelKind::Enum(enum_type) => writer.write_enum(declaration, enum_type)?,
            TopLevelKind::Service(service) => {
                writer.write_service(declaration, service)?;
                for method in &service.methods {
                    writer.write_method(method)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::model::{FieldType, Scalar};

    fn field(name: &str, id: i32) -> MessageField {
        MessageField {
            name: name.to_owned(),
            id,
            field_type: FieldType::Scalar(Scalar::Int32),
            is_obsolete: false,
            is_optional: false,
        }
    }

    #[test]
    fn test_stats_writer() {
        let mut schema = Schema::new();
        let file = schema.add_file(ProtoFile::default());

        let mut message = Message::default();
        message.fields.insert(1, field("a", 1));
        message.fields.insert(2, field("b", 2));
        message.fields.insert(3, field("c", 3));
        message.oneofs.push(OneOf {
            name: "choice".to_owned(),
            field_ids: vec![2, 3],
        });
        let foo = schema.add_top_level("Foo", false, TopLevelKind::Message(message));
        schema.attach(foo, file);
        let kind = schema.add_top_level("Kind", false, TopLevelKind::Enum(Enum::default()));
        schema.nest(foo, kind);

        let mut stats = StatsWriter::default();
        schema.visit(&mut stats).unwrap();

        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.message_count, 1);
        assert_eq!(stats.field_count, 3);
        assert_eq!(stats.oneof_count, 1);
        assert_eq!(stats.enum_count, 1);
        assert_eq!(stats.service_count, 0);
    }

    #[derive(Default)]
    struct FieldOrder(Vec<i32>);

    impl ProtoWriter for FieldOrder {
        fn write_field(&mut self, field: &MessageField) -> Result {
            self.0.push(field.id);
            Ok(())
        }
    }

    #[test]
    fn test_oneof_members_visited_last() {
        let mut schema = Schema::new();
        let file = schema.add_file(ProtoFile::default());
        let mut message = Message::default();
        for id in [4, 1, 3, 2] {
            message.fields.insert(id, field("f", id));
        }
        message.oneofs.push(OneOf {
            name: "o".to_owned(),
            field_ids: vec![3, 1],
        });
        let foo = schema.add_top_level("Foo", false, TopLevelKind::Message(message));
        schema.attach(foo, file);

        let mut order = FieldOrder::default();
        schema.visit(&mut order).unwrap();
        assert_eq!(order.0, vec![2, 4, 3, 1]);
    }
}
