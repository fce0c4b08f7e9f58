//! Reconstructed schema and its `.proto` rendering.
//!
//! ## Architecture
//!
//! The decompiler builds a [`Schema`]: an arena of file units and the
//! messages, enums and services they declare. Once built, a schema can be
//!
//! 1. rendered as `.proto` source with [`Schema::render_file`] or
//!    [`Schema::render_all`],
//! 2. walked with a custom [`ProtoWriter`] through [`Schema::visit`],
//! 3. converted to a `FileDescriptorSet` with
//!    [`Schema::to_file_descriptor_set`],
//! 4. written to disk with [`Schema::write_files`] or
//!    [`Schema::write_combined`].
//!
//! The text layout is fixed: a generator comment, the assembly comment,
//! the syntax or edition line, imports, the `csharp_namespace` option, then
//! every top-level declaration preceded by a blank line. Indentation is two
//! spaces unless configured otherwise.

mod descriptor;
mod model;
mod output;
mod writer;

pub use model::{
    Enum, EnumField, FieldType, FileId, Import, Message, MessageField, OneOf, ProtoFile,
    Scalar, Schema, Service, ServiceMethod, TopLevel, TopLevelId, TopLevelKind, WellKnown,
};
pub use writer::{ProtoWriter, StatsWriter};

use std::fmt::Write as FmtWrite;

/// Edition that closed enums require
pub const CLOSED_ENUM_EDITION: &str = "2023";

/// Configuration for `.proto` rendering
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Indentation string (default: 2 spaces)
    pub indent_str: String,
    /// Tool name written in the leading comment
    pub generator: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            indent_str: "  ".to_string(),
            generator: "cilproto".to_string(),
        }
    }
}

impl WriterConfig {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the indentation string
    pub fn indent_str(mut self, s: impl Into<String>) -> Self {
        self.indent_str = s.into();
        self
    }

    /// Sets the tool name of the leading comment
    pub fn generator(mut self, name: impl Into<String>) -> Self {
        self.generator = name.into();
        self
    }
}

impl Schema {
    /// Renders one file unit with the default config
    pub fn render_file(&self, id: FileId) -> String {
        let mut output = String::new();
        self.write_file_to(id, &WriterConfig::default(), &mut output)
            .expect("String write cannot fail");
        output
    }

    /// Renders every file unit as one combined source
    pub fn render_all(&self) -> String {
        let mut output = String::new();
        self.write_all_to(&WriterConfig::default(), &mut output)
            .expect("String write cannot fail");
        output
    }

    /// Writes one file unit
    pub fn write_file_to(
        &self,
        id: FileId,
        config: &WriterConfig,
        w: &mut impl FmtWrite,
    ) -> std::fmt::Result {
        ProtoTextWriter::new(w, config, self).write_file(id)
    }

    /// Writes every file unit as one `.proto` source.
    ///
    /// The preamble is written once. Imports of reconstructed files are
    /// dropped since their declarations are inlined; well-known imports are
    /// merged. The edition of the first unit that carries one applies to the
    /// whole output, and `csharp_namespace` is kept only when every unit
    /// agrees on it.
    pub fn write_all_to(&self, config: &WriterConfig, w: &mut impl FmtWrite) -> std::fmt::Result {
        ProtoTextWriter::new(w, config, self).write_combined()
    }
}

/// Renders schema elements as `.proto` text
struct ProtoTextWriter<'a, W: FmtWrite> {
    writer: &'a mut W,
    config: &'a WriterConfig,
    schema: &'a Schema,
    indent_level: usize,
}

impl<'a, W: FmtWrite> ProtoTextWriter<'a, W> {
    fn new(writer: &'a mut W, config: &'a WriterConfig, schema: &'a Schema) -> Self {
        Self {
            writer,
            config,
            schema,
            indent_level: 0,
        }
    }

    fn indent(&mut self) {
        self.indent_level += 1;
    }

    fn dedent(&mut self) {
        self.indent_level = self.indent_level.saturating_sub(1);
    }

    fn write_indent(&mut self) -> std::fmt::Result {
        for _ in 0..self.indent_level {
            write!(self.writer, "{}", self.config.indent_str)?;
        }
        Ok(())
    }

    fn writeln(&mut self, s: &str) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "{}", s)
    }

    fn write_option(&mut self, name: &str, value: &str) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "option {} = {};", name, value)
    }

    fn write_file(&mut self, id: FileId) -> std::fmt::Result {
        let schema = self.schema;
        let file = schema.file(id);

        let imports: Vec<String> = file.imports.iter().map(|&i| schema.import_path(i)).collect();
        self.write_preamble(
            file.assembly_name.as_deref().into_iter(),
            file.edition.as_deref(),
            &imports,
            file.namespace.as_deref(),
        )?;

        for &top_level in &file.top_levels {
            writeln!(self.writer)?;
            self.write_top_level(top_level)?;
        }

        Ok(())
    }

    fn write_combined(&mut self) -> std::fmt::Result {
        let schema = self.schema;

        let mut assemblies: Vec<&str> = Vec::new();
        let mut imports: Vec<String> = Vec::new();
        let mut edition = None;
        let mut namespaces = Vec::new();
        for (_, file) in schema.files() {
            if let Some(assembly) = file.assembly_name.as_deref() {
                if !assemblies.contains(&assembly) {
                    assemblies.push(assembly);
                }
            }
            for &import in &file.imports {
                if let Import::WellKnown(path) = import {
                    if !imports.iter().any(|i| i == path) {
                        imports.push(path.to_owned());
                    }
                }
            }
            edition = edition.or(file.edition.as_deref());
            if !namespaces.contains(&file.namespace.as_deref()) {
                namespaces.push(file.namespace.as_deref());
            }
        }
        let namespace = match namespaces.as_slice() {
            [single] => *single,
            _ => None,
        };

        self.write_preamble(assemblies.into_iter(), edition, &imports, namespace)?;

        for (_, file) in schema.files() {
            for &top_level in &file.top_levels {
                writeln!(self.writer)?;
                self.write_top_level(top_level)?;
            }
        }

        Ok(())
    }

    fn write_preamble<'s>(
        &mut self,
        assemblies: impl Iterator<Item = &'s str>,
        edition: Option<&str>,
        imports: &[String],
        namespace: Option<&str>,
    ) -> std::fmt::Result {
        writeln!(self.writer, "// Decompiled with {}", self.config.generator)?;
        for assembly in assemblies {
            writeln!(self.writer, "// Assembly: {}", assembly)?;
        }
        writeln!(self.writer)?;

        match edition {
            Some(edition) => writeln!(self.writer, "edition = \"{}\";", escape_string(edition))?,
            None => writeln!(self.writer, "syntax = \"proto3\";")?,
        }

        if !imports.is_empty() {
            writeln!(self.writer)?;
            for path in imports {
                writeln!(self.writer, "import \"{}\";", escape_string(path))?;
            }
        }

        if let Some(namespace) = namespace {
            writeln!(self.writer)?;
            let value = format!("\"{}\"", escape_string(namespace));
            self.write_option("csharp_namespace", &value)?;
        }

        Ok(())
    }

    fn write_top_level(&mut self, id: TopLevelId) -> std::fmt::Result {
        let schema = self.schema;
        let declaration = schema.top_level(id);
        match &declaration.kind {
            TopLevelKind::Message(message) => self.write_message(id, declaration, message),
            TopLevelKind::Enum(enum_type) => self.write_enum(declaration, enum_type),
            TopLevelKind::Service(service) => self.write_service(id, declaration, service),
        }
    }

    fn write_message(
        &mut self,
        id: TopLevelId,
        declaration: &TopLevel,
        message: &Message,
    ) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "message {} {{", declaration.name)?;
        self.indent();

        if declaration.is_obsolete {
            self.write_option("deprecated", "true")?;
        }

        for field in message.fields.values() {
            if message.oneof_of(field.id).is_none() {
                self.write_field(id, field, false)?;
            }
        }

        for oneof in &message.oneofs {
            self.write_oneof(id, message, oneof)?;
        }

        for &nested in &message.nested {
            self.write_top_level(nested)?;
        }

        self.dedent();
        self.writeln("}")
    }

    fn write_oneof(&mut self, id: TopLevelId, message: &Message, oneof: &OneOf) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "oneof {} {{", oneof.name)?;
        self.indent();

        for field in oneof.field_ids.iter().filter_map(|i| message.fields.get(i)) {
            self.write_field(id, field, true)?;
        }

        self.dedent();
        self.writeln("}")
    }

    fn write_field(&mut self, from: TopLevelId, field: &MessageField, in_oneof: bool) -> std::fmt::Result {
        self.write_indent()?;

        if field.is_optional && !in_oneof && !field.field_type.is_collection() {
            write!(self.writer, "optional ")?;
        }

        write!(
            self.writer,
            "{} {} = {}",
            self.schema.type_name(from, &field.field_type),
            field.name,
            field.id
        )?;

        if field.is_obsolete {
            write!(self.writer, " [deprecated = true]")?;
        }

        writeln!(self.writer, ";")
    }

    fn write_enum(&mut self, declaration: &TopLevel, enum_type: &Enum) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "enum {} {{", declaration.name)?;
        self.indent();

        if enum_type.has_aliases() {
            self.write_option("allow_alias", "true")?;
        }
        if declaration.is_obsolete {
            self.write_option("deprecated", "true")?;
        }
        if enum_type.is_closed {
            self.write_option("features.enum_type", "CLOSED")?;
        }

        for value in &enum_type.fields {
            self.write_indent()?;
            write!(self.writer, "{} = {}", value.name, value.id)?;
            if value.is_obsolete {
                write!(self.writer, " [deprecated = true]")?;
            }
            writeln!(self.writer, ";")?;
        }

        self.dedent();
        self.writeln("}")
    }

    fn write_service(
        &mut self,
        id: TopLevelId,
        declaration: &TopLevel,
        service: &Service,
    ) -> std::fmt::Result {
        self.write_indent()?;
        writeln!(self.writer, "service {} {{", declaration.name)?;
        self.indent();

        if declaration.is_obsolete {
            self.write_option("deprecated", "true")?;
        }

        for method in &service.methods {
            self.write_method(id, method)?;
        }

        self.dedent();
        self.writeln("}")
    }

    fn write_method(&mut self, from: TopLevelId, method: &ServiceMethod) -> std::fmt::Result {
        let stream = |streamed: bool| if streamed { "stream " } else { "" };

        self.write_indent()?;
        write!(
            self.writer,
            "rpc {} ({}{}) returns ({}{})",
            method.name,
            stream(method.request_streamed),
            self.schema.type_name(from, &method.request),
            stream(method.response_streamed),
            self.schema.type_name(from, &method.response),
        )?;

        if !method.is_obsolete {
            return writeln!(self.writer, ";");
        }

        writeln!(self.writer, " {{")?;
        self.indent();
        self.write_option("deprecated", "true")?;
        self.dedent();
        self.writeln("}")
    }
}

/// Escape a string for proto syntax
fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            _ if c.is_ascii_control() => {
                result.push_str(&format!("\\x{:02x}", c as u8));
            }
            _ => result.push(c),
        }
    }
    result
}
