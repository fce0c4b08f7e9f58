//! Builders for reflection-style assembly fixtures shaped like protoc and
//! gRPC plugin output.

#![allow(dead_code)]

use cilproto_core::attribute::AttributeValue;
use cilproto_core::metadata::clr::{
    ClrAssembly, ClrAttributeData, ClrFieldDef, ClrLoader, ClrMethodDef, ClrPropertyDef,
    ClrTypeDef, TypeRef,
};
use cilproto_core::metadata::ConstantValue;

pub const NON_USER_CODE: &str = "System.Diagnostics.DebuggerNonUserCodeAttribute";
pub const GENERATED_CODE: &str = "System.CodeDom.Compiler.GeneratedCodeAttribute";
pub const OBSOLETE: &str = "System.ObsoleteAttribute";
pub const ORIGINAL_NAME: &str = "Google.Protobuf.Reflection.OriginalNameAttribute";
pub const BIND_SERVICE_METHOD: &str = "Grpc.Core.BindServiceMethodAttribute";

pub fn named(name: &str) -> TypeRef {
    TypeRef::named(name)
}

pub fn generic(name: &str, args: &[&str]) -> TypeRef {
    TypeRef::generic(name, args.iter().map(|a| TypeRef::named(*a)).collect())
}

pub fn attribute(attribute_type: &str) -> ClrAttributeData {
    ClrAttributeData {
        attribute_type: attribute_type.to_owned(),
        arguments: Vec::new(),
    }
}

pub fn attribute_with(attribute_type: &str, argument: &str) -> ClrAttributeData {
    ClrAttributeData {
        attribute_type: attribute_type.to_owned(),
        arguments: vec![AttributeValue::String(Some(argument.to_owned()))],
    }
}

fn type_def(full_name: &str) -> ClrTypeDef {
    let (namespace, declaring_type, name) = match full_name.rsplit_once('+') {
        Some((outer, name)) => (None, Some(outer.to_owned()), name.to_owned()),
        None => match full_name.rsplit_once('.') {
            Some((ns, name)) => (Some(ns.to_owned()), None, name.to_owned()),
            None => (None, None, full_name.to_owned()),
        },
    };
    ClrTypeDef {
        name,
        namespace,
        declaring_type,
        base_type: Some(named("System.Object")),
        interfaces: Vec::new(),
        is_abstract: false,
        is_sealed: false,
        is_enum: false,
        is_interface: false,
        is_value_type: false,
        fields: Vec::new(),
        methods: Vec::new(),
        properties: Vec::new(),
        attributes: Vec::new(),
    }
}

fn literal(name: &str, value: ConstantValue) -> ClrFieldDef {
    ClrFieldDef {
        name: name.to_owned(),
        is_static: true,
        is_public: true,
        is_literal: true,
        constant: Some(value),
        attributes: Vec::new(),
    }
}

fn method(name: &str, return_type: TypeRef, parameters: Vec<TypeRef>) -> ClrMethodDef {
    ClrMethodDef {
        name: name.to_owned(),
        return_type,
        parameters,
        is_static: false,
        is_public: true,
        is_virtual: false,
        attributes: Vec::new(),
    }
}

/// A generated message class
pub struct MessageBuilder {
    def: ClrTypeDef,
    extra: Vec<ClrTypeDef>,
}

impl MessageBuilder {
    /// `full_name` uses `+` for nesting, e.g. `App.Outer+Types+Inner`
    pub fn new(full_name: &str) -> Self {
        let mut def = type_def(full_name);
        def.is_sealed = true;
        def.interfaces.push(generic("Google.Protobuf.IMessage`1", &[full_name]));
        Self {
            def,
            extra: Vec::new(),
        }
    }

    fn full_name(&self) -> String {
        match (&self.def.declaring_type, &self.def.namespace) {
            (Some(outer), _) => format!("{}+{}", outer, self.def.name),
            (None, Some(ns)) => format!("{}.{}", ns, self.def.name),
            _ => self.def.name.clone(),
        }
    }

    fn push_property(&mut self, name: &str, property_type: TypeRef, writable: bool, marked: bool) {
        let getter = format!("get_{}", name);
        self.def.methods.push(method(&getter, property_type.clone(), vec![]));
        let setter = writable.then(|| {
            let setter = format!("set_{}", name);
            self.def
                .methods
                .push(method(&setter, named("System.Void"), vec![property_type.clone()]));
            setter
        });
        self.def.properties.push(ClrPropertyDef {
            name: name.to_owned(),
            property_type,
            getter: Some(getter),
            setter,
            attributes: if marked { vec![attribute(NON_USER_CODE)] } else { vec![] },
        });
    }

    /// Field number constant plus its property
    pub fn field(mut self, name: &str, number: i32, property_type: TypeRef) -> Self {
        self.def
            .fields
            .push(literal(&format!("{}FieldNumber", name), ConstantValue::I4(number)));
        self.push_property(name, property_type, true, true);
        self
    }

    /// A field followed by its read-only `HasX` companion
    pub fn optional_field(self, name: &str, number: i32, property_type: TypeRef) -> Self {
        let mut builder = self.field(name, number, property_type);
        builder.push_property(&format!("Has{}", name), named("System.Boolean"), false, true);
        builder
    }

    /// A field whose property lacks `DebuggerNonUserCodeAttribute`
    pub fn unmarked_field(mut self, name: &str, number: i32, property_type: TypeRef) -> Self {
        self.def
            .fields
            .push(literal(&format!("{}FieldNumber", name), ConstantValue::I4(number)));
        self.push_property(name, property_type, true, false);
        self
    }

    /// A property with no field number constant
    pub fn bare_property(mut self, name: &str, property_type: TypeRef) -> Self {
        self.push_property(name, property_type, true, true);
        self
    }

    /// A field number constant with no property
    pub fn bare_constant(mut self, name: &str, value: ConstantValue) -> Self {
        self.def.fields.push(literal(name, value));
        self
    }

    /// `XCase` discriminator and its nested `XOneofCase` enum with `cases` as members
    pub fn oneof(mut self, name: &str, cases: &[(&str, i32)]) -> Self {
        let case_enum = format!("{}+{}OneofCase", self.full_name(), name);
        let mut members = vec![("None", 0)];
        members.extend_from_slice(cases);
        self.extra.push(enum_def(&case_enum, &members));
        self.push_property(&format!("{}Case", name), named(&case_enum), false, true);
        self
    }

    pub fn attribute(mut self, attribute_type: &str) -> Self {
        self.def.attributes.push(attribute(attribute_type));
        self
    }

    /// Drops the sealed flag, which no generated message lacks
    pub fn unsealed(mut self) -> Self {
        self.def.is_sealed = false;
        self
    }

    pub fn build(self) -> Vec<ClrTypeDef> {
        let mut defs = vec![self.def];
        defs.extend(self.extra);
        defs
    }
}

/// A generated enum with its members in declaration order
pub fn enum_def(full_name: &str, members: &[(&str, i32)]) -> ClrTypeDef {
    let mut def = type_def(full_name);
    def.base_type = Some(named("System.Enum"));
    def.is_enum = true;
    def.is_sealed = true;
    def.is_value_type = true;
    def.fields.push(ClrFieldDef {
        name: "value__".to_owned(),
        is_static: false,
        is_public: true,
        is_literal: false,
        constant: None,
        attributes: Vec::new(),
    });
    for (name, value) in members {
        def.fields.push(literal(name, ConstantValue::I4(*value)));
    }
    def
}

/// Adds `OriginalNameAttribute("original")` to the member named `member`
pub fn with_original_name(mut def: ClrTypeDef, member: &str, original: &str) -> ClrTypeDef {
    if let Some(field) = def.fields.iter_mut().find(|f| f.name == member) {
        field.attributes.push(attribute_with(ORIGINAL_NAME, original));
    }
    def
}

/// The static `Types` holder protoc nests declarations in
pub fn types_holder(message: &str) -> ClrTypeDef {
    let mut def = type_def(&format!("{}+Types", message));
    def.is_abstract = true;
    def.is_sealed = true;
    def
}

/// Static holder, server base and client of a gRPC service
pub struct ServiceBuilder {
    holder: ClrTypeDef,
    server: ClrTypeDef,
    client: ClrTypeDef,
}

impl ServiceBuilder {
    pub fn new(full_name: &str) -> Self {
        let mut holder = type_def(full_name);
        holder.is_abstract = true;
        holder.is_sealed = true;

        let mut server = type_def(&format!("{}+{}Base", full_name, holder.name));
        server.is_abstract = true;
        server.attributes.push(attribute(BIND_SERVICE_METHOD));

        let client_name = format!("{}+{}Client", full_name, holder.name);
        let mut client = type_def(&client_name);
        client.base_type = Some(generic("Grpc.Core.ClientBase`1", &[&client_name]));
        client.methods.push(ClrMethodDef {
            is_public: false,
            ..method("NewInstance", named(&client_name), vec![named("Grpc.Core.ClientBase+ClientBaseConfiguration")])
        });
        client.methods.push(method(".ctor", named("System.Void"), vec![]));

        Self {
            holder,
            server,
            client,
        }
    }

    fn push_server(&mut self, name: &str, return_type: TypeRef, parameters: Vec<TypeRef>) {
        let mut m = method(name, return_type, parameters);
        m.is_virtual = true;
        m.attributes.push(attribute_with(GENERATED_CODE, "grpc_csharp_plugin"));
        self.server.methods.push(m);
    }

    fn push_client(&mut self, name: &str, return_type: TypeRef, parameters: Vec<TypeRef>) {
        let mut m = method(name, return_type, parameters);
        m.is_virtual = true;
        m.attributes.push(attribute_with(GENERATED_CODE, "grpc_csharp_plugin"));
        self.client.methods.push(m);
    }

    pub fn unary(mut self, name: &str, request: &str, response: &str) -> Self {
        self.push_server(
            name,
            generic("System.Threading.Tasks.Task`1", &[response]),
            vec![named(request), named("Grpc.Core.ServerCallContext")],
        );
        let options = vec![named(request), named("Grpc.Core.CallOptions")];
        self.push_client(
            name,
            named(response),
            vec![named(request), named("Grpc.Core.Metadata"), named("System.DateTime")],
        );
        self.push_client(name, named(response), options.clone());
        self.push_client(
            &format!("{}Async", name),
            generic("Grpc.Core.AsyncUnaryCall`1", &[response]),
            options,
        );
        self
    }

    pub fn server_streaming(mut self, name: &str, request: &str, response: &str) -> Self {
        self.push_server(
            name,
            named("System.Threading.Tasks.Task"),
            vec![
                named(request),
                generic("Grpc.Core.IServerStreamWriter`1", &[response]),
                named("Grpc.Core.ServerCallContext"),
            ],
        );
        self.push_client(
            name,
            generic("Grpc.Core.AsyncServerStreamingCall`1", &[response]),
            vec![named(request), named("Grpc.Core.CallOptions")],
        );
        self
    }

    pub fn client_streaming(mut self, name: &str, request: &str, response: &str) -> Self {
        self.push_server(
            name,
            generic("System.Threading.Tasks.Task`1", &[response]),
            vec![
                generic("Grpc.Core.IAsyncStreamReader`1", &[request]),
                named("Grpc.Core.ServerCallContext"),
            ],
        );
        self.push_client(
            name,
            generic("Grpc.Core.AsyncClientStreamingCall`2", &[request, response]),
            vec![named("Grpc.Core.CallOptions")],
        );
        self
    }

    pub fn duplex_streaming(mut self, name: &str, request: &str, response: &str) -> Self {
        self.push_server(
            name,
            named("System.Threading.Tasks.Task"),
            vec![
                generic("Grpc.Core.IAsyncStreamReader`1", &[request]),
                generic("Grpc.Core.IServerStreamWriter`1", &[response]),
                named("Grpc.Core.ServerCallContext"),
            ],
        );
        self.push_client(
            name,
            generic("Grpc.Core.AsyncDuplexStreamingCall`2", &[request, response]),
            vec![named("Grpc.Core.CallOptions")],
        );
        self
    }

    /// A server method without the generator marker
    pub fn unmarked_server_method(mut self, name: &str, request: &str, response: &str) -> Self {
        let mut m = method(
            name,
            generic("System.Threading.Tasks.Task`1", &[response]),
            vec![named(request), named("Grpc.Core.ServerCallContext")],
        );
        m.is_virtual = true;
        self.server.methods.push(m);
        self
    }

    pub fn obsolete(mut self) -> Self {
        self.holder.attributes.push(attribute(OBSOLETE));
        self
    }

    pub fn build(self) -> Vec<ClrTypeDef> {
        vec![self.holder, self.server, self.client]
    }
}

/// `Google.Protobuf` and `Grpc.Core.Api` with the marker types the loaders look up
pub fn runtime_assemblies() -> Vec<ClrAssembly> {
    let mut marker = type_def("Google.Protobuf.IMessage");
    marker.is_interface = true;
    marker.is_abstract = true;
    marker.base_type = None;

    let mut generic_marker = type_def("Google.Protobuf.IMessage`1");
    generic_marker.is_interface = true;
    generic_marker.is_abstract = true;
    generic_marker.base_type = None;
    generic_marker.interfaces.push(named("Google.Protobuf.IMessage"));

    let mut client_base = type_def("Grpc.Core.ClientBase");
    client_base.is_abstract = true;
    let mut generic_client_base = type_def("Grpc.Core.ClientBase`1");
    generic_client_base.is_abstract = true;
    generic_client_base.base_type = Some(named("Grpc.Core.ClientBase"));
    let mut bind = type_def(BIND_SERVICE_METHOD);
    bind.base_type = Some(named("System.Attribute"));

    vec![
        assembly("Google.Protobuf", vec![marker, generic_marker]),
        assembly("Grpc.Core.Api", vec![client_base, generic_client_base, bind]),
    ]
}

pub fn assembly(name: &str, types: Vec<ClrTypeDef>) -> ClrAssembly {
    ClrAssembly {
        name: name.to_owned(),
        module: None,
        types,
    }
}

/// Loader over one `App` assembly holding `types`
pub fn loader(types: Vec<ClrTypeDef>) -> ClrLoader {
    ClrLoader::new(vec![assembly("App", types)], runtime_assemblies()).unwrap()
}
