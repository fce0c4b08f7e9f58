use cilproto_core::metadata::il2cpp::{
    Il2CppFieldDef, Il2CppImageDef, Il2CppLoader, Il2CppMetadata, Il2CppMethodDef,
    Il2CppPropertyDef, Il2CppTypeData, Il2CppTypeDef, Il2CppTypeEntry,
};
use cilproto_core::metadata::{ConstantValue, MetadataDump};
use cilproto_core::{Decompiler, ParseOptions};
use pretty_assertions::assert_eq;

const PUBLIC: u32 = 0x6;
const STATIC: u32 = 0x10;
const LITERAL: u32 = 0x40;
const SEALED: u32 = 0x100;

fn class_entry(def: usize) -> Il2CppTypeEntry {
    Il2CppTypeEntry {
        type_enum: 0x12,
        attrs: 0,
        data: Il2CppTypeData::Class(def),
    }
}

fn primitive(type_enum: u8, attrs: u32) -> Il2CppTypeEntry {
    Il2CppTypeEntry {
        type_enum,
        attrs: attrs as u16,
        data: Il2CppTypeData::None,
    }
}

// App.Greeting { string Text = 1; int32 Count = 2; }, without attribute tables.
fn greeting(version: f32) -> Il2CppMetadata {
    Il2CppMetadata {
        version,
        images: vec![Il2CppImageDef {
            name: "App.dll".to_owned(),
            type_start: 0,
            type_count: 1,
            ..Default::default()
        }],
        type_defs: vec![Il2CppTypeDef {
            name: "Greeting".to_owned(),
            namespace: "App".to_owned(),
            flags: SEALED,
            field_start: 0,
            field_count: 2,
            method_start: 0,
            method_count: 2,
            property_start: 0,
            property_count: 2,
            ..Default::default()
        }],
        types: vec![
            class_entry(0),
            primitive(0x08, PUBLIC | STATIC | LITERAL),
            primitive(0x0E, 0),
            primitive(0x08, 0),
        ],
        field_defs: vec![
            Il2CppFieldDef {
                name: "TextFieldNumber".to_owned(),
                type_index: 1,
                default_value: Some(ConstantValue::I4(1)),
                ..Default::default()
            },
            Il2CppFieldDef {
                name: "CountFieldNumber".to_owned(),
                type_index: 1,
                default_value: Some(ConstantValue::I4(2)),
                ..Default::default()
            },
        ],
        method_defs: vec![
            Il2CppMethodDef {
                name: "get_Text".to_owned(),
                declaring_type: 0,
                return_type: 2,
                flags: PUBLIC,
                ..Default::default()
            },
            Il2CppMethodDef {
                name: "get_Count".to_owned(),
                declaring_type: 0,
                return_type: 3,
                flags: PUBLIC,
                ..Default::default()
            },
        ],
        property_defs: vec![
            Il2CppPropertyDef {
                name: "Text".to_owned(),
                get: 0,
                ..Default::default()
            },
            Il2CppPropertyDef {
                name: "Count".to_owned(),
                get: 1,
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

fn decompile(meta: Il2CppMetadata) -> Decompiler {
    let loader = Il2CppLoader::new(meta).unwrap();
    let ty = loader.get_type("App.Greeting").unwrap();
    let mut decompiler = Decompiler::new();
    let options = ParseOptions::new().include_properties_without_non_user_code_attribute(true);
    decompiler.parse_message(&ty, options).unwrap();
    decompiler
}

#[test]
fn message_from_metadata_tables() {
    for version in [24.0, 27.0, 29.0, 31.0] {
        let decompiler = decompile(greeting(version));
        assert_eq!(
            decompiler.schema().render_all(),
            "// Decompiled with cilproto\n\
             // Assembly: App.dll\n\
             \n\
             syntax = \"proto3\";\n\
             \n\
             option csharp_namespace = \"App\";\n\
             \n\
             message Greeting {\n  string text = 1;\n  int32 count = 2;\n}\n",
            "metadata version {}",
            version
        );
    }
}

#[test]
fn unmarked_properties_are_skipped_by_default() {
    let loader = Il2CppLoader::new(greeting(29.0)).unwrap();
    let ty = loader.get_type("App.Greeting").unwrap();
    let mut decompiler = Decompiler::new();
    decompiler.parse_message(&ty, ParseOptions::new()).unwrap();
    assert!(decompiler
        .schema()
        .render_all()
        .ends_with("message Greeting {\n}\n"));
}

#[test]
fn metadata_dump_round_trips_through_json() {
    let json = br#"{
        "backend": "il2cpp",
        "version": 24.5,
        "images": [{"name": "App.dll", "type_start": 0, "type_count": 1}],
        "type_defs": [{"name": "Greeting", "namespace": "App", "flags": 256,
                       "field_start": 0, "field_count": 1,
                       "method_start": 0, "method_count": 1,
                       "property_start": 0, "property_count": 1}],
        "types": [
            {"type_enum": 18, "data": {"class": 0}},
            {"type_enum": 8, "attrs": 86},
            {"type_enum": 14}
        ],
        "field_defs": [{"name": "TextFieldNumber", "type_index": 1,
                        "default_value": {"kind": "I4", "value": 1}}],
        "method_defs": [{"name": "get_Text", "declaring_type": 0, "return_type": 2, "flags": 6}],
        "property_defs": [{"name": "Text", "get": 0}]
    }"#;

    let MetadataDump::Il2Cpp(meta) = MetadataDump::from_slice(json).unwrap() else {
        panic!("expected an il2cpp dump");
    };
    assert_eq!(meta.version, 24.5);
    let text = decompile(meta).schema().render_all();
    assert!(text.ends_with("message Greeting {\n  string text = 1;\n}\n"));
}
