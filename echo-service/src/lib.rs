//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a descriptor
//! pool for unit and integration tests across the workspace. It is not
//! intended for production use.
//!
//! The descriptor set is assembled by hand from `prost-types` building
//! blocks instead of being generated by `protoc`, so the workspace builds
//! without a protobuf toolchain. The schema intentionally covers the shapes
//! the gateway has to transcode: 64-bit scalars, floats, bytes, enums,
//! nested (and self-referential) messages, repeated fields, oneofs, maps
//! and the well-known types.

use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor, ServiceDescriptor};
use std::sync::OnceLock;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, MessageOptions, MethodDescriptorProto,
    OneofDescriptorProto, ServiceDescriptorProto,
};

/// Builds the full descriptor set: the `echo` package plus the well-known
/// type files it imports.
pub fn file_descriptor_set() -> FileDescriptorSet {
    FileDescriptorSet {
        file: vec![
            timestamp_proto(),
            duration_proto(),
            field_mask_proto(),
            wrappers_proto(),
            echo_proto(),
        ],
    }
}

/// The shared descriptor pool for the echo service.
///
/// A single pool instance backs every lookup so descriptors handed out by
/// this crate always compare equal to each other.
pub fn descriptor_pool() -> DescriptorPool {
    static POOL: OnceLock<DescriptorPool> = OnceLock::new();
    POOL.get_or_init(|| {
        DescriptorPool::from_file_descriptor_set(file_descriptor_set())
            .expect("echo descriptor set is valid")
    })
    .clone()
}

pub fn echo_request() -> MessageDescriptor {
    descriptor_pool()
        .get_message_by_name("echo.EchoRequest")
        .expect("echo.EchoRequest is defined")
}

pub fn echo_response() -> MessageDescriptor {
    descriptor_pool()
        .get_message_by_name("echo.EchoResponse")
        .expect("echo.EchoResponse is defined")
}

pub fn echo_service() -> ServiceDescriptor {
    descriptor_pool()
        .get_service_by_name("echo.EchoService")
        .expect("echo.EchoService is defined")
}

/// Looks up a method of `echo.EchoService` by name.
pub fn method(name: &str) -> MethodDescriptor {
    echo_service()
        .methods()
        .find(|m| m.name() == name)
        .expect("method is defined on echo.EchoService")
}

fn echo_proto() -> FileDescriptorProto {
    let echo_request = DescriptorProto {
        name: Some("EchoRequest".to_string()),
        field: vec![
            scalar("id", 1, Type::String),
            scalar("message", 2, Type::String),
            scalar("int64_value", 3, Type::Int64),
            scalar("uint64_value", 4, Type::Uint64),
            scalar("int32_value", 5, Type::Int32),
            scalar("float_value", 6, Type::Float),
            scalar("double_value", 7, Type::Double),
            scalar("bool_value", 8, Type::Bool),
            scalar("bytes_value", 9, Type::Bytes),
            enum_field("corner", 10, ".echo.Corner"),
            message("nested", 11, ".echo.Nested"),
            repeated_scalar("tags", 12, Type::String),
            repeated_message("items", 13, ".echo.Nested"),
            oneof_member(scalar("str_kind", 14, Type::String), 0),
            oneof_member(scalar("int_kind", 15, Type::Int32), 0),
            message("start_time", 16, ".google.protobuf.Timestamp"),
            message("ttl", 17, ".google.protobuf.Duration"),
            message("update_mask", 18, ".google.protobuf.FieldMask"),
            message("opt_int64", 19, ".google.protobuf.Int64Value"),
            map_field("labels", 20, ".echo.EchoRequest.LabelsEntry"),
        ],
        nested_type: vec![map_entry("LabelsEntry", Type::String, Type::String)],
        oneof_decl: vec![OneofDescriptorProto {
            name: Some("kind".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    };

    let nested = DescriptorProto {
        name: Some("Nested".to_string()),
        field: vec![
            scalar("name", 1, Type::String),
            scalar("amount", 2, Type::Int32),
            // Self-referential, so pools must not eagerly instantiate.
            message("child", 3, ".echo.Nested"),
        ],
        ..Default::default()
    };

    let echo_response = DescriptorProto {
        name: Some("EchoResponse".to_string()),
        field: vec![
            scalar("id", 1, Type::String),
            scalar("message", 2, Type::String),
            scalar("int64_value", 3, Type::Int64),
            message("nested", 4, ".echo.Nested"),
            repeated_scalar("tags", 5, Type::String),
            scalar("count", 6, Type::Int32),
        ],
        ..Default::default()
    };

    let corner = EnumDescriptorProto {
        name: Some("Corner".to_string()),
        value: vec![
            enum_value("CORNER_UNSPECIFIED", 0),
            enum_value("CORNER_NE", 1),
            enum_value("CORNER_SW", 2),
        ],
        ..Default::default()
    };

    let service = ServiceDescriptorProto {
        name: Some("EchoService".to_string()),
        method: vec![
            rpc("UnaryEcho", false, false),
            rpc("ServerStreamingEcho", false, true),
            rpc("ClientStreamingEcho", true, false),
            rpc("BidiEcho", true, true),
        ],
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some("echo/echo.proto".to_string()),
        package: Some("echo".to_string()),
        dependency: vec![
            "google/protobuf/timestamp.proto".to_string(),
            "google/protobuf/duration.proto".to_string(),
            "google/protobuf/field_mask.proto".to_string(),
            "google/protobuf/wrappers.proto".to_string(),
        ],
        message_type: vec![echo_request, nested, echo_response],
        enum_type: vec![corner],
        service: vec![service],
        syntax: Some("proto3".to_string()),
        ..Default::default()
    }
}

fn timestamp_proto() -> FileDescriptorProto {
    well_known_file(
        "google/protobuf/timestamp.proto",
        vec![DescriptorProto {
            name: Some("Timestamp".to_string()),
            field: vec![scalar("seconds", 1, Type::Int64), scalar("nanos", 2, Type::Int32)],
            ..Default::default()
        }],
    )
}

fn duration_proto() -> FileDescriptorProto {
    well_known_file(
        "google/protobuf/duration.proto",
        vec![DescriptorProto {
            name: Some("Duration".to_string()),
            field: vec![scalar("seconds", 1, Type::Int64), scalar("nanos", 2, Type::Int32)],
            ..Default::default()
        }],
    )
}

fn field_mask_proto() -> FileDescriptorProto {
    well_known_file(
        "google/protobuf/field_mask.proto",
        vec![DescriptorProto {
            name: Some("FieldMask".to_string()),
            field: vec![repeated_scalar("paths", 1, Type::String)],
            ..Default::default()
        }],
    )
}

fn wrappers_proto() -> FileDescriptorProto {
    let wrapper = |name: &str, ty: Type| DescriptorProto {
        name: Some(name.to_string()),
        field: vec![scalar("value", 1, ty)],
        ..Default::default()
    };
    well_known_file(
        "google/protobuf/wrappers.proto",
        vec![
            wrapper("DoubleValue", Type::Double),
            wrapper("FloatValue", Type::Float),
            wrapper("Int64Value", Type::Int64),
            wrapper("UInt64Value", Type::Uint64),
            wrapper("Int32Value", Type::Int32),
            wrapper("UInt32Value", Type::Uint32),
            wrapper("BoolValue", Type::Bool),
            wrapper("StringValue", Type::String),
            wrapper("BytesValue", Type::Bytes),
        ],
    )
}

fn well_known_file(name: &str, messages: Vec<DescriptorProto>) -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some(name.to_string()),
        package: Some("google.protobuf".to_string()),
        message_type: messages,
        syntax: Some("proto3".to_string()),
        ..Default::default()
    }
}

fn scalar(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        json_name: Some(json_name(name)),
        ..Default::default()
    }
}

fn repeated_scalar(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        label: Some(Label::Repeated as i32),
        ..scalar(name, number, ty)
    }
}

fn message(name: &str, number: i32, type_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        r#type: Some(Type::Message as i32),
        type_name: Some(type_name.to_string()),
        ..scalar(name, number, Type::Message)
    }
}

fn repeated_message(name: &str, number: i32, type_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        label: Some(Label::Repeated as i32),
        ..message(name, number, type_name)
    }
}

fn enum_field(name: &str, number: i32, type_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        r#type: Some(Type::Enum as i32),
        type_name: Some(type_name.to_string()),
        ..scalar(name, number, Type::Enum)
    }
}

fn map_field(name: &str, number: i32, entry_type: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        label: Some(Label::Repeated as i32),
        ..message(name, number, entry_type)
    }
}

fn map_entry(name: &str, key: Type, value: Type) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: vec![scalar("key", 1, key), scalar("value", 2, value)],
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn oneof_member(field: FieldDescriptorProto, oneof_index: i32) -> FieldDescriptorProto {
    FieldDescriptorProto {
        oneof_index: Some(oneof_index),
        ..field
    }
}

fn enum_value(name: &str, number: i32) -> EnumValueDescriptorProto {
    EnumValueDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        ..Default::default()
    }
}

fn rpc(name: &str, client_streaming: bool, server_streaming: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(".echo.EchoRequest".to_string()),
        output_type: Some(".echo.EchoResponse".to_string()),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        ..Default::default()
    }
}

fn json_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
