use std::sync::Arc;

use mamont_rpc::codec::{WireKind, MAX_NESTING_DEPTH};
use mamont_rpc::xdr::{to_bytes, Serialize};
use mamont_rpc::{Codec, CodecError, FieldType, Message, SchemaRegistry, Value, XdrCodec};

const V1: &str = r#"
message Point { int32 x = 1; int32 y = 2; }

message Shape {
  string name = 1;
  repeated Point points = 2;
  bool closed = 3;
  bytes tag = 4;
  uint64 id = 5;
  float scale = 6;
  repeated string labels = 7;
}
"#;

// Adds `color` and `weight`, which a v1 reader has never heard of.
const V2: &str = r#"
message Point { int32 x = 1; int32 y = 2; }

message Shape {
  string name = 1;
  repeated Point points = 2;
  bool closed = 3;
  bytes tag = 4;
  uint64 id = 5;
  float scale = 6;
  repeated string labels = 7;
  string color = 8;
  double weight = 9;
}
"#;

fn codec(source: &str) -> (XdrCodec, Arc<SchemaRegistry>) {
    let registry = Arc::new(SchemaRegistry::from_source(source).expect("schema"));
    (XdrCodec::new(registry.clone()), registry)
}

fn point(x: i32, y: i32) -> Value {
    Value::Message(Message::new().with("x", x).with("y", y))
}

fn shape() -> Message {
    Message::new()
        .with("name", "triangle")
        .with("points", Value::List(vec![point(0, 0), point(4, 0), point(0, 3)]))
        .with("closed", true)
        .with("tag", Value::Bytes(vec![1, 2, 3]))
        .with("id", 42_u64)
        .with("scale", 1.5_f32)
        .with("labels", Value::List(vec!["a".into(), "b".into()]))
}

/// Hand-encodes one field header.
fn header(number: u32, kind: WireKind, out: &mut Vec<u8>) {
    number.serialize(out).unwrap();
    (kind as u32).serialize(out).unwrap();
}

#[test]
fn decodes_what_it_encodes() {
    let (codec, registry) = codec(V1);
    let schema = registry.message("Shape").unwrap();

    let bytes = codec.encode(&shape(), schema).expect("encode");
    assert_eq!(codec.decode(&bytes, schema).expect("decode"), shape());

    let empty = codec.encode(&Message::new(), schema).expect("encode empty");
    assert!(empty.is_empty());
    assert_eq!(codec.decode(&empty, schema).unwrap(), Message::new());
}

#[test]
fn encoding_is_deterministic_and_ordered_by_number() {
    let (codec, registry) = codec(V1);
    let schema = registry.message("Point").unwrap();

    let message = Message::new().with("y", 2_i32).with("x", 1_i32);
    let bytes = codec.encode(&message, schema).unwrap();
    assert_eq!(bytes, codec.encode(&message.clone(), schema).unwrap());

    let mut expected = Vec::new();
    header(1, WireKind::Word, &mut expected);
    1_i32.serialize(&mut expected).unwrap();
    header(2, WireKind::Word, &mut expected);
    2_i32.serialize(&mut expected).unwrap();
    assert_eq!(bytes, expected);
}

#[test]
fn old_reader_skips_newer_fields() {
    let (new_codec, new_registry) = codec(V2);
    let (old_codec, old_registry) = codec(V1);

    let newer = shape().with("color", "red").with("weight", 9.5_f64);
    let bytes = new_codec.encode(&newer, new_registry.message("Shape").unwrap()).unwrap();

    let decoded = old_codec.decode(&bytes, old_registry.message("Shape").unwrap()).unwrap();
    assert_eq!(decoded, shape());
}

#[test]
fn new_reader_sees_absent_fields_as_missing() {
    let (new_codec, new_registry) = codec(V2);
    let (old_codec, old_registry) = codec(V1);

    let bytes = old_codec.encode(&shape(), old_registry.message("Shape").unwrap()).unwrap();
    let decoded = new_codec.decode(&bytes, new_registry.message("Shape").unwrap()).unwrap();
    assert!(!decoded.contains("color"));
    assert_eq!(decoded.get_str("name"), Some("triangle"));
}

#[test]
fn rejects_messages_that_do_not_fit_the_schema() {
    let (codec, registry) = codec(V1);
    let schema = registry.message("Shape").unwrap();

    let unknown = Message::new().with("colour", "red");
    assert!(matches!(
        codec.encode(&unknown, schema),
        Err(CodecError::UnknownField { .. })
    ));

    let mistyped = Message::new().with("id", "forty-two");
    match codec.encode(&mistyped, schema) {
        Err(CodecError::TypeMismatch { field, found, .. }) => {
            assert_eq!(field, "id");
            assert_eq!(found, Value::from("x").kind_name());
        }
        other => panic!("expected type mismatch, got {other:?}"),
    }

    let bad_element = Message::new().with("labels", Value::List(vec![Value::Int32(1)]));
    assert!(matches!(
        codec.encode(&bad_element, schema),
        Err(CodecError::TypeMismatch { .. })
    ));
}

#[test]
fn rejects_malformed_input() {
    let (codec, registry) = codec(V1);
    let schema = registry.message("Shape").unwrap();
    let bytes = codec.encode(&shape(), schema).unwrap();

    assert!(matches!(
        codec.decode(&bytes[..bytes.len() - 2], schema),
        Err(CodecError::Truncated)
    ));

    let mut unknown_kind = Vec::new();
    header(1, WireKind::Opaque, &mut unknown_kind);
    unknown_kind[7] = 9;
    assert!(matches!(
        codec.decode(&unknown_kind, schema),
        Err(CodecError::UnknownWireKind(9))
    ));

    let mut wrong_kind = Vec::new();
    header(5, WireKind::Word, &mut wrong_kind);
    7_u32.serialize(&mut wrong_kind).unwrap();
    assert!(matches!(
        codec.decode(&wrong_kind, schema),
        Err(CodecError::WireKindMismatch { number: 5, .. })
    ));

    let mut duplicate = Vec::new();
    for _ in 0..2 {
        header(5, WireKind::Hyper, &mut duplicate);
        1_u64.serialize(&mut duplicate).unwrap();
    }
    assert!(matches!(
        codec.decode(&duplicate, schema),
        Err(CodecError::DuplicateField { number: 5, .. })
    ));

    let mut bad_bool = Vec::new();
    header(3, WireKind::Word, &mut bad_bool);
    2_u32.serialize(&mut bad_bool).unwrap();
    assert!(matches!(
        codec.decode(&bad_bool, schema),
        Err(CodecError::InvalidValue { .. })
    ));

    let mut bad_utf8 = Vec::new();
    header(1, WireKind::Opaque, &mut bad_utf8);
    [0xc3_u8, 0x28][..].serialize(&mut bad_utf8).unwrap();
    assert!(matches!(
        codec.decode(&bad_utf8, schema),
        Err(CodecError::InvalidValue { .. })
    ));
}

#[test]
fn skips_unknown_fields_of_every_kind() {
    let (codec, registry) = codec(V1);
    let schema = registry.message("Point").unwrap();

    let mut bytes = Vec::new();
    header(10, WireKind::Word, &mut bytes);
    5_u32.serialize(&mut bytes).unwrap();
    header(11, WireKind::Hyper, &mut bytes);
    5_u64.serialize(&mut bytes).unwrap();
    header(12, WireKind::Opaque, &mut bytes);
    "skipped"[..].serialize(&mut bytes).unwrap();
    header(2, WireKind::Word, &mut bytes);
    (-7_i32).serialize(&mut bytes).unwrap();

    let decoded = codec.decode(&bytes, schema).unwrap();
    assert_eq!(decoded, Message::new().with("y", -7_i32));
}

#[test]
fn limits_nesting_depth() {
    let (codec, registry) = codec("message Node { Node child = 1; uint32 depth = 2; }");
    let schema = registry.message("Node").unwrap();

    let mut node = Message::new().with("depth", 0_u32);
    for depth in 1..=(MAX_NESTING_DEPTH as u32 + 1) {
        node = Message::new().with("depth", depth).with("child", Value::Message(node));
    }
    assert!(matches!(codec.encode(&node, schema), Err(CodecError::TooDeep(_))));

    let mut shallow = Message::new().with("depth", 0_u32);
    for depth in 1..8_u32 {
        shallow = Message::new().with("depth", depth).with("child", Value::Message(shallow));
    }
    let bytes = codec.encode(&shallow, schema).unwrap();
    assert_eq!(codec.decode(&bytes, schema).unwrap(), shallow);

    // Hand-built input nested deeper than allowed.
    let mut deep = Vec::new();
    for _ in 0..=(MAX_NESTING_DEPTH + 1) {
        let mut outer = Vec::new();
        header(1, WireKind::Opaque, &mut outer);
        deep.as_slice().serialize(&mut outer).unwrap();
        deep = outer;
    }
    assert!(matches!(codec.decode(&deep, schema), Err(CodecError::TooDeep(_))));
}

#[test]
fn repeated_values_are_length_prefixed() {
    let (codec, registry) = codec("message Tags { repeated uint32 ids = 1; }");
    let schema = registry.message("Tags").unwrap();
    assert_eq!(
        schema.field_by_number(1).unwrap().field_type,
        FieldType::repeated(FieldType::UInt32)
    );

    let message = Message::new().with("ids", Value::List(vec![Value::UInt32(7), Value::UInt32(9)]));
    let bytes = codec.encode(&message, schema).unwrap();

    let mut body = Vec::new();
    2_u32.serialize(&mut body).unwrap();
    7_u32.serialize(&mut body).unwrap();
    9_u32.serialize(&mut body).unwrap();
    let mut expected = Vec::new();
    header(1, WireKind::Opaque, &mut expected);
    expected.extend(to_bytes(body.as_slice()).unwrap());
    assert_eq!(bytes, expected);

    let empty = Message::new().with("ids", Value::List(Vec::new()));
    let bytes = codec.encode(&empty, schema).unwrap();
    assert_eq!(codec.decode(&bytes, schema).unwrap(), empty);
}
