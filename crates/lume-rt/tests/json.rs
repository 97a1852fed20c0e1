use std::collections::BTreeMap;

use lume_rt::json::{JsonValue, decode, encode};

#[test]
fn decodes_nested_document() {
    let value = decode(r#"{"a":[1,2,3],"b":null}"#).expect("valid json");
    let mut expected = BTreeMap::new();
    expected.insert(
        "a".to_string(),
        JsonValue::Array(vec![
            JsonValue::Number(1.0),
            JsonValue::Number(2.0),
            JsonValue::Number(3.0),
        ]),
    );
    expected.insert("b".to_string(), JsonValue::Null);
    assert_eq!(value, JsonValue::Object(expected));
}

#[test]
fn accepts_top_level_scalars() {
    assert_eq!(decode("  true ").unwrap(), JsonValue::Bool(true));
    assert_eq!(decode("null").unwrap(), JsonValue::Null);
    assert_eq!(decode("-12.5e1").unwrap(), JsonValue::Number(-125.0));
    assert_eq!(
        decode(r#""a\/bA""#).unwrap(),
        JsonValue::String("a/bA".to_string())
    );
}

#[test]
fn encodes_objects_with_sorted_quoted_keys() {
    let mut map = BTreeMap::new();
    map.insert("z".to_string(), JsonValue::Bool(false));
    map.insert(
        "a \"quoted\"".to_string(),
        JsonValue::Array(vec![JsonValue::Null, JsonValue::Number(1.5)]),
    );
    let text = encode(&JsonValue::Object(map)).expect("encodable");
    assert_eq!(text, r#"{"a \"quoted\"":[null,1.5],"z":false}"#);
}

#[test]
fn encoded_text_decodes_to_the_same_tree() {
    let source = r#"{"list":[{"id":1,"tags":["x","y"]},{"id":2,"tags":[]}],"name":"tab\there","ratio":0.25}"#;
    let value = decode(source).expect("valid json");
    let text = encode(&value).expect("encodable");
    assert_eq!(text, source);
}

#[test]
fn malformed_input_returns_diagnostic() {
    let cases = [
        ("", "unexpected end of JSON input"),
        ("{", "unexpected end of JSON input"),
        ("[1,]", "looking for beginning of value"),
        (r#"{"a" 1}"#, "after object key"),
        (r#"{a:1}"#, "looking for beginning of object key string"),
        (r#""abc"#, "unterminated string literal"),
        (r#""\x""#, "in string escape code"),
    ];
    for (input, needle) in cases {
        let err = decode(input).expect_err(input);
        assert!(
            err.message.contains(needle),
            "input {input:?}: expected {needle:?} in {:?}",
            err.message
        );
    }
}

#[test]
fn rejects_numbers_outside_f64_range() {
    let err = decode("[1, 1e400]").expect_err("overflowing number");
    assert_eq!(err.message, "number 1e400 out of range");
    assert_eq!(err.offset, 4);
    assert!(decode("-1e400").is_err());
    assert_eq!(decode("1e-400").unwrap(), JsonValue::Number(0.0));
}
