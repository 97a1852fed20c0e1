//! Conversion between Lua values and the JSON interchange tree.
//!
//! `to_interchange` never fails: values without a structured form (functions,
//! userdata, threads, self-referencing tables) degrade to their textual form.
//! An empty table converts to `null`, not to `[]` or `{}`.

use std::ffi::c_void;

use lume_rt::json::JsonValue;
use mlua::{Lua, Table, Value};

const MAX_DEPTH: usize = 128;
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// How a table is represented in the interchange tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableShape {
    Empty,
    /// Keys are exactly `1..=len`.
    Array(usize),
    Object,
}

pub fn classify_table(table: &Table) -> TableShape {
    let len = table.raw_len();
    let mut count = 0usize;
    let mut contiguous = true;
    for pair in table.pairs::<Value, Value>() {
        count += 1;
        match pair {
            Ok((Value::Integer(key), _)) if key >= 1 && (key as u64) <= len as u64 => {}
            _ => contiguous = false,
        }
    }
    if count == 0 {
        TableShape::Empty
    } else if contiguous && count == len {
        TableShape::Array(len)
    } else {
        TableShape::Object
    }
}

pub fn to_interchange(value: &Value) -> JsonValue {
    Encoder::default().convert(value)
}

/// Object key for a table key. Depends only on the key itself.
pub fn stringify_key(key: &Value) -> String {
    match key {
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format_key_number(*n),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Boolean(b) => b.to_string(),
        other => opaque_text(other),
    }
}

fn format_key_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        (n as i64).to_string()
    } else {
        // Display for f64 is the shortest exact form and never uses an exponent.
        n.to_string()
    }
}

/// `type: 0x…` text used for values that have no structured representation.
pub fn opaque_text(value: &Value) -> String {
    format!("{}: {:p}", value.type_name(), value.to_pointer())
}

#[derive(Default)]
struct Encoder {
    // Tables on the current conversion path.
    path: Vec<*const c_void>,
}

impl Encoder {
    fn convert(&mut self, value: &Value) -> JsonValue {
        match value {
            Value::Nil => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::Number(*i as f64),
            Value::Number(n) => JsonValue::Number(*n),
            Value::String(s) => JsonValue::String(s.to_string_lossy().to_string()),
            Value::Table(table) => self.convert_table(value, table),
            other => JsonValue::String(opaque_text(other)),
        }
    }

    fn convert_table(&mut self, value: &Value, table: &Table) -> JsonValue {
        let ptr = value.to_pointer();
        if self.path.len() >= MAX_DEPTH || self.path.contains(&ptr) {
            return JsonValue::String(opaque_text(value));
        }
        self.path.push(ptr);
        let out = match classify_table(table) {
            TableShape::Empty => JsonValue::Null,
            TableShape::Array(len) => {
                let mut items = Vec::with_capacity(len);
                for idx in 1..=len {
                    let item = table.raw_get::<Value>(idx).unwrap_or(Value::Nil);
                    items.push(self.convert(&item));
                }
                JsonValue::Array(items)
            }
            TableShape::Object => {
                let mut map = std::collections::BTreeMap::new();
                for (key, item) in table.pairs::<Value, Value>().flatten() {
                    map.insert(stringify_key(&key), self.convert(&item));
                }
                JsonValue::Object(map)
            }
        };
        self.path.pop();
        out
    }
}

/// Builds the Lua value for an interchange tree. Integral numbers within
/// ±2^53 become Lua integers. Fails only when the interpreter cannot allocate.
pub fn from_interchange(lua: &Lua, value: &JsonValue) -> mlua::Result<Value> {
    Ok(match value {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => number_value(*n),
        JsonValue::String(s) => Value::String(lua.create_string(s)?),
        JsonValue::Array(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.iter().enumerate() {
                table.raw_set(idx + 1, from_interchange(lua, item)?)?;
            }
            Value::Table(table)
        }
        JsonValue::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), from_interchange(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}

fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::Integer(n as i64)
    } else {
        Value::Number(n)
    }
}
