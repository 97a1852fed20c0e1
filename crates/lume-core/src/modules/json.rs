//! `require("json")`: `encode(value)` and `decode(text)`. Both return the
//! result, or `nil` and a message when the input cannot be converted.

use lume_rt::json as rt_json;
use mlua::{Lua, MultiValue, Table, Value};

use crate::bridge;

pub fn open(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set("encode", lua.create_function(encode)?)?;
    module.set("decode", lua.create_function(decode)?)?;
    Ok(module)
}

fn encode(lua: &Lua, value: Value) -> mlua::Result<MultiValue> {
    match rt_json::encode(&bridge::to_interchange(&value)) {
        Ok(text) => Ok(MultiValue::from_vec(vec![Value::String(
            lua.create_string(&text)?,
        )])),
        Err(err) => failure(lua, &err.to_string()),
    }
}

fn decode(lua: &Lua, text: mlua::String) -> mlua::Result<MultiValue> {
    let Ok(text) = text.to_str() else {
        return failure(lua, "invalid UTF-8 in JSON input");
    };
    match rt_json::decode(&text) {
        Ok(tree) => Ok(MultiValue::from_vec(vec![bridge::from_interchange(
            lua, &tree,
        )?])),
        Err(err) => failure(lua, &err.to_string()),
    }
}

fn failure(lua: &Lua, message: &str) -> mlua::Result<MultiValue> {
    Ok(MultiValue::from_vec(vec![
        Value::Nil,
        Value::String(lua.create_string(message)?),
    ]))
}
