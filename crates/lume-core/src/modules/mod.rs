//! Modules preloaded into every interpreter.

use std::sync::Arc;

use mlua::{Lua, MultiValue, Table};

use crate::engine::ModuleLoader;

pub mod json;
pub mod router;

pub const BUILTIN_MODULES: [&str; 2] = ["json", "router"];

/// Installs the built-in modules and `extra` into `package.preload`.
pub(crate) fn install(lua: &Lua, extra: &[(String, ModuleLoader)]) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let preload: Table = package.get("preload")?;
    preload.set(
        "json",
        lua.create_function(|lua, _: MultiValue| json::open(lua))?,
    )?;
    preload.set(
        "router",
        lua.create_function(|lua, _: MultiValue| router::open(lua))?,
    )?;
    for (name, loader) in extra {
        let loader = Arc::clone(loader);
        preload.set(
            name.as_str(),
            lua.create_function(move |lua, _: MultiValue| loader(lua))?,
        )?;
    }
    Ok(())
}
