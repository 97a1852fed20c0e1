//! `require("router")`: route registration and `listen`.
//!
//! In the startup interpreter registrations go to the engine pool and
//! `listen` serves until the server stops. In a replica they only record the
//! handler functions, and `listen` ends the bootstrap.

use std::path::PathBuf;
use std::sync::Arc;

use mlua::{Function, Lua, Table};

use crate::engine::{EnginePool, HANDLERS_KEY, ScriptHost};
use crate::error::EngineError;
use crate::router::{ANY_METHOD, RouteTarget};
use crate::server;

const METHOD_FUNCTIONS: [(&str, &str); 10] = [
    ("all", ANY_METHOD),
    ("connect", "CONNECT"),
    ("delete", "DELETE"),
    ("get", "GET"),
    ("head", "HEAD"),
    ("options", "OPTIONS"),
    ("patch", "PATCH"),
    ("post", "POST"),
    ("put", "PUT"),
    ("trace", "TRACE"),
];

const LISTEN_REACHED: &str = "router.listen reached";

#[derive(Copy, Clone)]
enum StaticKind {
    File,
    Dir,
}

pub fn open(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "handle",
        lua.create_function(|lua, (method, path, handler): (String, String, Function)| {
            register_script(lua, &method, &path, handler)
        })?,
    )?;
    for (name, method) in METHOD_FUNCTIONS {
        module.set(
            name,
            lua.create_function(move |lua, (path, handler): (String, Function)| {
                register_script(lua, method, &path, handler)
            })?,
        )?;
    }
    module.set(
        "serveFile",
        lua.create_function(|lua, (prefix, file): (String, String)| {
            register_static(lua, &prefix, &file, StaticKind::File)
        })?,
    )?;
    module.set(
        "serveDir",
        lua.create_function(|lua, (prefix, dir): (String, String)| {
            register_static(lua, &prefix, &dir, StaticKind::Dir)
        })?,
    )?;
    module.set(
        "listen",
        lua.create_function(|lua, addr: String| listen(lua, &addr))?,
    )?;
    Ok(module)
}

fn lua_error(err: impl ToString) -> mlua::Error {
    mlua::Error::RuntimeError(err.to_string())
}

fn detached() -> mlua::Error {
    lua_error("router is not attached to a lume server")
}

/// Returns the pool for the startup interpreter, `None` for a replica.
fn startup_pool(lua: &Lua) -> mlua::Result<Option<Arc<EnginePool>>> {
    let host = lua.app_data_ref::<ScriptHost>().ok_or_else(detached)?;
    match &*host {
        ScriptHost::Startup(pool) => Ok(Some(Arc::clone(pool))),
        ScriptHost::Replica(state) if state.sealed => Err(lua_error(EngineError::RoutesFrozen)),
        ScriptHost::Replica(_) => Ok(None),
    }
}

fn with_replica<T>(
    lua: &Lua,
    apply: impl FnOnce(&mut crate::engine::ReplicaState) -> Result<T, String>,
) -> mlua::Result<T> {
    let mut host = lua.app_data_mut::<ScriptHost>().ok_or_else(detached)?;
    match &mut *host {
        ScriptHost::Replica(state) => apply(state).map_err(lua_error),
        ScriptHost::Startup(_) => Err(detached()),
    }
}

fn register_script(lua: &Lua, method: &str, pattern: &str, handler: Function) -> mlua::Result<()> {
    let id = match startup_pool(lua)? {
        Some(pool) => pool.register_handler(method, pattern).map_err(lua_error)?,
        None => with_replica(lua, |state| state.registry.register_handler(method, pattern))?,
    };
    let handlers: Table = lua.named_registry_value(HANDLERS_KEY)?;
    handlers.raw_set(id + 1, handler)?;
    lume_rt::log::debug(&format!("route {} {pattern} -> handler {id}", method));
    Ok(())
}

fn register_static(lua: &Lua, prefix: &str, raw_path: &str, kind: StaticKind) -> mlua::Result<()> {
    let pattern = match kind {
        StaticKind::File => prefix.to_string(),
        StaticKind::Dir if prefix.ends_with('*') => prefix.to_string(),
        StaticKind::Dir => format!("{}/*", prefix.trim_end_matches('/')),
    };
    match startup_pool(lua)? {
        Some(pool) => {
            let path = pool.bootstrap().resolve_path(raw_path);
            let target = match kind {
                StaticKind::File => RouteTarget::File(path),
                StaticKind::Dir => RouteTarget::Dir(path),
            };
            pool.register_route(ANY_METHOD, &pattern, target)
                .map_err(lua_error)?;
        }
        None => {
            let target = RouteTarget::File(PathBuf::from(raw_path));
            with_replica(lua, |state| {
                state.registry.register(ANY_METHOD, &pattern, target)
            })?;
        }
    }
    Ok(())
}

fn listen(lua: &Lua, addr: &str) -> mlua::Result<()> {
    let Some(pool) = startup_pool(lua)? else {
        with_replica(lua, |state| {
            state.listen_reached = true;
            state.sealed = true;
            Ok(())
        })?;
        return Err(lua_error(LISTEN_REACHED));
    };
    if pool.routes().is_some() {
        return Err(lua_error("server is already running"));
    }
    let routes = pool.publish_routes();
    pool.schedule_refill();
    lume_rt::log::info(&format!(
        "starting server on {addr} with {} routes",
        routes.routes().count()
    ));
    server::serve(&pool, addr).map_err(lua_error)
}
