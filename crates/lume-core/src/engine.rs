//! Interpreter construction and the checked-out interpreter pool.
//!
//! The entry script runs once in a startup interpreter, where route
//! registrations land in the pool's [`RouteRegistry`]. Lua functions cannot
//! move between interpreters, so every request interpreter is a *replica*:
//! a fresh `Lua` that re-runs the entry script, keeps the handler functions
//! in its own registry table keyed by [`HandlerId`], and stops at
//! `router.listen`. A replica whose handler sequence differs from the
//! published table is rejected.
//!
//! Interpreters are checked out exclusively and discarded after one request,
//! so no global state leaks from one request to the next.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, IntoLuaMulti, Lua, Table, Value, VmState};

use crate::config::ServerConfig;
use crate::error::{EngineError, format_lua_error};
use crate::modules;
use crate::router::{HandlerId, RouteKey, RouteRegistry, RouteTable, RouteTarget};
use crate::task_pool;

/// Named registry slot holding the handler functions of an interpreter.
pub const HANDLERS_KEY: &str = "lume.handlers";

const HOOK_INSTRUCTIONS: u32 = 1_000;

pub type ModuleLoader = Arc<dyn Fn(&Lua) -> mlua::Result<Table> + Send + Sync>;

/// What every interpreter runs before it can serve: the entry script, the
/// directory appended to `package.path`, and the `arg` table.
#[derive(Clone, Debug)]
pub struct Bootstrap {
    chunk_name: String,
    source: String,
    search_dir: Option<PathBuf>,
    args: BTreeMap<String, String>,
}

impl Bootstrap {
    pub fn from_file(entry: &Path) -> Result<Self, EngineError> {
        let source = fs::read_to_string(entry).map_err(|err| {
            EngineError::Io(format!("failed to read {}: {err}", entry.display()))
        })?;
        let search_dir = match entry.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            chunk_name: format!("@{}", entry.display()),
            source: strip_shebang(source),
            search_dir: Some(search_dir),
            args: BTreeMap::new(),
        })
    }

    pub fn from_source(name: &str, source: impl Into<String>) -> Self {
        Self {
            chunk_name: format!("={name}"),
            source: source.into(),
            search_dir: None,
            args: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: BTreeMap<String, String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = Some(dir.into());
        self
    }

    /// Resolves a script-supplied path against the entry directory.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        match &self.search_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

// Keeps line numbers intact for `#!` scripts.
fn strip_shebang(source: String) -> String {
    if source.starts_with('#') {
        match source.find('\n') {
            Some(pos) => source[pos..].to_string(),
            None => String::new(),
        }
    } else {
        source
    }
}

/// Per-interpreter host state stored as Lua app data.
pub(crate) enum ScriptHost {
    Startup(Arc<EnginePool>),
    Replica(ReplicaState),
}

#[derive(Default)]
pub(crate) struct ReplicaState {
    /// Replays registrations so ids and validation match the startup run.
    pub(crate) registry: RouteRegistry,
    pub(crate) listen_reached: bool,
    /// Set once bootstrap ends; registrations after that are errors.
    pub(crate) sealed: bool,
}

impl ScriptHost {
    fn seal(&mut self) -> (Vec<RouteKey>, bool) {
        match self {
            ScriptHost::Startup(_) => (Vec::new(), false),
            ScriptHost::Replica(state) => {
                state.sealed = true;
                (state.registry.handler_keys().to_vec(), state.listen_reached)
            }
        }
    }
}

struct Slots {
    free: Vec<Interpreter>,
    checked_out: usize,
    refilling: bool,
}

pub struct EnginePool {
    bootstrap: Bootstrap,
    config: ServerConfig,
    modules: RwLock<BTreeMap<String, ModuleLoader>>,
    registry: Mutex<Option<RouteRegistry>>,
    routes: OnceLock<Arc<RouteTable>>,
    slots: Mutex<Slots>,
    slot_freed: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EnginePool {
    pub fn new(bootstrap: Bootstrap, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            bootstrap,
            config,
            modules: RwLock::new(BTreeMap::new()),
            registry: Mutex::new(Some(RouteRegistry::new())),
            routes: OnceLock::new(),
            slots: Mutex::new(Slots {
                free: Vec::new(),
                checked_out: 0,
                refilling: false,
            }),
            slot_freed: Condvar::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Makes `require(name)` return the table built by `loader` in every
    /// interpreter created afterwards.
    pub fn register_module<F>(&self, name: &str, loader: F) -> Result<(), EngineError>
    where
        F: Fn(&Lua) -> mlua::Result<Table> + Send + Sync + 'static,
    {
        if modules::BUILTIN_MODULES.contains(&name) {
            return Err(EngineError::Script(format!(
                "module name '{name}' is reserved"
            )));
        }
        if self.routes.get().is_some() {
            return Err(EngineError::RoutesFrozen);
        }
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(loader));
        Ok(())
    }

    /// Registers a script handler route and returns its handler id.
    pub fn register_handler(&self, method: &str, pattern: &str) -> Result<HandlerId, EngineError> {
        let mut registry = lock(&self.registry);
        let registry = registry.as_mut().ok_or(EngineError::RoutesFrozen)?;
        registry
            .register_handler(method, pattern)
            .map_err(EngineError::Script)
    }

    pub fn register_route(
        &self,
        method: &str,
        pattern: &str,
        target: RouteTarget,
    ) -> Result<RouteKey, EngineError> {
        let mut registry = lock(&self.registry);
        let registry = registry.as_mut().ok_or(EngineError::RoutesFrozen)?;
        registry
            .register(method, pattern, target)
            .map_err(EngineError::Script)
    }

    /// Freezes the registry. Later calls return the same snapshot.
    pub fn publish_routes(&self) -> Arc<RouteTable> {
        Arc::clone(self.routes.get_or_init(|| {
            let registry = lock(&self.registry).take().unwrap_or_default();
            let table = registry.freeze();
            lume_rt::log::debug(&format!(
                "published {} routes ({} script handlers)",
                table.routes().count(),
                table.handler_keys().len()
            ));
            Arc::new(table)
        }))
    }

    pub fn routes(&self) -> Option<Arc<RouteTable>> {
        self.routes.get().cloned()
    }

    /// Runs the entry script in the startup interpreter. Returns once the
    /// script finishes, which for a serving script is after `router.listen`
    /// stops accepting.
    pub fn run_entry(self: &Arc<Self>) -> Result<(), EngineError> {
        let lua = self.new_lua(ScriptHost::Startup(Arc::clone(self)))?;
        let result = self.exec_entry(&lua);
        let _ = lua.remove_app_data::<ScriptHost>();
        result.map_err(EngineError::from)
    }

    /// Checks out a pristine interpreter, blocking while `max_interpreters`
    /// are in use.
    pub fn acquire(self: &Arc<Self>) -> Result<InterpreterGuard, EngineError> {
        let routes = self
            .routes()
            .ok_or_else(|| EngineError::Bootstrap("routes have not been published".to_string()))?;
        let pristine = {
            let mut slots = lock(&self.slots);
            while slots.checked_out >= self.config.max_interpreters {
                slots = self
                    .slot_freed
                    .wait(slots)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            slots.checked_out += 1;
            slots.free.pop()
        };
        let interpreter = match pristine {
            Some(interpreter) => interpreter,
            None => match self.build_replica(&routes) {
                Ok(interpreter) => interpreter,
                Err(err) => {
                    self.release_slot();
                    return Err(err);
                }
            },
        };
        Ok(InterpreterGuard {
            pool: Arc::clone(self),
            interpreter,
        })
    }

    /// Returns the slot of a used interpreter. The interpreter itself is
    /// dropped; only pristine interpreters sit in the free list.
    pub fn release(&self, guard: InterpreterGuard) {
        drop(guard);
    }

    pub fn checked_out(&self) -> usize {
        lock(&self.slots).checked_out
    }

    pub fn idle(&self) -> usize {
        lock(&self.slots).free.len()
    }

    fn release_slot(&self) {
        let mut slots = lock(&self.slots);
        slots.checked_out = slots.checked_out.saturating_sub(1);
        self.slot_freed.notify_one();
    }

    /// Tops the free list up to `prewarm` interpreters on the task pool.
    pub fn schedule_refill(self: &Arc<Self>) {
        if self.config.prewarm == 0 || self.routes.get().is_none() {
            return;
        }
        {
            let mut slots = lock(&self.slots);
            if slots.refilling || slots.free.len() >= self.config.prewarm {
                return;
            }
            slots.refilling = true;
        }
        let pool = Arc::clone(self);
        task_pool::submit(move || pool.refill());
    }

    fn refill(&self) {
        if let Some(routes) = self.routes() {
            while lock(&self.slots).free.len() < self.config.prewarm {
                match self.build_replica(&routes) {
                    Ok(interpreter) => lock(&self.slots).free.push(interpreter),
                    Err(err) => {
                        lume_rt::log::warn(&format!("interpreter prewarm failed: {err}"));
                        break;
                    }
                }
            }
        }
        lock(&self.slots).refilling = false;
    }

    fn build_replica(&self, routes: &RouteTable) -> Result<Interpreter, EngineError> {
        let lua = self.new_lua(ScriptHost::Replica(ReplicaState::default()))?;
        let outcome = self.exec_entry(&lua);
        let (keys, listened) = match lua.app_data_mut::<ScriptHost>() {
            Some(mut host) => host.seal(),
            None => (Vec::new(), false),
        };
        if let Err(err) = outcome {
            if !listened {
                return Err(EngineError::Bootstrap(format_lua_error(&err)));
            }
        }
        let expected = routes.handler_keys();
        if keys != expected {
            let detail = keys
                .iter()
                .zip(expected)
                .position(|(got, want)| got != want)
                .map(|idx| format!("handler {idx} is {} instead of {}", keys[idx], expected[idx]))
                .unwrap_or_else(|| {
                    format!("{} handlers registered, expected {}", keys.len(), expected.len())
                });
            return Err(EngineError::Bootstrap(format!(
                "entry script registered different routes on replay: {detail}"
            )));
        }
        Ok(Interpreter { lua })
    }

    fn new_lua(&self, host: ScriptHost) -> Result<Lua, EngineError> {
        let lua = Lua::new();
        if let Some(limit) = self.config.memory_limit_bytes {
            lua.set_memory_limit(limit)?;
        }
        lua.set_named_registry_value(HANDLERS_KEY, lua.create_table()?)?;
        lua.set_app_data(host);

        let extra: Vec<(String, ModuleLoader)> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, loader)| (name.clone(), Arc::clone(loader)))
            .collect();
        modules::install(&lua, &extra)?;

        if let Some(dir) = &self.bootstrap.search_dir {
            let package: Table = lua.globals().get("package")?;
            let path: String = package.get("path")?;
            package.set("path", format!("{path};{}/?.lua", dir.display()))?;
        }
        let args = lua.create_table()?;
        for (key, value) in &self.bootstrap.args {
            args.raw_set(key.as_str(), value.as_str())?;
        }
        lua.globals().set("arg", args)?;
        Ok(lua)
    }

    fn exec_entry(&self, lua: &Lua) -> mlua::Result<()> {
        lua.load(self.bootstrap.source.as_str())
            .set_name(self.bootstrap.chunk_name.clone())
            .exec()
    }
}

/// A bootstrapped interpreter holding the script's handler functions.
pub struct Interpreter {
    lua: Lua,
}

impl Interpreter {
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn handler(&self, id: HandlerId) -> Result<Function, EngineError> {
        let handlers: Table = self.lua.named_registry_value(HANDLERS_KEY)?;
        match handlers.raw_get::<Value>(id + 1)? {
            Value::Function(handler) => Ok(handler),
            _ => Err(EngineError::Script(format!(
                "no handler registered under id {id}"
            ))),
        }
    }

    /// Calls handler `id`. With a timeout, an instruction hook aborts the
    /// call once the deadline passes, even if the script catches the error.
    /// Code running inside a coroutine is not covered by the hook.
    pub fn invoke(
        &self,
        id: HandlerId,
        args: impl IntoLuaMulti,
        timeout: Option<Duration>,
    ) -> Result<Value, EngineError> {
        let handler = self.handler(id)?;
        let Some(limit) = timeout else {
            return handler.call::<Value>(args).map_err(EngineError::from);
        };
        let deadline = Instant::now() + limit;
        let expired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&expired);
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTIONS),
            move |lua, _debug| {
                if Instant::now() < deadline {
                    return Ok(VmState::Continue);
                }
                flag.store(true, Ordering::Relaxed);
                // Past the deadline every instruction fails, so a `pcall`
                // that swallowed the error cannot keep the handler alive.
                lua.set_hook(
                    HookTriggers::new().every_nth_instruction(1),
                    move |_lua, _debug| Err(deadline_error(limit)),
                );
                Err(deadline_error(limit))
            },
        );
        let result = handler.call::<Value>(args);
        self.lua.remove_hook();
        if expired.load(Ordering::Relaxed) {
            return Err(EngineError::Timeout(limit));
        }
        result.map_err(EngineError::from)
    }
}

fn deadline_error(limit: Duration) -> mlua::Error {
    mlua::Error::RuntimeError(format!("handler exceeded {}ms", limit.as_millis()))
}

/// Exclusive use of one interpreter. Dropping the guard discards the
/// interpreter and frees its pool slot.
pub struct InterpreterGuard {
    pool: Arc<EnginePool>,
    interpreter: Interpreter,
}

impl Deref for InterpreterGuard {
    type Target = Interpreter;

    fn deref(&self) -> &Interpreter {
        &self.interpreter
    }
}

impl Drop for InterpreterGuard {
    fn drop(&mut self) {
        self.pool.release_slot();
        EnginePool::schedule_refill(&self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(source: &str, config: ServerConfig) -> Arc<EnginePool> {
        let pool = EnginePool::new(Bootstrap::from_source("main.lua", source), config);
        pool.run_entry().expect("entry script runs");
        pool.publish_routes();
        pool
    }

    fn no_prewarm() -> ServerConfig {
        ServerConfig {
            prewarm: 0,
            ..ServerConfig::default()
        }
    }

    const HELLO: &str = r#"
        local router = require("router")
        router.get("/hello", function() return "hi" end)
        router.post("/echo", function(method, path) return method .. " " .. path end)
    "#;

    #[test]
    fn startup_registrations_reach_the_route_table() {
        let pool = pool_with(HELLO, no_prewarm());
        let routes = pool.routes().expect("published");
        assert_eq!(
            routes.handler_keys(),
            &[RouteKey::new("GET", "/hello"), RouteKey::new("POST", "/echo")]
        );
    }

    #[test]
    fn replica_invokes_registered_handler() {
        let pool = pool_with(HELLO, no_prewarm());
        let guard = pool.acquire().expect("acquire");
        let value = guard.invoke(1, ("POST", "/echo"), None).expect("invoke");
        assert_eq!(value.as_str().as_deref(), Some("POST /echo"));
    }

    #[test]
    fn registration_after_publish_is_rejected() {
        let pool = pool_with(HELLO, no_prewarm());
        assert!(matches!(
            pool.register_handler("GET", "/late"),
            Err(EngineError::RoutesFrozen)
        ));
    }

    #[test]
    fn used_interpreters_are_discarded() {
        let pool = pool_with(
            r#"
            local router = require("router")
            router.get("/count", function()
                counter = (counter or 0) + 1
                return counter
            end)
            "#,
            no_prewarm(),
        );
        for _ in 0..3 {
            let guard = pool.acquire().expect("acquire");
            let value = guard.invoke(0, (), None).expect("invoke");
            assert!(matches!(value, Value::Integer(1)));
        }
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn acquire_blocks_at_capacity() {
        let config = ServerConfig {
            max_interpreters: 1,
            prewarm: 0,
            ..ServerConfig::default()
        };
        let pool = pool_with(HELLO, config);
        let first = pool.acquire().expect("first");
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let guard = pool.acquire().expect("second");
                let _ = tx.send(());
                drop(guard);
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        pool.release(first);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("second acquire proceeds after release");
        waiter.join().expect("waiter thread");
    }

    #[test]
    fn divergent_replay_is_a_bootstrap_error() {
        let source = r#"
            local router = require("router")
            if os.getenv("LUME_ENGINE_TEST_EXTRA_ROUTE") then
                router.get("/extra", function() return "extra" end)
            end
            router.get("/a", function() return "a" end)
        "#;
        unsafe {
            std::env::set_var("LUME_ENGINE_TEST_EXTRA_ROUTE", "1");
        }
        let pool = pool_with(source, no_prewarm());
        unsafe {
            std::env::remove_var("LUME_ENGINE_TEST_EXTRA_ROUTE");
        }
        match pool.acquire() {
            Err(EngineError::Bootstrap(message)) => {
                assert!(message.contains("GET /a instead of GET /extra"), "{message}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("divergent replica was accepted"),
        }
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn handler_timeout_is_reported() {
        let config = ServerConfig {
            prewarm: 0,
            handler_timeout_ms: Some(50),
            ..ServerConfig::default()
        };
        let pool = pool_with(
            r#"
            require("router").get("/spin", function()
                while true do end
            end)
            "#,
            config,
        );
        let guard = pool.acquire().expect("acquire");
        let err = guard
            .invoke(0, (), pool.config().handler_timeout())
            .expect_err("times out");
        assert!(matches!(err, EngineError::Timeout(_)), "{err}");
    }

    #[test]
    fn prewarm_fills_the_free_list() {
        let config = ServerConfig {
            prewarm: 2,
            ..ServerConfig::default()
        };
        let pool = pool_with(HELLO, config);
        pool.schedule_refill();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.idle() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn entry_script_errors_surface() {
        let pool = EnginePool::new(
            Bootstrap::from_source("main.lua", "error('broken entry')"),
            no_prewarm(),
        );
        let err = pool.run_entry().expect_err("script error");
        assert!(err.to_string().contains("broken entry"), "{err}");
    }

    #[test]
    fn custom_modules_are_preloaded() {
        let pool = EnginePool::new(
            Bootstrap::from_source(
                "main.lua",
                r#"require("router").get("/v", function() return require("meta").version end)"#,
            ),
            no_prewarm(),
        );
        pool.register_module("meta", |lua| {
            let module = lua.create_table()?;
            module.set("version", "1.2.3")?;
            Ok(module)
        })
        .expect("register module");
        assert!(pool.register_module("json", |lua| lua.create_table()).is_err());
        pool.run_entry().expect("entry");
        pool.publish_routes();
        let guard = pool.acquire().expect("acquire");
        let value = guard.invoke(0, (), None).expect("invoke");
        assert_eq!(value.as_str().as_deref(), Some("1.2.3"));
    }
}
