use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum EngineError {
    /// A script raised an error or the interpreter failed.
    Script(String),
    /// A handler ran past `handler_timeout_ms`.
    Timeout(Duration),
    /// An interpreter could not be constructed from the entry script.
    Bootstrap(String),
    /// A route was registered after the table was published.
    RoutesFrozen,
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Script(message) => f.write_str(message),
            EngineError::Timeout(limit) => {
                write!(f, "handler timed out after {}ms", limit.as_millis())
            }
            EngineError::Bootstrap(message) => write!(f, "bootstrap failed: {message}"),
            EngineError::RoutesFrozen => {
                f.write_str("routes cannot be registered after the server has started")
            }
            EngineError::Io(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<mlua::Error> for EngineError {
    fn from(err: mlua::Error) -> Self {
        EngineError::Script(format_lua_error(&err))
    }
}

/// Renders an interpreter error the way a script author expects to read it:
/// the innermost message without the Rust-side callback wrapping.
pub fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => strip_traceback(msg).to_string(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        mlua::Error::MemoryError(msg) => format!("out of memory: {msg}"),
        _ => err.to_string(),
    }
}

fn strip_traceback(message: &str) -> &str {
    match message.find("\nstack traceback:") {
        Some(pos) => &message[..pos],
        None => message,
    }
}
