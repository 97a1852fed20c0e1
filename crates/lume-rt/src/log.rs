use std::sync::OnceLock;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

/// Maps a `LUME_LOG` value to the most verbose level that gets printed.
pub fn parse_filter(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "info" => Some(Level::Info),
        "debug" | "trace" => Some(Level::Debug),
        "warn" | "warning" => Some(Level::Warn),
        "error" => Some(Level::Error),
        _ => None,
    }
}

fn filter() -> Option<Level> {
    static FILTER: OnceLock<Option<Level>> = OnceLock::new();
    *FILTER.get_or_init(|| std::env::var("LUME_LOG").ok().and_then(|raw| parse_filter(&raw)))
}

pub fn enabled(level: Level) -> bool {
    filter().is_some_and(|max| level <= max)
}

fn emit(level: Level, message: &str) {
    if enabled(level) {
        eprintln!("[{}] {message}", level.tag());
    }
}

pub fn debug(message: &str) {
    emit(Level::Debug, message);
}

pub fn info(message: &str) {
    emit(Level::Info, message);
}

pub fn warn(message: &str) {
    emit(Level::Warn, message);
}

pub fn error(message: &str) {
    emit(Level::Error, message);
}
