use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use lume_core::{Bootstrap, EnginePool, ServerConfig};
use serde::Deserialize;

const USAGE: &str = r#"usage: lume [-file <entry.lua>] [-config <lume.toml>] [-v] [-<name> <value>...]

Runs the entry script (default: main.lua next to the executable).
Every flag is visible to the script through the global table `arg`.

Options:
  -file <path>     Entry script
  -config <path>   Manifest with a [server] table (default: lume.toml next to the entry)
  -v               Print build information
"#;

const DEFAULT_ENTRY: &str = "main.lua";
const MANIFEST_FILE: &str = "lume.toml";

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    server: Option<ServerConfig>,
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let code = run(args);
    std::process::exit(code);
}

fn run(args: Vec<String>) -> i32 {
    let flags = parse_flags(&args);
    if flags.contains_key("v") {
        println!("{}", build_info_line());
        return 0;
    }
    if flags.contains_key("h") || flags.contains_key("help") {
        eprintln!("{USAGE}");
        return 0;
    }
    match start(flags) {
        Ok(()) => 0,
        Err(message) => {
            emit_cli_error(&message);
            1
        }
    }
}

fn start(flags: BTreeMap<String, String>) -> Result<(), String> {
    let requested = match flags.get("file") {
        Some(file) if !file.is_empty() => PathBuf::from(file),
        _ => exe_dir()?.join(DEFAULT_ENTRY),
    };
    let entry = resolve_file(&requested)?;
    let entry_dir = entry.parent().filter(|dir| !dir.as_os_str().is_empty());
    apply_dotenv(entry_dir);

    let manifest_override = flags.get("config").map(PathBuf::from);
    let manifest = load_manifest(manifest_override.as_deref(), entry_dir)?;
    let mut config = manifest.and_then(|m| m.server).unwrap_or_default();
    config.apply_env()?;
    if let Some(workers) = config.workers {
        lume_core::task_pool::configure(workers);
    }
    lume_rt::log::debug(&format!("entry script {}", entry.display()));

    let bootstrap = Bootstrap::from_file(&entry)
        .map_err(|err| err.to_string())?
        .with_args(flags);
    let pool = EnginePool::new(bootstrap, config);
    pool.run_entry().map_err(|err| err.to_string())
}

/// Flags are `-name=value`, `-name value` or a bare `-name`. Any number of
/// leading dashes is accepted; arguments that are not flags are ignored.
fn parse_flags(args: &[String]) -> BTreeMap<String, String> {
    let mut flags = BTreeMap::new();
    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        idx += 1;
        if arg.len() < 2 || !arg.starts_with('-') {
            continue;
        }
        let name_part = arg.trim_start_matches('-');
        if name_part.is_empty() {
            continue;
        }
        let (name, value) = match name_part.split_once('=') {
            Some((name, value)) => (name, value.to_string()),
            None => match args.get(idx) {
                Some(next) if !next.starts_with('-') => {
                    idx += 1;
                    (name_part, next.clone())
                }
                _ => (name_part, String::new()),
            },
        };
        flags.insert(name.to_string(), value);
    }
    flags
}

/// Tries the path as given, then relative to the executable, then relative
/// to the working directory.
fn resolve_file(requested: &Path) -> Result<PathBuf, String> {
    let mut candidates = vec![requested.to_path_buf()];
    if requested.is_relative() {
        if let Ok(dir) = exe_dir() {
            candidates.push(dir.join(requested));
        }
        if let Ok(cwd) = env::current_dir() {
            candidates.push(cwd.join(requested));
        }
    }
    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| format!("file not found: {}", requested.display()))
}

fn exe_dir() -> Result<PathBuf, String> {
    let exe = env::current_exe().map_err(|err| format!("cannot locate executable: {err}"))?;
    let exe = fs::canonicalize(&exe).unwrap_or(exe);
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| format!("executable has no parent directory: {}", exe.display()))
}

fn load_manifest(
    manifest_override: Option<&Path>,
    entry_dir: Option<&Path>,
) -> Result<Option<Manifest>, String> {
    let path = match manifest_override {
        Some(path) if path.is_dir() => path.join(MANIFEST_FILE),
        Some(path) => path.to_path_buf(),
        None => {
            let path = entry_dir
                .map(|dir| dir.join(MANIFEST_FILE))
                .unwrap_or_else(|| PathBuf::from(MANIFEST_FILE));
            if !path.exists() {
                return Ok(None);
            }
            path
        }
    };
    let content = fs::read_to_string(&path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let manifest: Manifest =
        toml::from_str(&content).map_err(|err| format!("invalid manifest: {err}"))?;
    if let Some(server) = &manifest.server {
        server.validate()?;
    }
    Ok(Some(manifest))
}

fn apply_dotenv(entry_dir: Option<&Path>) {
    let mut path = PathBuf::from(".env");
    if let Some(dir) = entry_dir {
        path = dir.join(".env");
    }
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            emit_cli_warning(&format!("failed to read {}: {err}", path.display()));
            return;
        }
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }
        let value = unquote(value.trim());
        unsafe {
            env::set_var(key, value);
        }
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn build_info_line() -> String {
    format!(
        "lume {} target={} rustc={}",
        env!("CARGO_PKG_VERSION"),
        env!("LUME_BUILD_TARGET"),
        env!("LUME_BUILD_RUSTC_VERSION")
    )
}

fn emit_cli_error(message: &str) {
    eprintln!("error: {message}");
}

fn emit_cli_warning(message: &str) {
    eprintln!("warning: {message}");
}
