use std::str::FromStr;

/// Environment variable that overrides `field` of config section `section`,
/// e.g. `env_key("server", "poolSize")` is `LUME_SERVER_POOL_SIZE`.
pub fn env_key(section: &str, field: &str) -> String {
    format!("LUME_{}_{}", to_env_key(section), to_env_key(field))
}

fn to_env_key(name: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == '.' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
            continue;
        }
        let is_upper = ch.is_ascii_uppercase();
        if is_upper && prev_lower {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
    }
    out
}

/// Reads and parses an override. Unset or empty variables yield `Ok(None)`.
pub fn env_override<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| format!("invalid value for {key}: {raw}"))
}
