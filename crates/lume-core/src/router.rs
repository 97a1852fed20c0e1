//! Route registration and method + path resolution.
//!
//! Scripts register routes on a [`RouteRegistry`] during startup. The registry
//! is frozen into an immutable [`RouteTable`] before the first connection is
//! accepted; lookups never take a lock.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use regex::Regex;

/// Index of a script handler, assigned in registration order.
pub type HandlerId = usize;

pub const ANY_METHOD: &str = "*";
pub const CATCH_ALL_PARAM: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub method: String,
    pub pattern: String,
}

impl RouteKey {
    pub fn new(method: &str, pattern: &str) -> Self {
        Self {
            method: normalize_method(method),
            pattern: pattern.to_string(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.pattern)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    Script(HandlerId),
    File(PathBuf),
    Dir(PathBuf),
}

#[derive(Clone, Debug)]
pub struct Registration {
    pub key: RouteKey,
    pub target: RouteTarget,
    pattern: Pattern,
}

#[derive(Clone, Debug)]
enum Segment {
    Static(String),
    Param(String),
    Constrained(String, Regex),
    CatchAll,
}

impl Segment {
    fn rank(&self) -> u8 {
        match self {
            Segment::Static(_) => 0,
            Segment::Constrained(..) => 1,
            Segment::Param(_) => 2,
            Segment::CatchAll => 3,
        }
    }
}

#[derive(Clone, Debug)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err(format!("route pattern must start with '/': {raw}"));
        }
        let parts: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let segment = parse_segment(part).map_err(|msg| format!("{msg} in route {raw}"))?;
            if matches!(segment, Segment::CatchAll) && idx + 1 != parts.len() {
                return Err(format!("'*' must be the last segment in route {raw}"));
            }
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    fn ranks(&self) -> Vec<u8> {
        self.segments.iter().map(Segment::rank).collect()
    }

    fn matches(&self, parts: &[&str]) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        for (idx, segment) in self.segments.iter().enumerate() {
            if let Segment::CatchAll = segment {
                let rest = parts.get(idx..).unwrap_or_default().join("/");
                params.insert(CATCH_ALL_PARAM.to_string(), rest);
                return Some(params);
            }
            let part = parts.get(idx)?;
            match segment {
                Segment::Static(text) if text == part => {}
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
                Segment::Constrained(name, re) if re.is_match(part) => {
                    params.insert(name.clone(), (*part).to_string());
                }
                _ => return None,
            }
        }
        (parts.len() == self.segments.len()).then_some(params)
    }
}

fn parse_segment(part: &str) -> Result<Segment, String> {
    if part == "*" {
        return Ok(Segment::CatchAll);
    }
    if let Some(name) = part.strip_prefix(':') {
        return param_name(name).map(Segment::Param);
    }
    let Some(inner) = part.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) else {
        if part.contains(['{', '}']) {
            return Err(format!("malformed segment '{part}'"));
        }
        return Ok(Segment::Static(part.to_string()));
    };
    match inner.split_once(':') {
        None => param_name(inner).map(Segment::Param),
        Some((name, expr)) => {
            let name = param_name(name)?;
            let re = Regex::new(&format!("^(?:{expr})$"))
                .map_err(|err| format!("invalid pattern for '{name}': {err}"))?;
            Ok(Segment::Constrained(name, re))
        }
    }
}

fn param_name(name: &str) -> Result<String, String> {
    if name.is_empty() || !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(format!("invalid parameter name '{name}'"));
    }
    Ok(name.to_string())
}

fn normalize_method(method: &str) -> String {
    method.trim().to_ascii_uppercase()
}

/// Mutable route list owned by the engine pool until the server starts.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    entries: Vec<Registration>,
    handler_keys: Vec<RouteKey>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a script handler and returns the id it is stored under.
    pub fn register_handler(&mut self, method: &str, pattern: &str) -> Result<HandlerId, String> {
        let id = self.handler_keys.len();
        let key = self.register(method, pattern, RouteTarget::Script(id))?;
        self.handler_keys.push(key);
        Ok(id)
    }

    /// Adds a route. Registering the same method and pattern again replaces
    /// the earlier target in place, keeping its original precedence.
    pub fn register(
        &mut self,
        method: &str,
        pattern: &str,
        target: RouteTarget,
    ) -> Result<RouteKey, String> {
        let key = RouteKey::new(method, pattern);
        if key.method.is_empty() {
            return Err(format!("empty method for route {pattern}"));
        }
        let parsed = Pattern::parse(pattern)?;
        if let Some(existing) = self.entries.iter_mut().find(|entry| entry.key == key) {
            existing.target = target;
            return Ok(key);
        }
        self.entries.push(Registration {
            key: key.clone(),
            target,
            pattern: parsed,
        });
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn handler_keys(&self) -> &[RouteKey] {
        &self.handler_keys
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn freeze(self) -> RouteTable {
        let mut routes = self.entries;
        routes.sort_by(|a, b| specificity(a, b));
        RouteTable {
            routes,
            handler_keys: self.handler_keys,
        }
    }
}

fn specificity(a: &Registration, b: &Registration) -> Ordering {
    a.pattern
        .ranks()
        .cmp(&b.pattern.ranks())
        .then_with(|| (a.key.method == ANY_METHOD).cmp(&(b.key.method == ANY_METHOD)))
}

/// Immutable, ordered route snapshot shared by every connection.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Registration>,
    handler_keys: Vec<RouteKey>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub key: &'a RouteKey,
    pub target: &'a RouteTarget,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<'a> {
    Matched(RouteMatch<'a>),
    /// The path exists under other methods, listed for the `Allow` header.
    MethodNotAllowed(Vec<String>),
    NotFound,
}

impl RouteTable {
    pub fn routes(&self) -> impl Iterator<Item = &Registration> {
        self.routes.iter()
    }

    /// Route keys of script handlers, indexed by [`HandlerId`].
    pub fn handler_keys(&self) -> &[RouteKey] {
        &self.handler_keys
    }

    pub fn resolve(&self, method: &str, path: &str) -> Resolution<'_> {
        let method = normalize_method(method);
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let mut allowed = BTreeSet::new();
        for route in &self.routes {
            let Some(params) = route.pattern.matches(&parts) else {
                continue;
            };
            if method_accepts(&route.key.method, &method) {
                return Resolution::Matched(RouteMatch {
                    key: &route.key,
                    target: &route.target,
                    params,
                });
            }
            allowed.insert(route.key.method.clone());
        }
        if allowed.is_empty() {
            Resolution::NotFound
        } else {
            if allowed.contains("GET") {
                allowed.insert("HEAD".to_string());
            }
            Resolution::MethodNotAllowed(allowed.into_iter().collect())
        }
    }
}

fn method_accepts(registered: &str, requested: &str) -> bool {
    registered == ANY_METHOD
        || registered == requested
        || (requested == "HEAD" && registered == "GET")
}
