use std::time::Duration;

use lume_rt::config::{env_key, env_override};
use serde::Deserialize;

/// The `[server]` table of `lume.toml`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker threads serving connections. Defaults to the available parallelism.
    pub workers: Option<usize>,
    /// Upper bound on interpreters checked out at the same time.
    pub max_interpreters: usize,
    /// Pristine interpreters kept ready for the next requests.
    pub prewarm: usize,
    pub handler_timeout_ms: Option<u64>,
    pub memory_limit_bytes: Option<usize>,
    /// Stop accepting after this many connections; 0 serves forever.
    pub max_requests: usize,
    #[serde(skip)]
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_interpreters: 64,
            prewarm: 2,
            handler_timeout_ms: None,
            memory_limit_bytes: None,
            max_requests: 0,
            server_name: crate::SERVER_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Applies `LUME_SERVER_*` overrides, plus the short forms
    /// `LUME_WORKERS` and `LUME_MAX_REQUESTS`.
    pub fn apply_env(&mut self) -> Result<(), String> {
        if let Some(workers) = env_override::<usize>(&env_key("server", "workers"))?
            .or(env_override::<usize>("LUME_WORKERS")?)
        {
            self.workers = Some(workers);
        }
        if let Some(max) = env_override(&env_key("server", "max_interpreters"))? {
            self.max_interpreters = max;
        }
        if let Some(prewarm) = env_override(&env_key("server", "prewarm"))? {
            self.prewarm = prewarm;
        }
        if let Some(ms) = env_override(&env_key("server", "handler_timeout_ms"))? {
            self.handler_timeout_ms = Some(ms);
        }
        if let Some(bytes) = env_override(&env_key("server", "memory_limit_bytes"))? {
            self.memory_limit_bytes = Some(bytes);
        }
        if let Some(max) = env_override::<usize>(&env_key("server", "max_requests"))?
            .or(env_override::<usize>("LUME_MAX_REQUESTS")?)
        {
            self.max_requests = max;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_interpreters == 0 {
            return Err("server.max_interpreters must be at least 1".to_string());
        }
        if self.workers == Some(0) {
            return Err("server.workers must be at least 1".to_string());
        }
        if self.handler_timeout_ms == Some(0) {
            return Err("server.handler_timeout_ms must be positive".to_string());
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}
