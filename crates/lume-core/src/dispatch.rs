use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::EnginePool;
use crate::error::EngineError;
use crate::http::{HttpRequest, HttpResponse};
use crate::response::{self, SynthesizedResponse};
use crate::router::{CATCH_ALL_PARAM, HandlerId, Resolution, RouteTable, RouteTarget};
use crate::static_files::{self, NOT_FOUND_BODY};

/// Lifecycle of one script request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Matched,
    Executing,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub handler: HandlerId,
    pub method: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    phase: Phase,
}

impl ExecutionContext {
    pub fn new(
        handler: HandlerId,
        method: &str,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            handler,
            method: method.to_string(),
            path: path.to_string(),
            params,
            phase: Phase::Matched,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// What the dispatcher produced for one request.
#[derive(Debug)]
pub struct Outcome {
    pub response: HttpResponse,
    /// `METHOD pattern` of the matched route.
    pub route: Option<String>,
    /// Set for script routes only.
    pub phase: Option<Phase>,
}

pub struct Dispatcher {
    pool: Arc<EnginePool>,
    routes: Arc<RouteTable>,
}

impl Dispatcher {
    /// Publishes the pool's routes if that has not happened yet.
    pub fn new(pool: Arc<EnginePool>) -> Self {
        let routes = pool.publish_routes();
        Self { pool, routes }
    }

    pub fn server_name(&self) -> &str {
        &self.pool.config().server_name
    }

    pub fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        self.handle(request).response
    }

    pub fn handle(&self, request: &HttpRequest) -> Outcome {
        let hit = match self.routes.resolve(&request.method, &request.path) {
            Resolution::Matched(hit) => hit,
            Resolution::NotFound => {
                return Outcome {
                    response: HttpResponse::text(404, NOT_FOUND_BODY),
                    route: None,
                    phase: None,
                };
            }
            Resolution::MethodNotAllowed(allowed) => {
                return Outcome {
                    response: HttpResponse::text(405, "405 method not allowed")
                        .with_header("Allow", &allowed.join(", ")),
                    route: None,
                    phase: None,
                };
            }
        };
        let route = Some(hit.key.to_string());
        match hit.target {
            RouteTarget::File(file) => Outcome {
                response: static_files::serve_file(request, file),
                route,
                phase: None,
            },
            RouteTarget::Dir(dir) => {
                let rest = hit.params.get(CATCH_ALL_PARAM).map(String::as_str).unwrap_or("");
                Outcome {
                    response: static_files::serve_dir(request, dir, rest),
                    route,
                    phase: None,
                }
            }
            RouteTarget::Script(id) => {
                let mut ctx = ExecutionContext::new(*id, &request.method, &request.path, hit.params);
                let response = self.execute(&mut ctx);
                Outcome {
                    response,
                    route,
                    phase: Some(ctx.phase),
                }
            }
        }
    }

    /// Runs the handler for `ctx` in its own interpreter.
    pub fn execute(&self, ctx: &mut ExecutionContext) -> HttpResponse {
        match self.run_script(ctx) {
            Ok(out) => {
                ctx.phase = Phase::Completed;
                let mut response = HttpResponse::new(out.status).with_body(out.body.into_bytes());
                for (name, value) in &out.headers {
                    response.set_header(name, value);
                }
                response
            }
            Err(err) => {
                ctx.phase = Phase::Failed;
                lume_rt::log::error(&format!(
                    "handler for {} {} failed: {err}",
                    ctx.method, ctx.path
                ));
                let status = match err {
                    EngineError::Timeout(_) => 504,
                    _ => 500,
                };
                HttpResponse::text(status, err.to_string())
            }
        }
    }

    fn run_script(&self, ctx: &mut ExecutionContext) -> Result<SynthesizedResponse, EngineError> {
        let guard = self.pool.acquire()?;
        ctx.phase = Phase::Executing;
        let lua = guard.lua();
        let params = lua.create_table()?;
        for (name, value) in &ctx.params {
            params.raw_set(name.as_str(), value.as_str())?;
        }
        let value = guard.invoke(
            ctx.handler,
            (ctx.method.as_str(), ctx.path.as_str(), params),
            self.pool.config().handler_timeout(),
        )?;
        let out = response::synthesize(&value, &self.pool.config().server_name);
        drop(value);
        drop(guard);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::Bootstrap;

    fn dispatcher(source: &str) -> Dispatcher {
        let config = ServerConfig {
            prewarm: 0,
            server_name: "lume-test".to_string(),
            ..ServerConfig::default()
        };
        let pool = EnginePool::new(Bootstrap::from_source("main.lua", source), config);
        pool.run_entry().expect("entry");
        Dispatcher::new(pool)
    }

    #[test]
    fn phases_follow_the_outcome() {
        let dispatcher = dispatcher(
            r#"
            local r = require("router")
            r.get("/ok", function() return "ok" end)
            r.get("/boom", function() error("boom", 0) end)
            "#,
        );
        let ok = dispatcher.handle(&HttpRequest::new("GET", "/ok"));
        assert_eq!(ok.phase, Some(Phase::Completed));
        assert_eq!(ok.route.as_deref(), Some("GET /ok"));

        let failed = dispatcher.handle(&HttpRequest::new("GET", "/boom"));
        assert_eq!(failed.phase, Some(Phase::Failed));
        assert_eq!(failed.response.status, 500);
        assert_eq!(failed.response.body_text(), "boom");

        let missing = dispatcher.handle(&HttpRequest::new("GET", "/nope"));
        assert_eq!(missing.phase, None);
        assert_eq!(missing.response.status, 404);
    }

    #[test]
    fn context_starts_matched() {
        let ctx = ExecutionContext::new(3, "GET", "/x", BTreeMap::new());
        assert_eq!(ctx.phase(), Phase::Matched);
    }
}
