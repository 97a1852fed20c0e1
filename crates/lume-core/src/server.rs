use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::dispatch::{Dispatcher, Outcome};
use crate::engine::EnginePool;
use crate::http::{HttpResponse, http_date, read_http_request};
use crate::observability::{
    RESPONSE_REQUEST_ID_HEADER, RequestRecord, classify_panic_payload, emit_http_observability,
    format_panic_message, resolve_request_id,
};
use crate::task_pool;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Binds `addr` and serves until `max_requests` connections were handled
/// (forever when it is 0). `:8080` binds every interface.
pub fn serve(pool: &Arc<EnginePool>, addr: &str) -> Result<(), String> {
    let addr = normalize_addr(addr);
    let listener =
        TcpListener::bind(&addr).map_err(|err| format!("failed to bind {addr}: {err}"))?;
    serve_listener(pool, listener)
}

pub fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

pub fn serve_listener(pool: &Arc<EnginePool>, listener: TcpListener) -> Result<(), String> {
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(pool)));
    let max_requests = pool.config().max_requests;
    if let Ok(local) = listener.local_addr() {
        lume_rt::log::info(&format!("listening on http://{local}"));
    }
    let in_flight = InFlight::default();
    let mut accepted = 0usize;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                lume_rt::log::warn(&format!("failed to accept connection: {err}"));
                continue;
            }
        };
        let dispatcher = Arc::clone(&dispatcher);
        let ticket = in_flight.start();
        task_pool::submit(move || {
            let _ticket = ticket;
            handle_connection(&dispatcher, stream);
        });
        accepted += 1;
        if max_requests > 0 && accepted >= max_requests {
            break;
        }
    }
    in_flight.wait_idle();
    Ok(())
}

/// Counts connections still being served.
#[derive(Clone, Default)]
struct InFlight {
    state: Arc<(Mutex<usize>, Condvar)>,
}

struct Ticket {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl InFlight {
    fn start(&self) -> Ticket {
        let (count, _) = &*self.state;
        *count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ticket {
            state: Arc::clone(&self.state),
        }
    }

    fn wait_idle(&self) {
        let (count, idle) = &*self.state;
        let mut count = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = idle.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let (count, idle) = &*self.state;
        let mut count = count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        idle.notify_all();
    }
}

fn handle_connection(dispatcher: &Dispatcher, mut stream: TcpStream) {
    let started = Instant::now();
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
    let request = match read_http_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            lume_rt::log::debug(&format!("rejecting malformed request: {err}"));
            let response = HttpResponse::text(400, err);
            let _ = stream.write_all(&response.to_bytes(true));
            return;
        }
    };
    let request_id = resolve_request_id(&request.headers);
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle(&request))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let details = classify_panic_payload(payload.as_ref());
            lume_rt::log::error(&format!(
                "request {request_id} panicked: {}",
                format_panic_message(&details)
            ));
            Outcome {
                response: HttpResponse::text(500, "internal server error"),
                route: None,
                phase: None,
            }
        }
    };
    let mut response = outcome.response;
    response.set_header(RESPONSE_REQUEST_ID_HEADER, &request_id);
    response.set_header("Date", &http_date());
    if response.header("Server").is_none() {
        let server_name = dispatcher.server_name().to_string();
        response.set_header("Server", &server_name);
    }
    let bytes = response.to_bytes(request.method != "HEAD");
    if let Err(err) = stream.write_all(&bytes).and_then(|_| stream.flush()) {
        lume_rt::log::debug(&format!("failed to write response: {err}"));
    }
    emit_http_observability(&RequestRecord {
        request_id: &request_id,
        method: &request.method,
        path: &request.path,
        route: outcome.route.as_deref(),
        status: response.status,
        duration: started.elapsed(),
        response_bytes: response.body.len(),
    });
}
