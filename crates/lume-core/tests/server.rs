use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use lume_core::server::serve_listener;
use lume_core::{Bootstrap, EnginePool, ServerConfig};

const APP: &str = r#"
local router = require("router")
router.get("/hello", function() return "hello" end)
router.get("/count", function()
    hits = (hits or 0) + 1
    return { status = 201, body = tostring(hits), headers = { ["x-kind"] = "counter" } }
end)
"#;

struct Reply {
    status: u16,
    head: String,
    body: String,
}

fn start(requests: usize) -> (u16, thread::JoinHandle<()>) {
    let config = ServerConfig {
        prewarm: 1,
        max_requests: requests,
        ..ServerConfig::default()
    };
    let pool = EnginePool::new(Bootstrap::from_source("app.lua", APP), config);
    pool.run_entry().expect("entry script");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test port");
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        serve_listener(&pool, listener).expect("serve");
    });
    (port, handle)
}

fn send(port: u16, request: &str) -> Reply {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(request.as_bytes()).expect("write request");
    stream.shutdown(std::net::Shutdown::Write).ok();
    let mut buffer = String::new();
    stream.read_to_string(&mut buffer).expect("read response");
    let (head, body) = buffer.split_once("\r\n\r\n").unwrap_or((&buffer, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    Reply {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

#[test]
fn serves_script_responses_over_tcp() {
    let (port, server) = start(3);

    let reply = send(port, "GET /hello HTTP/1.1\r\nHost: localhost\r\nX-Request-Id: trace-1\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "hello");
    assert!(reply.head.contains("Content-Type: text/html;charset=UTF-8\r\n"), "{}", reply.head);
    assert!(reply.head.contains("Content-Length: 5\r\n"));
    assert!(reply.head.contains("\r\nConnection: close"));
    assert!(reply.head.contains("X-Request-Id: trace-1"));
    assert!(reply.head.contains("\r\nDate: "));
    assert!(reply.head.contains(&format!("Server: {}", lume_core::SERVER_NAME)));

    let reply = send(port, "GET /count HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(reply.status, 201);
    assert_eq!(reply.body, "1");
    assert!(reply.head.contains("X-Kind: counter"));

    let reply = send(port, "HEAD /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "");
    assert!(reply.head.contains("Content-Length: 5\r\n"));

    server.join().expect("server stops after max requests");
}

#[test]
fn concurrent_connections_each_see_fresh_state() {
    let clients = 6;
    let (port, server) = start(clients);
    let replies: Vec<_> = (0..clients)
        .map(|_| thread::spawn(move || send(port, "GET /count HTTP/1.1\r\nHost: localhost\r\n\r\n")))
        .collect();
    for reply in replies {
        let reply = reply.join().expect("client thread");
        assert_eq!(reply.status, 201);
        assert_eq!(reply.body, "1");
    }
    server.join().expect("server stops after max requests");
}

#[test]
fn malformed_request_gets_400() {
    let (port, server) = start(1);
    let reply = send(port, "garbage\r\n\r\n");
    assert_eq!(reply.status, 400);
    server.join().expect("server stops after max requests");
}

