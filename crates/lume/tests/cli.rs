use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn temp_project_dir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("lume_cli_{tag}_{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test port");
    listener.local_addr().unwrap().port()
}

fn send_http_request_with_retry(port: u16, request: &str) -> (u16, String) {
    let start = Instant::now();
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(mut stream) => {
                stream
                    .write_all(request.as_bytes())
                    .expect("failed to write request");
                stream.shutdown(std::net::Shutdown::Write).ok();
                let mut buffer = String::new();
                stream
                    .read_to_string(&mut buffer)
                    .expect("failed to read response");
                let status = buffer
                    .split_whitespace()
                    .nth(1)
                    .and_then(|code| code.parse::<u16>().ok())
                    .unwrap_or(500);
                let body = buffer
                    .split_once("\r\n\r\n")
                    .map(|(_, body)| body.to_string())
                    .unwrap_or_default();
                return (status, body);
            }
            Err(_) => {
                if start.elapsed() > Duration::from_secs(5) {
                    panic!("server did not start on 127.0.0.1:{port}");
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn lume() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lume"));
    cmd.env_remove("LUME_MAX_REQUESTS")
        .env_remove("LUME_LOG")
        .env_remove("LUME_REQUEST_LOG");
    cmd
}

#[test]
fn prints_build_info() {
    let output = lume().arg("-v").output().expect("run lume");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("lume "), "stdout: {stdout}");
    assert!(stdout.contains("target="));
}

#[test]
fn missing_entry_is_fatal() {
    let output = lume()
        .arg("-file")
        .arg("does-not-exist.lua")
        .output()
        .expect("run lume");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error: file not found: does-not-exist.lua"),
        "stderr: {stderr}"
    );
}

#[test]
fn script_error_is_fatal() {
    let dir = temp_project_dir("script_error");
    fs::write(dir.join("main.lua"), "error('no config for you')\n").expect("write main.lua");
    let output = lume()
        .arg("-file")
        .arg(dir.join("main.lua"))
        .output()
        .expect("run lume");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no config for you"), "stderr: {stderr}");
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn invalid_manifest_is_fatal() {
    let dir = temp_project_dir("bad_manifest");
    fs::write(dir.join("main.lua"), "print('unreachable')\n").expect("write main.lua");
    fs::write(dir.join("lume.toml"), "[server\nprewarm = 1\n").expect("write lume.toml");
    let output = lume()
        .arg("-file")
        .arg(dir.join("main.lua"))
        .output()
        .expect("run lume");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: invalid manifest"), "stderr: {stderr}");
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn flags_and_modules_reach_the_script() {
    let dir = temp_project_dir("args");
    fs::write(
        dir.join("greeting.lua"),
        "return { text = function(name) return 'hi ' .. name end }\n",
    )
    .expect("write greeting.lua");
    fs::write(
        dir.join("main.lua"),
        r#"
local greeting = require("greeting")
local json = require("json")
print(greeting.text(arg.name))
print(json.encode({ mode = arg.mode, empty = {} }))
"#,
    )
    .expect("write main.lua");
    let output = lume()
        .arg("-file")
        .arg(dir.join("main.lua"))
        .arg("-name=lume")
        .arg("--mode")
        .arg("test")
        .output()
        .expect("run lume");
    if !output.status.success() {
        panic!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["hi lume", r#"{"empty":null,"mode":"test"}"#]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn serves_routes_with_dotenv_settings() {
    let dir = temp_project_dir("serve");
    let port = find_free_port();
    fs::write(
        dir.join("main.lua"),
        r#"
local router = require("router")
router.get("/hello/{name}", function(method, path, params)
    return { status = 200, body = "hello " .. params.name, headers = { ["x-app"] = arg.app } }
end)
router.listen("127.0.0.1:" .. os.getenv("APP_PORT"))
"#,
    )
    .expect("write main.lua");
    fs::write(
        dir.join(".env"),
        format!("APP_PORT={port}\nLUME_MAX_REQUESTS=1\n"),
    )
    .expect("write .env");
    fs::write(dir.join("lume.toml"), "[server]\nprewarm = 1\nmax_interpreters = 4\n")
        .expect("write lume.toml");

    let mut child = lume()
        .arg("-file")
        .arg(dir.join("main.lua"))
        .arg("-app=demo")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start server");
    let (status, body) = send_http_request_with_retry(
        port,
        &format!("GET /hello/world HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"),
    );
    let exit = child.wait().expect("server exits after one request");
    assert_eq!(status, 200);
    assert_eq!(body, "hello world");
    assert!(exit.success());
    let _ = fs::remove_dir_all(&dir);
}
