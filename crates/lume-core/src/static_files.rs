use std::fs;
use std::path::{Component, Path};

use crate::http::{HttpRequest, HttpResponse};

const INDEX_FILE: &str = "index.html";
pub(crate) const NOT_FOUND_BODY: &str = "404 page not found";

/// Serves one file for every request routed to it.
pub(crate) fn serve_file(request: &HttpRequest, file: &Path) -> HttpResponse {
    if let Some(response) = reject_method(request) {
        return response;
    }
    read_file(file)
}

/// Serves `rest` (the catch-all part of the request path) from `dir`.
/// Paths that leave the directory are treated as missing.
pub(crate) fn serve_dir(request: &HttpRequest, dir: &Path, rest: &str) -> HttpResponse {
    if let Some(response) = reject_method(request) {
        return response;
    }
    let rel_path = if rest.is_empty() || rest.ends_with('/') {
        format!("{rest}{INDEX_FILE}")
    } else {
        rest.to_string()
    };
    let rel = Path::new(&rel_path);
    if rel.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    }) {
        return HttpResponse::text(404, NOT_FOUND_BODY);
    }
    let full = dir.join(rel);
    if full.is_dir() {
        return read_file(&full.join(INDEX_FILE));
    }
    read_file(&full)
}

fn reject_method(request: &HttpRequest) -> Option<HttpResponse> {
    match request.method.as_str() {
        "GET" | "HEAD" => None,
        _ => Some(
            HttpResponse::text(405, "405 method not allowed").with_header("Allow", "GET, HEAD"),
        ),
    }
}

fn read_file(path: &Path) -> HttpResponse {
    if !path.is_file() {
        return HttpResponse::text(404, NOT_FOUND_BODY);
    }
    match fs::read(path) {
        Ok(body) => HttpResponse::new(200)
            .with_header("Content-Type", content_type(path))
            .with_body(body),
        Err(err) => {
            lume_rt::log::warn(&format!("failed to read {}: {err}", path.display()));
            HttpResponse::text(500, format!("failed to read file: {err}"))
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("lua") | Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("lume-static-{name}-{nanos}"));
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.join("sub").join("app.css"), "body{}").unwrap();
        dir
    }

    #[test]
    fn serves_nested_files_with_content_type() {
        let dir = temp_dir("nested");
        let response = serve_dir(&HttpRequest::new("GET", "/static/sub/app.css"), &dir, "sub/app.css");
        assert_eq!(response.status, 200);
        assert_eq!(response.header("Content-Type"), Some("text/css; charset=utf-8"));
        assert_eq!(response.body, b"body{}");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn directory_requests_use_index() {
        let dir = temp_dir("index");
        let response = serve_dir(&HttpRequest::new("GET", "/static/"), &dir, "");
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "<h1>home</h1>");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn traversal_and_missing_files_are_not_found() {
        let dir = temp_dir("traversal");
        let request = HttpRequest::new("GET", "/static/x");
        assert_eq!(serve_dir(&request, &dir, "../secret").status, 404);
        assert_eq!(serve_dir(&request, &dir, "missing.txt").status, 404);
        assert_eq!(serve_file(&request, &dir.join("nope.html")).status, 404);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn only_get_and_head_are_served() {
        let dir = temp_dir("method");
        let response = serve_file(&HttpRequest::new("POST", "/"), &dir.join("index.html"));
        assert_eq!(response.status, 405);
        assert_eq!(response.header("Allow"), Some("GET, HEAD"));
        let _ = fs::remove_dir_all(dir);
    }
}
