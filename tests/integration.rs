mod util;

use std::fs;
use std::os::unix::fs::PermissionsExt;

use util::TestServer;

#[test]
fn serves_static_file() {
    let server = TestServer::start("", "");
    fs::write(server.root.join("hello.txt"), b"hi").unwrap();

    let response = server.get("/hello.txt");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Length"), Some("2"));
    assert_eq!(
        response.header("Content-Type"),
        Some("text/plain; charset=utf-8")
    );
    assert_eq!(response.body, b"hi");
}

#[test]
fn serves_index_file_for_directory() {
    let server = TestServer::start("", "index index.html;");
    fs::write(server.root.join("index.html"), b"<p>home</p>").unwrap();

    let response = server.get("/");
    assert_eq!(response.status(), 200);
    assert_eq!(response.body, b"<p>home</p>");
}

#[test]
fn missing_file_is_404() {
    let server = TestServer::start("", "");
    let response = server.get("/absent.txt");
    assert_eq!(response.status(), 404);
    assert!(response.body_str().contains("404 Not Found"));
}

#[test]
fn head_sends_headers_only() {
    let server = TestServer::start("", "");
    fs::write(server.root.join("hello.txt"), b"hi").unwrap();

    let response = server.request(b"HEAD /hello.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Length"), Some("2"));
    assert!(response.body.is_empty());
}

#[test]
fn range_request_returns_partial_content() {
    let server = TestServer::start("", "");
    let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    fs::write(server.root.join("big.bin"), &data).unwrap();

    let response = server.request(b"GET /big.bin HTTP/1.1\r\nRange: bytes=100-199\r\n\r\n");
    assert_eq!(response.status(), 206);
    assert_eq!(response.header("Content-Range"), Some("bytes 100-199/1000"));
    assert_eq!(response.header("Content-Length"), Some("100"));
    assert_eq!(response.body, &data[100..200]);
}

#[test]
fn range_suffix_and_open_end_work() {
    let server = TestServer::start("", "");
    let data: Vec<u8> = (0..100).map(|i| i as u8).collect();
    fs::write(server.root.join("big.bin"), &data).unwrap();

    let response = server.request(b"GET /big.bin HTTP/1.1\r\nRange: bytes=90-\r\n\r\n");
    assert_eq!(response.status(), 206);
    assert_eq!(response.header("Content-Range"), Some("bytes 90-99/100"));
    assert_eq!(response.body, &data[90..]);

    let response = server.request(b"GET /big.bin HTTP/1.1\r\nRange: bytes=-10\r\n\r\n");
    assert_eq!(response.status(), 206);
    assert_eq!(response.header("Content-Range"), Some("bytes 90-99/100"));
}

#[test]
fn invalid_range_is_416_with_full_length() {
    let server = TestServer::start("", "");
    fs::write(server.root.join("big.bin"), vec![0u8; 1000]).unwrap();

    let response = server.request(b"GET /big.bin HTTP/1.1\r\nRange: bytes=2000-3000\r\n\r\n");
    assert_eq!(response.status(), 416);
    assert_eq!(response.header("Content-Range"), Some("bytes */1000"));
}

#[test]
fn method_not_in_allow_set_is_405() {
    let server = TestServer::start("", "location /api { allow_methods GET; }");

    let response = server.request(b"DELETE /api/x HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 405);
    assert_eq!(response.header("Allow"), Some("GET"));
}

#[test]
fn path_traversal_is_403() {
    let server = TestServer::start("", "");
    let response = server.get("/%2e%2e/etc/passwd");
    assert_eq!(response.status(), 403);

    let response = server.get("/../etc/passwd");
    assert_eq!(response.status(), 403);
}

#[test]
fn redirect_location() {
    let server = TestServer::start("", "location /old { redirect 301 /new; }");

    let response = server.get("/old");
    assert_eq!(response.status(), 301);
    assert_eq!(response.header("Location"), Some("/new"));
    assert_eq!(response.header("Content-Length"), Some("0"));
    assert!(response.body.is_empty());
}

#[test]
fn autoindex_lists_directory() {
    let server = TestServer::start("", "autoindex on;");
    let pub_dir = server.root.join("pub");
    fs::create_dir(&pub_dir).unwrap();
    fs::write(pub_dir.join("a.txt"), b"x").unwrap();
    fs::create_dir(pub_dir.join("sub")).unwrap();

    let response = server.get("/pub/");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.header("Content-Type"),
        Some("text/html; charset=utf-8")
    );
    let body = response.body_str();
    assert!(body.contains("<a href=\"/pub/a.txt\">a.txt</a>"), "{}", body);
    assert!(body.contains("<a href=\"/pub/sub/\">sub/</a>"), "{}", body);
    assert!(body.find("a.txt").unwrap() < body.find("sub/").unwrap());
}

#[test]
fn directory_without_autoindex_is_403() {
    let server = TestServer::start("", "");
    fs::create_dir(server.root.join("pub")).unwrap();

    let response = server.get("/pub/");
    assert_eq!(response.status(), 403);
}

#[test]
fn post_echoes_body() {
    let server = TestServer::start("", "");
    let response = server.request(
        b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\nContent-Type: text/plain\r\n\r\nping",
    );
    assert_eq!(response.status(), 201);
    let body = response.body_str();
    assert!(body.contains("URI: /submit"), "{}", body);
    assert!(body.contains("Content received: 4 bytes"), "{}", body);
    assert!(body.ends_with("ping"), "{}", body);
}

#[test]
fn put_creates_replaces_and_delete_removes() {
    let server = TestServer::start("", "");

    let response = server.request(b"PUT /note.txt HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
    assert_eq!(response.status(), 201);
    assert_eq!(fs::read(server.root.join("note.txt")).unwrap(), b"hello");

    let response = server.request(b"PUT /note.txt HTTP/1.1\r\nContent-Length: 3\r\n\r\nbye");
    assert_eq!(response.status(), 200);
    assert_eq!(fs::read(server.root.join("note.txt")).unwrap(), b"bye");

    let response = server.request(b"DELETE /note.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 204);
    assert_eq!(response.header("Content-Length"), Some("0"));
    assert!(!server.root.join("note.txt").exists());

    let response = server.request(b"DELETE /note.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 404);
}

#[test]
fn unknown_method_is_501() {
    let server = TestServer::start("", "");
    let response = server.request(b"BREW /pot HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 501);
}

#[test]
fn unsupported_version_is_505() {
    let server = TestServer::start("", "");
    let response = server.request(b"GET / HTTP/2.0\r\n\r\n");
    assert_eq!(response.status(), 505);
}

#[test]
fn http10_version_is_echoed() {
    let server = TestServer::start("", "");
    let response = server.request(b"BREW / HTTP/1.0\r\n\r\n");
    assert_eq!(response.status(), 501);
    assert!(response.status_line.starts_with("HTTP/1.0 "));
}

#[test]
fn malformed_request_line_is_400() {
    let server = TestServer::start("", "");
    let response = server.request(b"GET /\r\n\r\n");
    assert_eq!(response.status(), 400);
}

#[test]
fn oversized_body_is_413() {
    let server = TestServer::start("max_request_body 4;", "");
    let response = server.request(b"PUT /x.txt HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789");
    assert_eq!(response.status(), 413);
    assert!(!server.root.join("x.txt").exists());
}

#[test]
fn overlong_uri_is_414() {
    let server = TestServer::start("", "");
    let request = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(5000));
    let response = server.request(request.as_bytes());
    assert_eq!(response.status(), 414);
}

#[test]
fn configured_error_page_is_served() {
    let server = TestServer::start("", "error_page 404 /missing.html;");
    fs::write(server.root.join("missing.html"), b"<h1>gone</h1>").unwrap();

    let response = server.get("/absent");
    assert_eq!(response.status(), 404);
    assert_eq!(response.body, b"<h1>gone</h1>");
}

fn write_script(path: &std::path::Path, content: &str) {
    fs::write(path, content).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn cgi_server() -> TestServer {
    let server = TestServer::start("", "location /cgi-bin { cgi on; }");
    fs::create_dir(server.root.join("cgi-bin")).unwrap();
    server
}

#[test]
fn cgi_output_becomes_response() {
    let server = cgi_server();
    write_script(
        &server.root.join("cgi-bin/hello.sh"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n'\nprintf 'X-Script: ok\\r\\n'\nprintf '\\r\\n'\nprintf 'cgi says hello'\n",
    );

    let response = server.get("/cgi-bin/hello.sh");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("X-Script"), Some("ok"));
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body, b"cgi says hello");
}

#[test]
fn cgi_status_header_overrides_status() {
    let server = cgi_server();
    write_script(
        &server.root.join("cgi-bin/status.sh"),
        "#!/bin/sh\nprintf 'Status: 202 Accepted\\r\\n'\nprintf 'Content-Type: text/plain\\r\\n\\r\\nqueued'\n",
    );

    let response = server.get("/cgi-bin/status.sh");
    assert_eq!(response.status(), 202);
    assert_eq!(response.body, b"queued");
}

#[test]
fn cgi_sees_environment_and_body() {
    let server = cgi_server();
    write_script(
        &server.root.join("cgi-bin/env.sh"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf 'method=%s\\n' \"$REQUEST_METHOD\"\nprintf 'query=%s\\n' \"$QUERY_STRING\"\nprintf 'gateway=%s\\n' \"$GATEWAY_INTERFACE\"\nprintf 'body='\ncat\n",
    );

    let response = server
        .request(b"POST /cgi-bin/env.sh?a=1&b=2 HTTP/1.1\r\nContent-Length: 6\r\n\r\nhello\n");
    let body = response.body_str();
    assert_eq!(response.status(), 200);
    assert!(body.contains("method=POST"), "{}", body);
    assert!(body.contains("query=a=1&b=2"), "{}", body);
    assert!(body.contains("gateway=CGI/1.1"), "{}", body);
    assert!(body.contains("body=hello"), "{}", body);
}

#[test]
fn cgi_failure_is_500() {
    let server = cgi_server();
    write_script(
        &server.root.join("cgi-bin/fail.sh"),
        "#!/bin/sh\nexit 3\n",
    );

    let response = server.get("/cgi-bin/fail.sh");
    assert_eq!(response.status(), 500);
}

#[test]
fn cgi_preflight_failures_are_403() {
    let server = cgi_server();

    // not executable
    fs::write(server.root.join("cgi-bin/plain.sh"), "#!/bin/sh\n").unwrap();
    let response = server.get("/cgi-bin/plain.sh");
    assert_eq!(response.status(), 403);

    // disallowed extension
    write_script(&server.root.join("cgi-bin/tool.cfg"), "#!/bin/sh\n");
    let response = server.get("/cgi-bin/tool.cfg");
    assert_eq!(response.status(), 403);

    // missing script
    let response = server.get("/cgi-bin/absent.sh");
    assert_eq!(response.status(), 403);
}
