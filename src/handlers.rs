//! Request handlers. A handler converts a matched request into a response,
//! possibly across multiple readiness events: `start` runs once, `resume`
//! runs on every later wakeup until it reports `Done` or `Error`. A handler
//! owns every descriptor and child process it creates and releases them on
//! drop.

use std::fs::{self, remove_file, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use chrono::Utc;
use log::{debug, error, info};
use nix::unistd::{dup, pipe};

use crate::conn::Connection;
use crate::fileutil::{
    self, open_file, parse_range, send_from_file, set_nonblocking, FileInfo, PumpProgress,
};
use crate::http::{find_subslice, HtmlEscaped, HttpDate, Method, CRLF};
use crate::uri;

/// What a handler reports back to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The response is fully present in the write buffer.
    Done,
    /// Progress was made; call `resume` on the next readiness event.
    WouldBlock,
    /// The handler failed before producing a response.
    Error,
}

/// The handler variants a dispatched request can select.
pub enum Handler {
    Redirect(RedirectHandler),
    File(FileHandler),
    Autoindex(AutoindexHandler),
    Cgi(CgiHandler),
}

impl Handler {
    pub fn start(&mut self, conn: &mut Connection) -> HandlerResult {
        match self {
            Handler::Redirect(h) => h.start(conn),
            Handler::File(h) => h.start(conn),
            Handler::Autoindex(h) => h.start(conn),
            Handler::Cgi(h) => h.start(conn),
        }
    }

    pub fn resume(&mut self, conn: &mut Connection) -> HandlerResult {
        match self {
            Handler::Redirect(_) | Handler::Autoindex(_) => HandlerResult::Done,
            Handler::File(h) => h.resume(conn),
            Handler::Cgi(h) => h.resume(conn),
        }
    }

    /// Extra descriptor the event loop should watch for readability while
    /// this handler is active (the CGI output pipe).
    pub fn monitor_fd(&self) -> Option<RawFd> {
        match self {
            Handler::Cgi(h) => h.pipe.as_ref().map(|p| p.as_raw_fd()),
            _ => None,
        }
    }

    /// Unix timestamp after which the handler should be aborted.
    pub fn deadline(&self) -> Option<i64> {
        match self {
            Handler::Cgi(h) => h.deadline,
            _ => None,
        }
    }
}

/// Answers with the location's configured redirect.
pub struct RedirectHandler {
    code: u16,
    target: String,
}

impl RedirectHandler {
    pub fn new(code: u16, target: String) -> RedirectHandler {
        RedirectHandler { code, target }
    }

    fn start(&mut self, conn: &mut Connection) -> HandlerResult {
        conn.response.version = conn.http_version();
        conn.response.status = self.code;
        let date = HttpDate(Utc::now().timestamp()).to_string();
        conn.response.add_header("Date", &date);
        conn.response.add_header("Location", &self.target);
        conn.response.add_header("Content-Length", "0");
        conn.write_buffer = conn.response.serialize_headers();
        conn.write_offset = 0;
        HandlerResult::Done
    }
}

/// Serves a filesystem resource: GET/HEAD with Range support, POST echo,
/// PUT create/replace, DELETE.
pub struct FileHandler {
    path: PathBuf,
    method: Method,
    file: Option<File>,
    offset: libc::off_t,
    max_offset: libc::off_t,
}

impl FileHandler {
    pub fn new(path: PathBuf, method: Method) -> FileHandler {
        FileHandler {
            path,
            method,
            file: None,
            offset: 0,
            max_offset: 0,
        }
    }

    fn start(&mut self, conn: &mut Connection) -> HandlerResult {
        debug!(
            "file handler: {} {}",
            self.method,
            self.path.to_string_lossy()
        );
        match self.method {
            Method::Get => self.handle_get(conn),
            Method::Head => self.handle_head(conn),
            Method::Post => self.handle_post(conn),
            Method::Put => self.handle_put(conn),
            Method::Delete => self.handle_delete(conn),
        }
    }

    /// Drive the byte pump from the open file to the socket.
    fn resume(&mut self, conn: &mut Connection) -> HandlerResult {
        let file = match &self.file {
            Some(file) => file,
            None => return HandlerResult::Done,
        };
        let before = self.offset;
        let progress = send_from_file(
            conn.socket.as_raw_fd(),
            file.as_raw_fd(),
            &mut self.offset,
            self.max_offset,
        );
        conn.total_sent += (self.offset - before) as u64;
        match progress {
            Ok(PumpProgress::Complete) => {
                self.file = None;
                HandlerResult::Done
            }
            Ok(PumpProgress::Again) => HandlerResult::WouldBlock,
            Err(e) => {
                error!("file handler: sendfile failed: {}", e);
                self.file = None;
                HandlerResult::Error
            }
        }
    }

    /// Open the file and build the 200/206 header block, or prepare a
    /// 404/403/416/500 response. Returns the open file on success.
    fn prepare_file_response(&mut self, conn: &mut Connection) -> Option<FileInfo> {
        let info = match open_file(&self.path) {
            Ok(info) => info,
            Err(e) => {
                let status = match e.kind() {
                    ErrorKind::NotFound => 404,
                    ErrorKind::PermissionDenied => 403,
                    _ => 500,
                };
                conn.prepare_error_response(status);
                return None;
            }
        };

        conn.response.version = conn.http_version();
        let date = HttpDate(Utc::now().timestamp()).to_string();
        conn.response.add_header("Date", &date);
        conn.response.add_header("Accept-Ranges", "bytes");

        let range = conn.request.header("Range").map(str::to_string);
        match range {
            Some(header) => match parse_range(&header, info.size) {
                Some((start, end)) => {
                    conn.response.status = 206;
                    conn.response
                        .add_header("Content-Length", &(end - start + 1).to_string());
                    conn.response.add_header(
                        "Content-Range",
                        &format!("bytes {}-{}/{}", start, end, info.size),
                    );
                    self.offset = start;
                    self.max_offset = end + 1;
                }
                None => {
                    conn.response
                        .add_header("Content-Range", &format!("bytes */{}", info.size));
                    conn.prepare_error_response(416);
                    return None;
                }
            },
            None => {
                conn.response.status = 200;
                conn.response
                    .add_header("Content-Length", &info.size.to_string());
                self.offset = 0;
                self.max_offset = info.size;
            }
        }
        conn.response.add_header(
            "Content-Type",
            fileutil::content_type(&self.path.to_string_lossy()),
        );
        Some(info)
    }

    fn handle_get(&mut self, conn: &mut Connection) -> HandlerResult {
        let info = match self.prepare_file_response(conn) {
            Some(info) => info,
            None => return HandlerResult::Done,
        };
        // Only the header block goes through the write buffer; the body is
        // streamed by resume().
        conn.write_buffer = conn.response.serialize_headers();
        conn.write_offset = 0;
        self.file = Some(info.file);
        HandlerResult::WouldBlock
    }

    fn handle_head(&mut self, conn: &mut Connection) -> HandlerResult {
        if self.prepare_file_response(conn).is_none() {
            return HandlerResult::Done;
        }
        conn.write_buffer = conn.response.serialize_headers();
        conn.write_offset = 0;
        HandlerResult::Done
    }

    fn handle_post(&mut self, conn: &mut Connection) -> HandlerResult {
        conn.response.version = conn.http_version();
        conn.response.status = 201;

        let mut body = format!(
            "POST request processed successfully{}URI: {}{}Content received: {} bytes{}Data:{}",
            CRLF,
            conn.request.uri,
            CRLF,
            conn.request.body.len(),
            CRLF,
            CRLF
        )
        .into_bytes();
        body.extend_from_slice(&conn.request.body);

        self.finish_plaintext(conn, body)
    }

    fn handle_put(&mut self, conn: &mut Connection) -> HandlerResult {
        // Exclusive create first so create-versus-replace is atomic.
        let mut created = true;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)
            .or_else(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    created = false;
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .mode(0o600)
                        .open(&self.path)
                } else {
                    Err(e)
                }
            });
        let mut file = match file {
            Ok(file) => file,
            Err(e) => {
                error!("file handler: PUT open failed: {}", e);
                conn.prepare_error_response(500);
                return HandlerResult::Done;
            }
        };

        if let Err(e) = file.write_all(&conn.request.body) {
            error!("file handler: PUT write failed: {}", e);
            drop(file);
            // don't leave a truncated file behind
            remove_file(&self.path).ok();
            conn.prepare_error_response(500);
            return HandlerResult::Done;
        }

        conn.response.version = conn.http_version();
        conn.response.status = if created { 201 } else { 200 };

        let body = format!(
            "PUT request processed successfully{}Resource: {}{}Bytes written: {}{}",
            CRLF,
            self.path.to_string_lossy(),
            CRLF,
            conn.request.body.len(),
            CRLF
        )
        .into_bytes();

        self.finish_plaintext(conn, body)
    }

    fn handle_delete(&mut self, conn: &mut Connection) -> HandlerResult {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(_) => {
                conn.prepare_error_response(404);
                return HandlerResult::Done;
            }
        };
        if !metadata.is_file() {
            info!(
                "file handler: DELETE refused for non-regular file {}",
                self.path.to_string_lossy()
            );
            conn.prepare_error_response(403);
            return HandlerResult::Done;
        }
        if let Err(e) = remove_file(&self.path) {
            error!("file handler: DELETE failed: {}", e);
            conn.prepare_error_response(500);
            return HandlerResult::Done;
        }

        conn.response.version = conn.http_version();
        conn.response.status = 204;
        let date = HttpDate(Utc::now().timestamp()).to_string();
        conn.response.add_header("Date", &date);
        conn.response.add_header("Content-Length", "0");
        conn.write_buffer = conn.response.serialize_headers();
        conn.write_offset = 0;
        info!("file handler: deleted {}", self.path.to_string_lossy());
        HandlerResult::Done
    }

    fn finish_plaintext(&self, conn: &mut Connection, body: Vec<u8>) -> HandlerResult {
        let date = HttpDate(Utc::now().timestamp()).to_string();
        conn.response.add_header("Date", &date);
        conn.response
            .add_header("Content-Type", "text/plain; charset=utf-8");
        conn.response
            .add_header("Content-Length", &body.len().to_string());
        conn.response.body = body;
        conn.write_buffer = conn.response.serialize();
        conn.write_offset = 0;
        HandlerResult::Done
    }
}

/// Generates an HTML listing for a directory request.
pub struct AutoindexHandler {
    dir_path: PathBuf,
    uri_path: String,
    method: Method,
}

impl AutoindexHandler {
    /// `uri_path` is the user-facing request path, normalised by the caller
    /// to start and end with `/`.
    pub fn new(dir_path: PathBuf, uri_path: String, method: Method) -> AutoindexHandler {
        AutoindexHandler {
            dir_path,
            uri_path,
            method,
        }
    }

    fn start(&mut self, conn: &mut Connection) -> HandlerResult {
        if self.method != Method::Get && self.method != Method::Head {
            conn.response.add_header("Allow", "GET, HEAD");
            conn.prepare_error_response(405);
            return HandlerResult::Done;
        }

        let body = match build_listing_body(&self.dir_path, &self.uri_path) {
            Ok(body) => body.into_bytes(),
            Err(e) => {
                error!(
                    "autoindex: failed to list {}: {}",
                    self.dir_path.to_string_lossy(),
                    e
                );
                conn.prepare_error_response(500);
                return HandlerResult::Done;
            }
        };

        conn.response.version = conn.http_version();
        conn.response.status = 200;
        let date = HttpDate(Utc::now().timestamp()).to_string();
        conn.response.add_header("Date", &date);
        conn.response
            .add_header("Content-Type", "text/html; charset=utf-8");
        conn.response
            .add_header("Content-Length", &body.len().to_string());

        // HEAD advertises the length a GET would have, without the body.
        if self.method == Method::Get {
            conn.response.body = body;
            conn.write_buffer = conn.response.serialize();
        } else {
            conn.write_buffer = conn.response.serialize_headers();
        }
        conn.write_offset = 0;
        HandlerResult::Done
    }
}

/// Build the listing document: entries sorted by byte value, directories
/// with a trailing slash, hrefs percent-encoded, everything HTML-escaped.
fn build_listing_body(dir_path: &Path, uri_path: &str) -> std::io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let is_dir = fs::metadata(entry.path())
            .map(|m| m.is_dir())
            .unwrap_or(false);
        entries.push((name, is_dir));
    }
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut body = String::new();
    body.push_str("<!DOCTYPE html>");
    body.push_str(CRLF);
    body.push_str("<html>");
    body.push_str(CRLF);
    body.push_str("<head>");
    body.push_str(CRLF);
    body.push_str("<meta charset=\"utf-8\">");
    body.push_str(CRLF);
    body.push_str(&format!(
        "<title>Index of {}</title>{}",
        HtmlEscaped(uri_path),
        CRLF
    ));
    body.push_str("</head>");
    body.push_str(CRLF);
    body.push_str("<body>");
    body.push_str(CRLF);
    body.push_str(&format!(
        "<h1>Index of {}</h1>{}",
        HtmlEscaped(uri_path),
        CRLF
    ));
    body.push_str("<ul>");
    body.push_str(CRLF);

    for (name, is_dir) in &entries {
        let mut href = format!("{}{}", uri_path, uri::encode(name));
        let mut display = name.clone();
        if *is_dir {
            href.push('/');
            display.push('/');
        }
        body.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>{}",
            HtmlEscaped(&href),
            HtmlEscaped(&display),
            CRLF
        ));
    }

    body.push_str("</ul>");
    body.push_str(CRLF);
    body.push_str("</body>");
    body.push_str(CRLF);
    body.push_str("</html>");
    body.push_str(CRLF);
    Ok(body)
}

const ALLOWED_CGI_EXTENSIONS: &[&str] = &["sh", "py", "pl", "php", "cgi"];

/// Seconds a CGI child may run before it is killed and mapped to 504.
pub const CGI_TIMEOUT_SECS: i64 = 30;

/// Runs a script as a child process and maps its stdout to the response.
pub struct CgiHandler {
    script_path: PathBuf,
    cgi_root: PathBuf,
    server_name: String,
    server_port: u16,
    child: Option<Child>,
    pipe: Option<File>,
    output: Vec<u8>,
    deadline: Option<i64>,
}

impl CgiHandler {
    pub fn new(
        script_path: PathBuf,
        cgi_root: PathBuf,
        server_name: String,
        server_port: u16,
    ) -> CgiHandler {
        CgiHandler {
            script_path,
            cgi_root,
            server_name,
            server_port,
            child: None,
            pipe: None,
            output: Vec::new(),
            deadline: None,
        }
    }

    fn start(&mut self, conn: &mut Connection) -> HandlerResult {
        let script = match self.preflight() {
            Some(script) => script,
            None => {
                info!(
                    "cgi: preflight rejected {}",
                    self.script_path.to_string_lossy()
                );
                conn.prepare_error_response(403);
                return HandlerResult::Done;
            }
        };
        debug!("cgi: executing {}", script.to_string_lossy());

        let env = self.build_environment(conn);

        // One pipe collects both stdout and stderr of the child.
        let (pipe_read, pipe_write) = match pipe() {
            Ok(fds) => fds,
            Err(e) => {
                error!("cgi: pipe failed: {}", e);
                conn.prepare_error_response(500);
                return HandlerResult::Done;
            }
        };
        let pipe_read = unsafe { File::from_raw_fd(pipe_read) };
        let pipe_write_dup = match dup(pipe_write) {
            Ok(fd) => fd,
            Err(e) => {
                error!("cgi: dup failed: {}", e);
                nix::unistd::close(pipe_write).ok();
                conn.prepare_error_response(500);
                return HandlerResult::Done;
            }
        };

        let mut command = Command::new(&script);
        command
            .current_dir(script.parent().unwrap_or_else(|| Path::new("/")))
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(unsafe { Stdio::from_raw_fd(pipe_write) })
            .stderr(unsafe { Stdio::from_raw_fd(pipe_write_dup) });

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("cgi: spawn failed for {}: {}", script.to_string_lossy(), e);
                conn.prepare_error_response(500);
                return HandlerResult::Done;
            }
        };

        // Feed the request body to the child and close its stdin. A child
        // that exits early makes this fail with EPIPE, which is fine.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&conn.request.body).ok();
        }

        if let Err(e) = set_nonblocking(pipe_read.as_raw_fd()) {
            error!("cgi: failed to set pipe non-blocking: {}", e);
            child.kill().ok();
            child.wait().ok();
            conn.prepare_error_response(500);
            return HandlerResult::Done;
        }

        self.child = Some(child);
        self.pipe = Some(pipe_read);
        self.deadline = Some(Utc::now().timestamp() + CGI_TIMEOUT_SECS);

        self.read_output(conn)
    }

    fn resume(&mut self, conn: &mut Connection) -> HandlerResult {
        if self.child.is_none() && self.pipe.is_none() {
            return HandlerResult::Done;
        }
        self.read_output(conn)
    }

    /// Drain the child's output pipe; at EOF reap the child and build the
    /// response.
    fn read_output(&mut self, conn: &mut Connection) -> HandlerResult {
        let pipe = match &mut self.pipe {
            Some(pipe) => pipe,
            None => return HandlerResult::Error,
        };
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    debug!("cgi: {} byte(s) buffered, waiting", self.output.len());
                    return HandlerResult::WouldBlock;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("cgi: read from child failed: {}", e);
                    return HandlerResult::Error;
                }
            }
        }

        // EOF: close our end and reap the child.
        self.pipe = None;
        let status = match self.child.take() {
            Some(mut child) => child.wait(),
            None => return HandlerResult::Error,
        };
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!("cgi: child exited with {}", status);
                conn.prepare_error_response(500);
                return HandlerResult::Done;
            }
            Err(e) => {
                error!("cgi: wait failed: {}", e);
                return HandlerResult::Error;
            }
        }

        debug!("cgi: child finished with {} byte(s)", self.output.len());
        self.build_response(conn);
        HandlerResult::Done
    }

    /// Split the collected output into header and body parts and assemble
    /// the final response. A `Status: CODE REASON` pseudo-header overrides
    /// the status code.
    fn build_response(&mut self, conn: &mut Connection) {
        conn.response.version = conn.http_version();
        conn.response.status = 200;

        let split = find_subslice(b"\r\n\r\n", &self.output)
            .map(|pos| (pos, 4))
            .or_else(|| find_subslice(b"\n\n", &self.output).map(|pos| (pos, 2)));

        let body = match split {
            Some((pos, sep)) => {
                let head = String::from_utf8_lossy(&self.output[..pos]).into_owned();
                for line in head.split('\n') {
                    let line = line.trim_end_matches('\r');
                    let colon = match line.find(':') {
                        Some(colon) => colon,
                        None => continue,
                    };
                    let name = line[..colon].trim();
                    let value = line[colon + 1..].trim();
                    if name.eq_ignore_ascii_case("Status") {
                        let mut tokens = value.splitn(2, ' ');
                        if let Some(code) = tokens.next().and_then(|tok| tok.parse::<u16>().ok()) {
                            conn.response.status = code;
                            conn.response.reason =
                                tokens.next().map(|reason| reason.trim().to_string());
                        }
                    } else {
                        conn.response.add_header(name, value);
                    }
                }
                self.output.split_off(pos + sep)
            }
            None => {
                // No header block at all: ship everything as plain text.
                conn.response.add_header("Content-Type", "text/plain");
                std::mem::take(&mut self.output)
            }
        };

        if conn.response.header("Content-Length").is_none() {
            conn.response
                .add_header("Content-Length", &body.len().to_string());
        }

        conn.write_buffer = conn.response.serialize_headers();
        conn.write_buffer.extend_from_slice(&body);
        conn.write_offset = 0;
    }

    /// Validate the script before execution: no `..` segments, resolves
    /// inside the declared CGI directory, regular file, executable, and an
    /// allowed extension. Returns the canonicalised path.
    fn preflight(&self) -> Option<PathBuf> {
        if self
            .script_path
            .components()
            .any(|c| c.as_os_str() == "..")
        {
            return None;
        }
        let script = fs::canonicalize(&self.script_path).ok()?;
        let root = fs::canonicalize(&self.cgi_root).ok()?;
        if !script.starts_with(&root) {
            return None;
        }
        let metadata = fs::metadata(&script).ok()?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            return None;
        }
        let extension = script.extension()?.to_str()?;
        if !ALLOWED_CGI_EXTENSIONS.contains(&extension) {
            return None;
        }
        Some(script)
    }

    fn build_environment(&self, conn: &Connection) -> Vec<(String, String)> {
        let request = &conn.request;
        let (uri_no_query, query_string) = match request.uri.find('?') {
            Some(pos) => (&request.uri[..pos], &request.uri[pos + 1..]),
            None => (request.uri.as_str(), ""),
        };

        let script_name = self.script_path.to_string_lossy().into_owned();
        let path_info = if uri_no_query.starts_with(script_name.as_str()) {
            let rest = &uri_no_query[script_name.len()..];
            if rest.is_empty() || rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            }
        } else {
            String::new()
        };

        let mut env = vec![
            (
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            ),
            ("REQUEST_METHOD".to_string(), request.method.clone()),
            ("REQUEST_URI".to_string(), request.uri.clone()),
            ("SERVER_PROTOCOL".to_string(), request.version.clone()),
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("SERVER_NAME".to_string(), self.server_name.clone()),
            ("SERVER_PORT".to_string(), self.server_port.to_string()),
            ("SCRIPT_NAME".to_string(), script_name),
            ("QUERY_STRING".to_string(), query_string.to_string()),
            ("PATH_INFO".to_string(), path_info),
        ];
        if let Some(content_type) = request.header("Content-Type") {
            env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
        }
        let content_length = match request.header("Content-Length") {
            Some(value) => value.to_string(),
            None => request.body.len().to_string(),
        };
        env.push(("CONTENT_LENGTH".to_string(), content_length));
        env
    }
}

impl Drop for CgiHandler {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            child.wait().ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::create_dir;

    use tempfile::tempdir;

    #[test]
    fn build_listing_body_works() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b name.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        create_dir(dir.path().join("sub")).unwrap();

        let body = build_listing_body(dir.path(), "/pub/").unwrap();
        assert!(body.contains("<title>Index of /pub/</title>"));
        assert!(body.contains("<li><a href=\"/pub/a.txt\">a.txt</a></li>"));
        assert!(body.contains("<li><a href=\"/pub/b%20name.txt\">b name.txt</a></li>"));
        assert!(body.contains("<li><a href=\"/pub/sub/\">sub/</a></li>"));

        // sorted by byte value
        let a = body.find("a.txt").unwrap();
        let b = body.find("b%20name.txt").unwrap();
        let sub = body.find("sub/").unwrap();
        assert!(a < b && b < sub);
    }

    #[test]
    fn build_listing_body_escapes_html() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("<evil>.txt"), b"x").unwrap();
        let body = build_listing_body(dir.path(), "/").unwrap();
        assert!(body.contains("&lt;evil&gt;.txt"));
        assert!(!body.contains("<evil>"));
    }

    fn make_handler(script: PathBuf, root: PathBuf) -> CgiHandler {
        CgiHandler::new(script, root, "127.0.0.1".to_string(), 8080)
    }

    #[test]
    fn cgi_preflight_accepts_executable_script_in_root() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("hello.sh");
        std::fs::write(&script, b"#!/bin/sh\necho hi\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let handler = make_handler(script.clone(), dir.path().to_path_buf());
        assert!(handler.preflight().is_some());
    }

    #[test]
    fn cgi_preflight_rejects_bad_scripts() {
        let dir = tempdir().unwrap();

        // not executable
        let script = dir.path().join("plain.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&script, perms).unwrap();
        assert!(make_handler(script, dir.path().to_path_buf())
            .preflight()
            .is_none());

        // wrong extension
        let script = dir.path().join("binary.bin");
        std::fs::write(&script, b"x").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        assert!(make_handler(script, dir.path().to_path_buf())
            .preflight()
            .is_none());

        // missing file
        assert!(
            make_handler(dir.path().join("absent.sh"), dir.path().to_path_buf())
                .preflight()
                .is_none()
        );

        // dotdot segment
        let nested = dir.path().join("sub");
        create_dir(&nested).unwrap();
        assert!(
            make_handler(nested.join("../absent.sh"), dir.path().to_path_buf())
                .preflight()
                .is_none()
        );
    }

    #[test]
    fn cgi_preflight_confines_to_root() {
        let outer = tempdir().unwrap();
        let root = outer.path().join("cgi");
        create_dir(&root).unwrap();

        let script = outer.path().join("escape.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        // executable and well-named, but outside the declared directory
        assert!(make_handler(script, root).preflight().is_none());
    }
}
