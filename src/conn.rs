//! Per-connection state machine: buffer management, header boundary
//! detection, request validation, handler dispatch and error synthesis.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use chrono::Utc;
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};

use crate::config::{Location, Server};
use crate::fileutil;
use crate::handlers::{
    AutoindexHandler, CgiHandler, FileHandler, Handler, HandlerResult, RedirectHandler,
};
use crate::http::{find_subslice, reason_phrase, HttpDate, Method, Request, Response};
use crate::uri::Uri;

// Reject the request once the header region grows past this many bytes.
const MAX_HEADER_BYTES: usize = 8192;
// Request targets longer than this are answered with 414.
const MAX_URI_LENGTH: usize = 4096;

const RECV_CHUNK: usize = 4096;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Connection lifecycle states. Transitions are driven by readiness events
/// and the post-event dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading until the header terminator (and the advertised body) have
    /// arrived.
    ReadingHeaders,
    /// Headers complete; the dispatch pass will build a response.
    Dispatching,
    /// A handler is active and waiting for more readiness events.
    RunningHandler,
    /// Draining the write buffer.
    Writing,
    /// Terminal; the socket is about to close.
    Done,
}

#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// Keep the connection; more events will follow.
    Continue,
    /// EOF or error; close the connection.
    Close,
}

#[derive(Debug, PartialEq)]
pub enum WriteOutcome {
    /// The socket stopped accepting bytes or a handler still has work.
    Again,
    /// The response is fully sent.
    Complete,
    /// Unrecoverable error; close.
    Error,
}

#[derive(Debug, PartialEq)]
pub enum DispatchOutcome {
    /// The advertised body has not fully arrived yet.
    NeedMoreBody,
    /// A response (or active handler) is in place; arm write interest.
    Ready,
}

pub struct Connection {
    pub socket: TcpStream,
    pub client: IpAddr,
    pub listener_fd: RawFd,
    pub state: ConnState,
    pub read_buffer: Vec<u8>,
    pub write_buffer: Vec<u8>,
    pub write_offset: usize,
    pub headers_end: Option<usize>,
    pub request: Request,
    pub response: Response,
    pub handler: Option<Handler>,
    pub total_sent: u64,
    parsed: bool,
    error_pages: HashMap<u16, String>,
    error_root: String,
}

impl Connection {
    pub fn new(socket: TcpStream, client: IpAddr, listener_fd: RawFd) -> Connection {
        Connection {
            socket,
            client,
            listener_fd,
            state: ConnState::ReadingHeaders,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            write_offset: 0,
            headers_end: None,
            request: Request::default(),
            response: Response::new(),
            handler: None,
            total_sent: 0,
            parsed: false,
            error_pages: HashMap::new(),
            error_root: String::new(),
        }
    }

    /// The version echoed on responses: the request's own when it is
    /// HTTP/1.0 or HTTP/1.1, otherwise HTTP/1.1.
    pub fn http_version(&self) -> String {
        match self.request.version.as_str() {
            "HTTP/1.0" | "HTTP/1.1" => self.request.version.clone(),
            _ => "HTTP/1.1".to_string(),
        }
    }

    /// Drain the socket into the read buffer until it would block. Finding
    /// the header terminator moves the state machine to `Dispatching`; an
    /// oversized header region prepares a 413 and moves to `Writing`.
    pub fn handle_read(&mut self) -> ReadOutcome {
        loop {
            let mut buf = [0u8; RECV_CHUNK];
            let received = match socket::recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty())
            {
                Ok(0) => {
                    info!("client {} disconnected", self.client);
                    return ReadOutcome::Close;
                }
                Ok(received) => received,
                Err(nix::Error::Sys(Errno::EAGAIN)) => break,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    debug!("recv failed for {}: {}", self.client, e);
                    return ReadOutcome::Close;
                }
            };
            self.read_buffer.extend_from_slice(&buf[..received]);

            if self.headers_end.is_none() {
                if let Some(pos) = find_subslice(HEADER_TERMINATOR, &self.read_buffer) {
                    self.headers_end = Some(pos);
                } else if self.read_buffer.len() > MAX_HEADER_BYTES {
                    self.prepare_error_response(413);
                    self.state = ConnState::Writing;
                    return ReadOutcome::Continue;
                }
            }
        }

        if self.headers_end.is_some() && self.state == ConnState::ReadingHeaders {
            self.state = ConnState::Dispatching;
        }
        ReadOutcome::Continue
    }

    /// Drain the write buffer; once it is empty, give any active handler a
    /// chance to produce more bytes.
    pub fn handle_write(&mut self) -> WriteOutcome {
        loop {
            while self.write_offset < self.write_buffer.len() {
                let sent = match socket::send(
                    self.socket.as_raw_fd(),
                    &self.write_buffer[self.write_offset..],
                    MsgFlags::empty(),
                ) {
                    Ok(sent) if sent > 0 => sent,
                    Ok(_) => return WriteOutcome::Error,
                    Err(nix::Error::Sys(Errno::EAGAIN)) => return WriteOutcome::Again,
                    Err(nix::Error::Sys(Errno::EINTR)) => continue,
                    Err(e) => {
                        debug!("send failed for {}: {}", self.client, e);
                        return WriteOutcome::Error;
                    }
                };
                self.write_offset += sent;
                self.total_sent += sent as u64;
            }

            match self.handler.take() {
                None => {
                    self.state = ConnState::Done;
                    return WriteOutcome::Complete;
                }
                Some(mut handler) => match handler.resume(self) {
                    HandlerResult::WouldBlock => {
                        self.handler = Some(handler);
                        return WriteOutcome::Again;
                    }
                    // The handler may have appended to the write buffer;
                    // loop around to drain it.
                    HandlerResult::Done => continue,
                    HandlerResult::Error => return WriteOutcome::Error,
                },
            }
        }
    }

    /// Re-enter the active handler because its monitored descriptor (the
    /// CGI output pipe) became readable. Returns true when the response is
    /// now ready and write interest should be armed.
    pub fn on_handler_readable(&mut self) -> bool {
        match self.handler.take() {
            None => true,
            Some(mut handler) => match handler.resume(self) {
                HandlerResult::WouldBlock => {
                    self.handler = Some(handler);
                    false
                }
                HandlerResult::Done => {
                    self.state = ConnState::Writing;
                    true
                }
                HandlerResult::Error => {
                    self.prepare_error_response(500);
                    self.state = ConnState::Writing;
                    true
                }
            },
        }
    }

    /// Deadline of the active handler, if it has one.
    pub fn handler_deadline(&self) -> Option<i64> {
        self.handler.as_ref().and_then(Handler::deadline)
    }

    /// Tear down an overdue handler and answer 504.
    pub fn abort_handler_timeout(&mut self) {
        info!("handler deadline expired for {}", self.client);
        self.handler = None;
        self.prepare_error_response(504);
        self.state = ConnState::Writing;
    }

    /// Headers are complete: parse, validate, pick a handler and run its
    /// `start`. Everything that goes wrong turns into an error response and
    /// `Ready`; only a still-incomplete body defers.
    pub fn dispatch(&mut self, server: &Server) -> DispatchOutcome {
        let headers_end = match self.headers_end {
            Some(pos) => pos,
            None => {
                self.prepare_error_response(500);
                self.state = ConnState::Writing;
                return DispatchOutcome::Ready;
            }
        };

        if !self.parsed {
            self.error_pages = server.error_page.clone();
            self.error_root = server.root.clone();
            match Request::parse(&self.read_buffer, headers_end) {
                Some(request) => {
                    self.request = request;
                    self.parsed = true;
                }
                None => {
                    info!("malformed request from {}", self.client);
                    return self.fail(400);
                }
            }
            debug!(
                "request from {}: {} {}",
                self.client, self.request.method, self.request.uri
            );
        }

        if self.request.uri.len() > MAX_URI_LENGTH {
            return self.fail(414);
        }
        let uri = match Uri::parse(&self.request.uri) {
            Some(uri) => uri,
            None => return self.fail(400),
        };
        let path = uri.decoded_path();

        let location = server.match_location(&path);
        self.error_pages = location.error_page.clone();
        self.error_root = location.root.clone();

        if !matches!(self.request.version.as_str(), "HTTP/1.0" | "HTTP/1.1") {
            return self.fail(505);
        }
        let method = match Method::from_token(&self.request.method) {
            Some(method) => method,
            None => return self.fail(501),
        };
        if !location.allow_methods.contains(&method) {
            let allow = location
                .allow_methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            self.response.add_header("Allow", &allow);
            return self.fail(405);
        }

        let content_length = match self.request.header("Content-Length") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(length) => length,
                Err(_) => return self.fail(400),
            },
            None => 0,
        };
        if server.max_request_body > 0 && content_length > server.max_request_body {
            return self.fail(413);
        }
        let body_start = headers_end + HEADER_TERMINATOR.len();
        if self.read_buffer.len().saturating_sub(body_start) < content_length {
            // wait for the rest of the advertised body
            self.state = ConnState::ReadingHeaders;
            return DispatchOutcome::NeedMoreBody;
        }
        self.request.body = self.read_buffer[body_start..body_start + content_length].to_vec();

        if let Some((code, target)) = location.redirect.clone() {
            return self.execute(Handler::Redirect(RedirectHandler::new(code, target)));
        }

        if location.cgi {
            let (resolved, is_directory) = match self.resolve_path(&location, &uri) {
                Some(result) => result,
                None => return DispatchOutcome::Ready,
            };
            if is_directory {
                return self.fail(403);
            }
            let handler = CgiHandler::new(
                PathBuf::from(resolved),
                PathBuf::from(location.root.clone()),
                server.host.to_string(),
                server.port,
            );
            return self.execute(Handler::Cgi(handler));
        }

        let (resolved, is_directory) = match self.resolve_path(&location, &uri) {
            Some(result) => result,
            None => return DispatchOutcome::Ready,
        };

        if is_directory {
            if !location.autoindex {
                return self.fail(403);
            }
            let mut display = path;
            if !display.starts_with('/') {
                display.insert(0, '/');
            }
            if !display.ends_with('/') {
                display.push('/');
            }
            let handler = AutoindexHandler::new(PathBuf::from(resolved), display, method);
            return self.execute(Handler::Autoindex(handler));
        }

        self.execute(Handler::File(FileHandler::new(
            PathBuf::from(resolved),
            method,
        )))
    }

    fn execute(&mut self, mut handler: Handler) -> DispatchOutcome {
        match handler.start(self) {
            HandlerResult::Done => self.state = ConnState::Writing,
            HandlerResult::WouldBlock => {
                self.handler = Some(handler);
                self.state = ConnState::RunningHandler;
            }
            HandlerResult::Error => {
                self.prepare_error_response(500);
                self.state = ConnState::Writing;
            }
        }
        DispatchOutcome::Ready
    }

    fn fail(&mut self, status: u16) -> DispatchOutcome {
        self.prepare_error_response(status);
        self.state = ConnState::Writing;
        DispatchOutcome::Ready
    }

    /// Map the decoded request path to a filesystem path: reject traversal,
    /// strip the location prefix, join with the effective root, and probe
    /// index files for directories. Returns the path and whether it is an
    /// unresolved directory; `None` means an error response was prepared.
    fn resolve_path(&mut self, location: &Location, uri: &Uri) -> Option<(String, bool)> {
        if uri.has_path_traversal() {
            info!("path traversal attempt blocked: {}", self.request.uri);
            self.fail(403);
            return None;
        }
        let decoded = uri.decoded_path();

        let mut rel = decoded;
        if location.path != "/" && rel.starts_with(&location.path) {
            rel = rel[location.path.len()..].to_string();
            if rel.is_empty() {
                rel = "/".to_string();
            }
        }

        if location.root.is_empty() {
            self.fail(500);
            return None;
        }
        let mut path = join_root_rel(&location.root, &rel);

        let mut is_directory = false;
        if let Ok(metadata) = fs::metadata(&path) {
            if metadata.is_dir() {
                is_directory = true;
                if !path.ends_with('/') {
                    path.push('/');
                }
            }
        }

        if is_directory || path.ends_with('/') {
            for index in &location.index {
                let candidate = format!("{}{}", path, index);
                if fs::metadata(&candidate)
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    return Some((candidate, false));
                }
            }
            return Some((path, true));
        }

        Some((path, false))
    }

    /// Build an error response: the configured error page for the status if
    /// one exists and is readable, else the built-in HTML body. Headers
    /// already staged on the response (Allow, Content-Range) survive.
    pub fn prepare_error_response(&mut self, status: u16) {
        self.response.version = self.http_version();
        self.response.status = status;

        let page = self
            .error_pages
            .get(&status)
            .map(|p| join_root_rel(&self.error_root, p))
            .and_then(|path| fs::read(&path).ok().map(|data| (path, data)));

        let (content_type, body) = match page {
            Some((path, data)) => (fileutil::content_type(&path).to_string(), data),
            None => {
                let title = format!("{} {}", status, reason_phrase(status));
                let body = format!(
                    "<html><head><title>{}</title></head>\
                     <body><center><h1>{}</h1></center></body></html>",
                    title, title
                );
                ("text/html; charset=utf-8".to_string(), body.into_bytes())
            }
        };

        if self.response.header("Date").is_none() {
            let date = HttpDate(Utc::now().timestamp()).to_string();
            self.response.add_header("Date", &date);
        }
        self.response.add_header("Content-Type", &content_type);
        self.response
            .add_header("Content-Length", &body.len().to_string());
        self.response.body = body;
        self.write_buffer = self.response.serialize();
        self.write_offset = 0;
    }
}

/// Join the document root and a request-relative path with exactly one `/`
/// at the junction.
fn join_root_rel(root: &str, rel: &str) -> String {
    if root.ends_with('/') && rel.starts_with('/') {
        format!("{}{}", root, &rel[1..])
    } else if !root.ends_with('/') && !rel.starts_with('/') {
        format!("{}/{}", root, rel)
    } else {
        format!("{}{}", root, rel)
    }
}
