//! File helpers: MIME guessing, open + size, Range parsing, and the
//! non-blocking byte pump that streams file bodies to a socket.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::sendfile::sendfile;
use once_cell::sync::Lazy;

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js",
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html; charset=utf-8  html htm",
    "text/plain; charset=utf-8  txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/mp4               mp4",
];

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    fn parse_default_extension_map() -> MimeMap {
        let mut mime_map = MimeMap {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }

    /// Add one `mimetype ext ext...` line. The mimetype may carry a
    /// `; charset=` suffix, in which case the split is on double space.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line.splitn(2, "  ");
        let mimetype = match fields.next() {
            Some(mimetype) if !mimetype.is_empty() => mimetype,
            _ => return,
        };
        for extension in fields.next().unwrap_or("").split_whitespace() {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Get content type for a path.
    pub fn content_type(&self, path: &str) -> &str {
        path.rsplit('.')
            .next()
            .and_then(|extension| self.mimetypes.get(extension))
            .unwrap_or(&self.default_mimetype)
    }
}

static MIME_MAP: Lazy<MimeMap> = Lazy::new(MimeMap::parse_default_extension_map);

/// Guess the content type of a path from its extension.
pub fn content_type(path: &str) -> &'static str {
    Lazy::force(&MIME_MAP).content_type(path)
}

/// An open file plus the size it had when opened.
#[derive(Debug)]
pub struct FileInfo {
    pub file: File,
    pub size: libc::off_t,
}

/// Open a file for reading and record its size.
pub fn open_file(path: &Path) -> io::Result<FileInfo> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "not a regular file",
        ));
    }
    Ok(FileInfo {
        file,
        size: metadata.len() as libc::off_t,
    })
}

/// Parse a single `bytes=start-end` range spec against a file size.
/// Returns the inclusive `(start, end)` pair, or `None` when the header is
/// unsatisfiable or malformed (the caller answers 416).
pub fn parse_range(header: &str, file_size: libc::off_t) -> Option<(libc::off_t, libc::off_t)> {
    let spec = header.strip_prefix("bytes=")?;
    let dash = spec.find('-')?;
    let first = &spec[..dash];
    let second = &spec[dash + 1..];

    if first.is_empty() {
        // -N: the last N bytes
        let suffix: libc::off_t = second.parse().ok()?;
        if suffix <= 0 {
            return None;
        }
        let suffix = suffix.min(file_size);
        return Some((file_size - suffix, file_size - 1));
    }

    let start: libc::off_t = first.parse().ok()?;
    let end: libc::off_t = if second.is_empty() {
        file_size - 1
    } else {
        second.parse().ok()?
    };

    if file_size > 0 && start >= file_size {
        return None;
    }
    if end < start {
        return None;
    }
    let end = end.min(file_size - 1);
    if end < start {
        // only possible for an empty file
        return None;
    }
    Some((start, end))
}

/// Outcome of one pump pass.
#[derive(Debug, PartialEq)]
pub enum PumpProgress {
    /// Everything up to `max_offset` has been handed to the socket.
    Complete,
    /// The socket stopped accepting bytes; call again on the next
    /// writable event.
    Again,
}

// Cap each sendfile call so a single connection cannot monopolise the loop.
const SENDFILE_CHUNK: usize = 1 << 20;

/// Send file bytes `[*offset, max_offset)` to a socket with `sendfile`,
/// advancing `offset` as bytes go out.
pub fn send_from_file(
    sock: RawFd,
    file: RawFd,
    offset: &mut libc::off_t,
    max_offset: libc::off_t,
) -> nix::Result<PumpProgress> {
    while *offset < max_offset {
        let remaining = (max_offset - *offset) as usize;
        let count = remaining.min(SENDFILE_CHUNK);
        match sendfile(sock, file, Some(offset), count) {
            Ok(0) => break,
            Ok(_) => {}
            Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(PumpProgress::Again),
            Err(e) => return Err(e),
        }
    }
    Ok(if *offset >= max_offset {
        PumpProgress::Complete
    } else {
        PumpProgress::Again
    })
}
