use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .expect("failed to bind probe socket")
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

/// A spawned server process bound to a scratch document root.
pub struct TestServer {
    _child: ScopedChild,
    pub port: u16,
    pub root: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    /// Start a server whose config is `server { listen ...; root ...;
    /// <server_extra> }` with `<global>` directives in front.
    pub fn start(global: &str, server_extra: &str) -> TestServer {
        let dir = tempdir().expect("failed to create scratch directory");
        let root = dir.path().join("www");
        fs::create_dir(&root).unwrap();

        let port = get_unused_port();
        let config = format!(
            "{}\nserver {{\n    listen 127.0.0.1:{};\n    root {};\n{}\n}}\n",
            global,
            port,
            root.display(),
            server_extra,
        );
        let config_path = dir.path().join("server.conf");
        fs::write(&config_path, config).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_minihttpd"))
            .arg(config_path.to_str().unwrap())
            .arg("-l:2")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn minihttpd");
        let server = TestServer {
            _child: ScopedChild(child),
            port,
            root,
            _dir: dir,
        };

        assert!(wait_for_port(port), "failed to connect to minihttpd");
        server
    }

    /// Send raw bytes and collect the full response (the server closes the
    /// connection after one exchange).
    pub fn request(&self, raw: &[u8]) -> RawResponse {
        let mut stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to minihttpd");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(raw).unwrap();

        let mut collected = Vec::new();
        stream
            .read_to_end(&mut collected)
            .expect("failed to read response");
        RawResponse::parse(collected)
    }

    pub fn get(&self, path: &str) -> RawResponse {
        self.request(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes())
    }
}

/// A response pulled off the wire, split into its parts.
pub struct RawResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    fn parse(raw: Vec<u8>) -> RawResponse {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("response has no header terminator");
        let head = String::from_utf8(raw[..split].to_vec()).expect("response head is not UTF-8");
        let body = raw[split + 4..].to_vec();

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers = lines
            .map(|line| {
                let colon = line.find(':').expect("header line has no colon");
                (
                    line[..colon].to_string(),
                    line[colon + 1..].trim().to_string(),
                )
            })
            .collect();

        RawResponse {
            status_line,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status line has no code")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
