//! The event loop: listening sockets, epoll readiness dispatch, signal
//! handling through a signalfd, and connection lifecycle.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket;
use nix::unistd::close;

use crate::config::Server;
use crate::conn::{ConnState, Connection, DispatchOutcome, ReadOutcome, WriteOutcome};
use crate::fileutil::set_nonblocking;

const MAX_EVENTS: usize = 64;
const LISTEN_BACKLOG: usize = 128;

/// Owns the listening sockets and all live connections, keyed by
/// descriptor, and runs the readiness loop that drives them.
pub struct ServerManager {
    epoll_fd: RawFd,
    signal_fd: SignalFd,
    stop_requested: bool,
    listeners: HashMap<RawFd, Server>,
    connections: HashMap<RawFd, Connection>,
    // CGI output pipe -> owning connection
    pipe_watch: HashMap<RawFd, RawFd>,
}

impl ServerManager {
    /// Block SIGINT/SIGTERM, set up the signalfd that delivers them as
    /// readiness events, and create the epoll instance.
    pub fn new() -> Result<ServerManager> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().context("failed to block signals")?;

        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("failed to create signalfd")?;

        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("failed to create epoll instance")?;

        Ok(ServerManager {
            epoll_fd,
            signal_fd,
            stop_requested: false,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            pipe_watch: HashMap::new(),
        })
    }

    /// Create one listening socket per server. Duplicate listen tuples are
    /// a configuration error.
    pub fn init_servers(&mut self, servers: Vec<Server>) -> Result<()> {
        let mut seen: HashSet<(Ipv4Addr, u16)> = HashSet::new();
        for server in &servers {
            if !seen.insert((server.host, server.port)) {
                return Err(anyhow!(
                    "Duplicate listen address in configuration: {}:{}",
                    server.host,
                    server.port
                ));
            }
        }

        for server in servers {
            let fd = create_listener(&server)?;
            self.listeners.insert(fd, server);
        }
        info!("{} server(s) initialized", self.listeners.len());
        Ok(())
    }

    /// The main loop: wait for readiness, fan events out to the signalfd,
    /// listeners, CGI pipes and connections, then run the dispatch pass.
    pub fn run(&mut self) -> Result<()> {
        for &fd in self.listeners.keys() {
            let mut event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
            epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event)
                .context("failed to register listener with epoll")?;
        }
        let sfd = self.signal_fd.as_raw_fd();
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, sfd as u64);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, sfd, &mut event)
            .context("failed to register signalfd with epoll")?;

        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        info!("entering main event loop");

        while !self.stop_requested {
            let timeout = self.next_timeout_ms();
            let num_events = match epoll_wait(self.epoll_fd, &mut events, timeout) {
                Ok(num_events) => num_events,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => return Err(e).context("epoll_wait failed"),
            };

            for event in &events[..num_events] {
                let fd = event.data() as RawFd;
                let flags = event.events();

                if fd == self.signal_fd.as_raw_fd() {
                    self.drain_signals();
                } else if self.listeners.contains_key(&fd) {
                    self.accept_connections(fd);
                } else if self.pipe_watch.contains_key(&fd) {
                    self.handle_pipe_event(fd);
                } else {
                    self.handle_connection_event(fd, flags);
                }
            }

            self.expire_handlers();
            self.dispatch_pass();
        }

        info!("stop requested, exiting event loop");
        self.shutdown();
        Ok(())
    }

    /// Bound the wait by the nearest handler deadline, if any.
    fn next_timeout_ms(&self) -> isize {
        let next = self
            .connections
            .values()
            .filter_map(Connection::handler_deadline)
            .min();
        match next {
            Some(deadline) => {
                let now = Utc::now().timestamp();
                ((deadline - now).max(0) * 1000) as isize
            }
            None => -1,
        }
    }

    /// Read everything out of the signalfd; SIGINT/SIGTERM set the stop
    /// flag.
    fn drain_signals(&mut self) {
        loop {
            match self.signal_fd.read_signal() {
                Ok(Some(siginfo)) => {
                    if siginfo.ssi_signo == Signal::SIGINT as u32
                        || siginfo.ssi_signo == Signal::SIGTERM as u32
                    {
                        info!("termination signal received");
                        self.stop_requested = true;
                    } else {
                        debug!("ignoring signal {}", siginfo.ssi_signo);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to read signalfd: {}", e);
                    break;
                }
            }
        }
    }

    /// Accept until the listener would block, registering each new socket
    /// for edge-triggered reads.
    fn accept_connections(&mut self, listen_fd: RawFd) {
        loop {
            let fd = match socket::accept(listen_fd) {
                Ok(fd) => fd,
                Err(nix::Error::Sys(Errno::EAGAIN)) => break,
                Err(e) => {
                    if e.as_errno() == Some(Errno::EMFILE) || e.as_errno() == Some(Errno::ENFILE) {
                        warn!("accept failed: out of file descriptors");
                    } else {
                        warn!("accept failed: {}", e);
                    }
                    break;
                }
            };

            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            if let Err(e) = stream.set_nonblocking(true) {
                warn!("failed to set accepted socket non-blocking: {}", e);
                continue; // dropping the stream closes it
            }
            let client = stream
                .peer_addr()
                .map(|addr| addr.ip())
                .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));

            if let Err(e) = update_events(
                self.epoll_fd,
                fd,
                EpollFlags::EPOLLIN | EpollFlags::EPOLLET,
            ) {
                warn!("failed to register connection with epoll: {}", e);
                continue;
            }

            debug!("accepted connection from {} (fd {})", client, fd);
            self.connections
                .insert(fd, Connection::new(stream, client, listen_fd));
        }
    }

    /// The CGI output pipe of some connection became readable.
    fn handle_pipe_event(&mut self, pipe_fd: RawFd) {
        let conn_fd = match self.pipe_watch.get(&pipe_fd) {
            Some(&conn_fd) => conn_fd,
            None => return,
        };
        let ready = match self.connections.get_mut(&conn_fd) {
            Some(conn) => conn.on_handler_readable(),
            None => true,
        };
        if ready {
            // handler finished (or died); its pipe is closed already
            self.pipe_watch.remove(&pipe_fd);
            if self.connections.contains_key(&conn_fd) {
                update_events(
                    self.epoll_fd,
                    conn_fd,
                    EpollFlags::EPOLLOUT | EpollFlags::EPOLLET,
                )
                .ok();
            }
        }
    }

    fn handle_connection_event(&mut self, fd: RawFd, flags: EpollFlags) {
        let epoll_fd = self.epoll_fd;
        let mut should_close = false;
        let mut handler_active = false;

        if let Some(conn) = self.connections.get_mut(&fd) {
            if flags.contains(EpollFlags::EPOLLIN) && conn.state == ConnState::ReadingHeaders {
                match conn.handle_read() {
                    ReadOutcome::Close => should_close = true,
                    ReadOutcome::Continue => {
                        // an oversized header region answered 413 already
                        if conn.state == ConnState::Writing {
                            update_events(
                                epoll_fd,
                                fd,
                                EpollFlags::EPOLLOUT | EpollFlags::EPOLLET,
                            )
                            .ok();
                        }
                    }
                }
            }

            if !should_close
                && flags.contains(EpollFlags::EPOLLOUT)
                && matches!(conn.state, ConnState::Writing | ConnState::RunningHandler)
            {
                match conn.handle_write() {
                    WriteOutcome::Again => {}
                    WriteOutcome::Complete => should_close = true,
                    WriteOutcome::Error => should_close = true,
                }
            }

            if !should_close && flags.contains(EpollFlags::EPOLLERR) {
                should_close = true;
            }
            handler_active = conn.handler.is_some();
        }

        if should_close {
            self.close_connection(fd);
        } else if !handler_active {
            // A handler that finished on the write path closed its pipe;
            // drop any watch entry so a reused descriptor cannot be
            // misrouted.
            self.pipe_watch.retain(|_, &mut owner| owner != fd);
        }
    }

    /// Kill CGI children whose deadline has passed and answer 504.
    fn expire_handlers(&mut self) {
        let now = Utc::now().timestamp();
        let expired: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, conn)| matches!(conn.handler_deadline(), Some(deadline) if deadline <= now))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in expired {
            if let Some(conn) = self.connections.get_mut(&fd) {
                conn.abort_handler_timeout();
            }
            self.pipe_watch.retain(|_, &mut owner| owner != fd);
            update_events(
                self.epoll_fd,
                fd,
                EpollFlags::EPOLLOUT | EpollFlags::EPOLLET,
            )
            .ok();
        }
    }

    /// Walk connections whose headers are complete and whose response has
    /// not been prepared, and run the request through dispatch.
    fn dispatch_pass(&mut self) {
        let mut ready: Vec<(RawFd, Option<RawFd>)> = Vec::new();

        for (&fd, conn) in self.connections.iter_mut() {
            if conn.state != ConnState::Dispatching || !conn.write_buffer.is_empty() {
                continue;
            }
            match self.listeners.get(&conn.listener_fd) {
                Some(server) => {
                    if conn.dispatch(server) == DispatchOutcome::Ready {
                        let pipe = conn.handler.as_ref().and_then(|h| h.monitor_fd());
                        ready.push((fd, pipe));
                    }
                }
                None => {
                    conn.prepare_error_response(500);
                    conn.state = ConnState::Writing;
                    ready.push((fd, None));
                }
            }
        }

        for (fd, pipe) in ready {
            if let Some(pipe_fd) = pipe {
                match update_events(
                    self.epoll_fd,
                    pipe_fd,
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLET,
                ) {
                    Ok(()) => {
                        self.pipe_watch.insert(pipe_fd, fd);
                    }
                    Err(e) => warn!("failed to watch CGI pipe: {}", e),
                }
            }
            update_events(
                self.epoll_fd,
                fd,
                EpollFlags::EPOLLOUT | EpollFlags::EPOLLET,
            )
            .ok();
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            self.pipe_watch.retain(|_, &mut owner| owner != fd);
            log_connection(&conn);
            // dropping the connection closes the socket and releases any
            // handler resources
        }
    }

    /// Close every connection and listener and release the epoll instance.
    pub fn shutdown(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.close_connection(fd);
        }
        for (&fd, _) in self.listeners.iter() {
            close(fd).ok();
        }
        self.listeners.clear();
        if self.epoll_fd >= 0 {
            close(self.epoll_fd).ok();
            self.epoll_fd = -1;
        }
        info!("shutdown complete");
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Register or re-arm interest in a descriptor.
fn update_events(epoll_fd: RawFd, fd: RawFd, flags: EpollFlags) -> nix::Result<()> {
    let mut event = EpollEvent::new(flags, fd as u64);
    match epoll_ctl(epoll_fd, EpollOp::EpollCtlMod, fd, &mut event) {
        Err(nix::Error::Sys(Errno::ENOENT)) => {
            epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event)
        }
        other => other,
    }
}

/// Create, configure and start one listening socket.
fn create_listener(server: &Server) -> Result<RawFd> {
    let fd = socket::socket(
        socket::AddressFamily::Inet,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        socket::SockProtocol::Tcp,
    )
    .context("failed to create listening socket")?;

    let result = (|| -> Result<()> {
        socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true)
            .context("failed to set SO_REUSEADDR")?;
        let addr = SocketAddr::V4(SocketAddrV4::new(server.host, server.port));
        socket::bind(fd, &socket::SockAddr::Inet(socket::InetAddr::from_std(&addr)))
            .with_context(|| format!("failed to bind {}:{}", server.host, server.port))?;
        socket::listen(fd, LISTEN_BACKLOG)
            .with_context(|| format!("failed to listen on {}:{}", server.host, server.port))?;
        set_nonblocking(fd).context("failed to set listener non-blocking")?;
        info!("listening on http://{}:{}/", server.host, server.port);
        Ok(())
    })();

    if let Err(e) = result {
        close(fd).ok();
        return Err(e);
    }
    Ok(fd)
}

/// One access-log line per completed request.
fn log_connection(conn: &Connection) {
    if conn.request.method.is_empty() {
        return; // never parsed a request line
    }
    info!(
        "{} \"{} {} {}\" {} {}",
        conn.client,
        conn.request.method,
        conn.request.uri,
        conn.request.version,
        conn.response.status,
        conn.total_sent,
    );
}
