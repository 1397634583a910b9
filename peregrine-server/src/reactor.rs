//! Listener, epoll loop, and connection lifecycle.
//!
//! One thread runs [`Reactor::run`]: it accepts sockets, waits for
//! readiness, dispatches work to the pool (or performs the I/O itself in
//! Proactor mode), drains the signal pipe, and reaps idle connections on
//! every alarm tick. Workers hand closures back through the completion
//! board; the timer list and the connection table are touched by this
//! thread only.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{EpollEvent, EpollFlags};
use nix::unistd::{alarm, pipe2, read};
use socket2::{Domain, Socket, Type};
use tracing::{debug, error, info, warn};

use peregrine_core::http::BUSY_RESPONSE;
use peregrine_core::{
    ActorModel, ClientConn, CompletionBoard, EventRegistry, HttpConnection, Interest, PeerInfo,
    Phase, SendOutcome, TimerKey, TimerList, TrigMode, WorkerPool,
};

use crate::config::ServerConfig;
use crate::signals;

/// Most connections the server will carry at once.
pub const MAX_FD: usize = 65536;
/// Epoll events handled per wait.
pub const MAX_EVENT_NUMBER: usize = 10000;
/// Alarm period in seconds; connections idle for three periods are reaped.
pub const TIMESLOT: u32 = 5;

const LISTENER_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const COMPLETION_TOKEN: u64 = u64::MAX - 2;

struct ConnEntry {
    conn: Arc<ClientConn>,
    timer: TimerKey,
}

/// The event loop and everything it owns.
pub struct Reactor {
    config: ServerConfig,
    registry: Arc<EventRegistry>,
    workers: WorkerPool,
    completions: Arc<CompletionBoard>,
    listener: TcpListener,
    signal_rd: OwnedFd,
    timers: TimerList,
    connections: HashMap<RawFd, ConnEntry>,
    doc_root: Arc<PathBuf>,
}

impl Reactor {
    /// Bind the listener, install the signal plumbing, and register the
    /// standing event sources.
    pub fn new(
        config: ServerConfig,
        registry: Arc<EventRegistry>,
        workers: WorkerPool,
        completions: Arc<CompletionBoard>,
    ) -> anyhow::Result<Self> {
        let listener = build_listener(config.port, config.opt_linger)?;

        let (signal_rd, signal_wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .context("failed to create the signal pipe")?;
        signals::install(signal_wr.as_raw_fd()).context("failed to install signal handlers")?;
        // The write end is held for the process lifetime by the handler.
        std::mem::forget(signal_wr);

        registry.watch_listener(listener.as_fd(), config.listen_mode, LISTENER_TOKEN)?;
        registry.watch_source(signal_rd.as_fd(), SIGNAL_TOKEN)?;
        registry.watch_source(completions.wakeup_fd(), COMPLETION_TOKEN)?;

        alarm::set(TIMESLOT);

        let doc_root = Arc::new(config.doc_root.clone());
        Ok(Self {
            config,
            registry,
            workers,
            completions,
            listener,
            signal_rd,
            timers: TimerList::new(),
            connections: HashMap::new(),
            doc_root,
        })
    }

    /// Run until SIGTERM. Per-connection failures never leave this loop;
    /// they end at the connection they belong to.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("server started on port {}", self.config.port);
        let mut events = vec![EpollEvent::empty(); MAX_EVENT_NUMBER];
        let mut timeout = false;
        let mut stop_server = false;

        while !stop_server {
            let ready = match self.registry.wait(&mut events) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!("epoll wait failed: {err}");
                    break;
                }
            };

            for event in &events[..ready] {
                let token = event.data();
                let flags = event.events();
                match token {
                    LISTENER_TOKEN => self.accept_clients(),
                    SIGNAL_TOKEN => self.drain_signals(&mut timeout, &mut stop_server),
                    COMPLETION_TOKEN => self.drain_completions(),
                    _ => {
                        let fd = token as RawFd;
                        if flags.intersects(
                            EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                        ) {
                            // Peer went away; drop the timer with the socket.
                            self.deal_timer(fd);
                        } else if flags.contains(EpollFlags::EPOLLIN) {
                            self.handle_readable(fd);
                        } else if flags.contains(EpollFlags::EPOLLOUT) {
                            self.handle_writable(fd);
                        }
                    }
                }
            }

            if timeout {
                self.tick();
                alarm::set(TIMESLOT);
                timeout = false;
            }
        }

        info!("server stop");
        Ok(())
    }

    // ---- acceptance ----------------------------------------------------

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.connections.len() >= MAX_FD {
                        warn!("connection limit reached, refusing {addr}");
                        refuse(stream);
                    } else {
                        self.register_client(stream, addr);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
            // Level-triggered listeners take one accept per notification.
            if self.config.listen_mode == TrigMode::Level {
                break;
            }
        }
    }

    fn register_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("failed to set {addr} nonblocking: {e}");
            return;
        }
        let http = HttpConnection::new(
            stream,
            addr,
            self.config.conn_mode,
            Arc::clone(&self.doc_root),
        );
        let conn = Arc::new(ClientConn::new(http));
        let fd = conn.fd();

        let timer = self.timers.add(unix_now() + 3 * u64::from(TIMESLOT), PeerInfo { fd, addr });
        self.connections.insert(
            fd,
            ConnEntry {
                conn: Arc::clone(&conn),
                timer,
            },
        );

        let armed = {
            let http = conn.http.lock();
            self.registry.watch_connection(http.as_fd(), fd as u64)
        };
        if let Err(err) = armed {
            warn!("failed to register {addr} with epoll: {err}");
            self.connections.remove(&fd);
            self.timers.remove(timer);
            return;
        }
        debug!(
            "accepted connection from {addr} ({} clients)",
            self.connections.len()
        );
    }

    // ---- readiness dispatch --------------------------------------------

    fn handle_readable(&mut self, fd: RawFd) {
        let Some(entry) = self.connections.get(&fd) else {
            return;
        };
        let conn = Arc::clone(&entry.conn);

        match self.workers.model() {
            ActorModel::Reactor => {
                self.adjust_timer(fd);
                if !self.workers.dispatch(conn, Phase::Read) {
                    self.overloaded(fd);
                }
            }
            ActorModel::Proactor => {
                let ok = conn.http.lock().read_once();
                if ok {
                    self.adjust_timer(fd);
                    if !self.workers.dispatch_completed(conn) {
                        self.overloaded(fd);
                    }
                } else {
                    self.deal_timer(fd);
                }
            }
        }
    }

    fn handle_writable(&mut self, fd: RawFd) {
        let Some(entry) = self.connections.get(&fd) else {
            return;
        };
        let conn = Arc::clone(&entry.conn);

        match self.workers.model() {
            ActorModel::Reactor => {
                self.adjust_timer(fd);
                if !self.workers.dispatch(conn, Phase::Write) {
                    self.overloaded(fd);
                }
            }
            ActorModel::Proactor => {
                let outcome = conn.http.lock().write();
                match outcome {
                    SendOutcome::Blocked => {
                        self.rearm(&conn, Interest::Write);
                        self.adjust_timer(fd);
                    }
                    SendOutcome::KeepAlive => {
                        self.rearm(&conn, Interest::Read);
                        self.adjust_timer(fd);
                    }
                    SendOutcome::Close => self.deal_timer(fd),
                }
            }
        }
    }

    fn rearm(&self, conn: &Arc<ClientConn>, interest: Interest) {
        let http = conn.http.lock();
        if let Err(err) = self.registry.rearm(http.as_fd(), interest, conn.fd() as u64) {
            debug!("re-arm of fd {} failed: {err}", conn.fd());
        }
    }

    /// Back-pressure: the worker queue is full. Answer 500 and close
    /// rather than park the connection forever.
    fn overloaded(&mut self, fd: RawFd) {
        warn!("worker queue full, shedding fd {fd}");
        if let Some(entry) = self.connections.get(&fd) {
            entry.conn.http.lock().reject_busy();
        }
        self.deal_timer(fd);
    }

    // ---- signals, completions, timers ----------------------------------

    fn drain_signals(&mut self, timeout: &mut bool, stop_server: &mut bool) {
        let mut buf = [0u8; 1024];
        loop {
            match read(&self.signal_rd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &sig in &buf[..n] {
                        if i32::from(sig) == libc::SIGALRM {
                            *timeout = true;
                        } else if i32::from(sig) == libc::SIGTERM {
                            info!("SIGTERM received, shutting down");
                            *stop_server = true;
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("signal pipe read failed: {err}");
                    break;
                }
            }
        }
    }

    fn drain_completions(&mut self) {
        for fd in self.completions.drain() {
            let close = self
                .connections
                .get(&fd)
                .is_some_and(|entry| entry.conn.close_requested());
            if close {
                self.deal_timer(fd);
            }
        }
    }

    fn adjust_timer(&mut self, fd: RawFd) {
        if let Some(entry) = self.connections.get(&fd) {
            self.timers
                .adjust(entry.timer, unix_now() + 3 * u64::from(TIMESLOT));
        }
    }

    /// Remove the connection's timer and close it.
    fn deal_timer(&mut self, fd: RawFd) {
        let Some(entry) = self.connections.remove(&fd) else {
            return;
        };
        self.timers.remove(entry.timer);
        let http = entry.conn.http.lock();
        if let Err(err) = self.registry.remove(http.as_fd()) {
            debug!("epoll removal of fd {fd} failed: {err}");
        }
        info!(
            "closing connection from {} ({} clients left)",
            http.peer(),
            self.connections.len()
        );
        // The socket itself closes when the last Arc drops.
    }

    /// Reap every connection idle past its expiry.
    fn tick(&mut self) {
        let now = unix_now();
        let Self {
            timers,
            connections,
            registry,
            ..
        } = self;
        timers.tick(now, |client| {
            if let Some(entry) = connections.remove(&client.fd) {
                let http = entry.conn.http.lock();
                let _ = registry.remove(http.as_fd());
                info!("idle connection from {} timed out", client.addr);
            }
        });
        debug!("timer tick, {} connections alive", self.connections.len());
    }

    /// Live connection count, equal to the timer list population.
    pub fn client_count(&self) -> usize {
        self.connections.len()
    }
}

/// Send the canned overload reply and drop the socket.
fn refuse(mut stream: TcpStream) {
    let _ = stream.write_all(BUSY_RESPONSE.as_bytes());
}

fn build_listener(port: u16, opt_linger: bool) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    if opt_linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind 0.0.0.0:{port}"))?;
    socket.listen(5)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
