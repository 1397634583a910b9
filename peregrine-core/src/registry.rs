//! Epoll registration policy.
//!
//! [`EventRegistry`] wraps the epoll set and encodes the one policy every
//! caller must agree on: connection sockets are registered with
//! `EPOLLRDHUP | EPOLLONESHOT` (plus `EPOLLET` in edge-triggered mode) and
//! must be re-armed after each handled event. Workers re-arm through the
//! same registry the reactor waits on; `epoll_ctl` is thread-safe, so the
//! registry is shared behind an `Arc` without extra locking.

use std::os::fd::BorrowedFd;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::CoreResult;
use crate::http::TrigMode;

/// Which readiness a connection waits for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wait for the socket to become readable.
    Read,
    /// Wait for the socket to become writable.
    Write,
}

/// Shared epoll set with the server's registration policy baked in.
pub struct EventRegistry {
    epoll: Epoll,
    conn_mode: TrigMode,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("conn_mode", &self.conn_mode)
            .finish_non_exhaustive()
    }
}

impl EventRegistry {
    /// Create the epoll set. `conn_mode` applies to connection sockets;
    /// the listener passes its own mode explicitly.
    pub fn new(conn_mode: TrigMode) -> CoreResult<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            conn_mode,
        })
    }

    fn edge(mode: TrigMode) -> EpollFlags {
        match mode {
            TrigMode::Edge => EpollFlags::EPOLLET,
            TrigMode::Level => EpollFlags::empty(),
        }
    }

    /// Register an always-armed read source (signal pipe, completion pipe).
    pub fn watch_source(&self, fd: BorrowedFd<'_>, token: u64) -> CoreResult<()> {
        let flags = EpollFlags::EPOLLIN;
        self.epoll.add(fd, EpollEvent::new(flags, token))?;
        Ok(())
    }

    /// Register the listening socket in `mode`, without one-shot.
    pub fn watch_listener(&self, fd: BorrowedFd<'_>, mode: TrigMode, token: u64) -> CoreResult<()> {
        let flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | Self::edge(mode);
        self.epoll.add(fd, EpollEvent::new(flags, token))?;
        Ok(())
    }

    /// Register a connection socket: read interest, peer-hangup
    /// notification, one-shot.
    pub fn watch_connection(&self, fd: BorrowedFd<'_>, token: u64) -> CoreResult<()> {
        let flags = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLRDHUP
            | EpollFlags::EPOLLONESHOT
            | Self::edge(self.conn_mode);
        self.epoll.add(fd, EpollEvent::new(flags, token))?;
        Ok(())
    }

    /// Re-arm a one-shot connection for its next event.
    pub fn rearm(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> CoreResult<()> {
        let readiness = match interest {
            Interest::Read => EpollFlags::EPOLLIN,
            Interest::Write => EpollFlags::EPOLLOUT,
        };
        let flags = readiness
            | EpollFlags::EPOLLRDHUP
            | EpollFlags::EPOLLONESHOT
            | Self::edge(self.conn_mode);
        let mut event = EpollEvent::new(flags, token);
        self.epoll.modify(fd, &mut event)?;
        Ok(())
    }

    /// Drop a descriptor from the epoll set.
    pub fn remove(&self, fd: BorrowedFd<'_>) -> CoreResult<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Block until at least one event is ready. `EINTR` is surfaced so the
    /// caller can re-enter after a signal.
    pub fn wait(&self, events: &mut [EpollEvent]) -> nix::Result<usize> {
        self.epoll.wait(events, EpollTimeout::NONE)
    }
}
