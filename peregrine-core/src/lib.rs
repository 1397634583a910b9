//! # Peregrine Core
//!
//! Core library for the peregrine web server: the pieces the reactor binary
//! wires together.
//!
//! ## Overview
//!
//! - **Synchronization**: counting semaphore and bounded blocking queue
//! - **Log sink**: date- and line-rotated file sink behind `tracing`
//! - **Database**: fixed-size MySQL connection pool with scoped leases, and
//!   the in-memory user directory used by login/registration
//! - **Timers**: ascending idle-connection timer list with a tick reaper
//! - **HTTP**: per-connection HTTP/1.1 parse/build/send state machine
//! - **Workers**: bounded task queue with Proactor/Reactor dispatch
//!
//! ## Architecture
//!
//! The reactor thread owns the epoll set and the timer list; workers own
//! nothing but the task they were handed. Per-connection ordering is
//! guaranteed by `EPOLLONESHOT`: a connection is re-armed only after the
//! thread that processed it is done with it.

pub mod db;
pub mod error;
pub mod http;
pub mod logsink;
pub mod registry;
pub mod sync;
pub mod timer;
pub mod workers;

pub use db::{ConnectionPool, PoolOptions, PooledConn, UserDirectory};
pub use error::{CoreError, CoreResult};
pub use http::{HttpConnection, Method, NextStep, SendOutcome, TrigMode};
pub use registry::{EventRegistry, Interest};
pub use sync::{BoundedQueue, Semaphore};
pub use timer::{PeerInfo, TimerKey, TimerList};
pub use workers::{ActorModel, ClientConn, CompletionBoard, Phase, WorkerPool};
