//! HTTP/1.1 connection state machine.
//!
//! One [`HttpConnection`] per accepted socket: a line-oriented incremental
//! parser over a fixed read buffer, URL dispatch against the document root
//! (including the login/registration endpoints), and a scatter-gather
//! response writer that pairs the header buffer with a read-only file
//! mapping.

mod connection;

pub use connection::{HttpConnection, BUSY_RESPONSE, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};

/// Readiness notification style for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrigMode {
    /// Level-triggered: the kernel reports readiness until it is consumed.
    Level,
    /// Edge-triggered: readiness is reported once; drain until `EAGAIN`.
    Edge,
}

/// Request method. Only `GET` and `POST` are served; the rest exist so the
/// parser can name what it rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST` (marks the request as carrying a body to consume)
    Post,
    /// `HEAD`
    Head,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `TRACE`
    Trace,
    /// `OPTIONS`
    Options,
    /// `CONNECT`
    Connect,
    /// `PATCH`
    Patch,
}

/// Outcome of a parse pass over the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete; keep reading.
    NoRequest,
    /// A full request was parsed.
    GetRequest,
    /// Malformed request (or the target is a directory).
    BadRequest,
    /// Target file does not exist.
    NoResource,
    /// Target file is not world-readable.
    ForbiddenRequest,
    /// Target file resolved and mapped; respond with its contents.
    FileRequest,
    /// Server-side failure while assembling the response.
    InternalError,
}

/// What the caller should do with the connection after `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Need more request bytes: re-arm for read.
    AwaitRead,
    /// A response is staged: re-arm for write.
    AwaitWrite,
    /// Unrecoverable connection state: close it.
    Close,
}

/// What the caller should do with the connection after `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The kernel buffer filled up: re-arm for write and come back.
    Blocked,
    /// Response fully sent and the client asked to linger: the connection
    /// was reset for the next request, re-arm for read.
    KeepAlive,
    /// Response fully sent on a close-mode connection, or the peer is
    /// gone: close it.
    Close,
}
