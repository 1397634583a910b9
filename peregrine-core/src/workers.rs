//! Worker pool with actor-model-aware dispatch.
//!
//! The reactor hands connections to the pool through a bounded queue. In
//! Proactor mode the reactor has already done the socket I/O and workers
//! only run the state machine; in Reactor mode workers perform the read or
//! write themselves. Workers never touch the timer list: a connection that
//! must die gets its close flag set and its fd posted to the
//! [`CompletionBoard`], which the reactor drains from its epoll loop.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::fcntl::OFlag;
use nix::unistd::{pipe2, read, write};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::db::{ConnectionPool, UserDirectory};
use crate::error::{CoreError, CoreResult};
use crate::http::{HttpConnection, NextStep, SendOutcome};
use crate::registry::{EventRegistry, Interest};

/// Which side performs connection I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorModel {
    /// The reactor thread reads/writes; workers only process.
    Proactor,
    /// Workers read/write on readiness notifications.
    Reactor,
}

/// The I/O a Reactor-mode worker was dispatched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The socket became readable.
    Read,
    /// The socket became writable.
    Write,
}

/// A connection as shared between the reactor and the workers.
///
/// `EPOLLONESHOT` serializes use of the state machine, but the mutex keeps
/// the sharing sound even when the reactor closes a connection a queued
/// worker still holds.
#[derive(Debug)]
pub struct ClientConn {
    /// The state machine itself.
    pub http: Mutex<HttpConnection>,
    fd: RawFd,
    close_requested: AtomicBool,
}

impl ClientConn {
    /// Wrap a fresh connection.
    pub fn new(http: HttpConnection) -> Self {
        let fd = http.as_fd().as_raw_fd();
        Self {
            http: Mutex::new(http),
            fd,
            close_requested: AtomicBool::new(false),
        }
    }

    /// Raw descriptor, used as the epoll token and map key.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Mark the connection for closure by the reactor.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    /// Whether a worker flagged this connection for closure.
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }
}

/// Worker-to-reactor completion channel.
///
/// Workers post the fd of a connection that must be closed; the write end
/// of the pipe wakes the reactor out of `epoll_wait`. The pipe carries no
/// payload, only wakeups: the fds live in the mutexed list so nothing is
/// lost if the pipe fills.
#[derive(Debug)]
pub struct CompletionBoard {
    pending: Mutex<Vec<RawFd>>,
    rd: OwnedFd,
    wr: OwnedFd,
}

impl CompletionBoard {
    /// Create the board and its nonblocking wakeup pipe.
    pub fn new() -> CoreResult<Self> {
        let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            pending: Mutex::new(Vec::new()),
            rd,
            wr,
        })
    }

    /// Read end, for epoll registration.
    pub fn wakeup_fd(&self) -> BorrowedFd<'_> {
        self.rd.as_fd()
    }

    /// Post a connection for closure and wake the reactor.
    pub fn post(&self, fd: RawFd) {
        self.pending.lock().push(fd);
        // A full pipe just means a wakeup is already pending.
        let _ = write(&self.wr, &[1u8]);
    }

    /// Consume pending wakeups and take the posted fds.
    pub fn drain(&self) -> Vec<RawFd> {
        let mut sink = [0u8; 64];
        while matches!(read(&self.rd, &mut sink), Ok(n) if n > 0) {}
        std::mem::take(&mut *self.pending.lock())
    }
}

struct Task {
    conn: Arc<ClientConn>,
    /// `None` dispatches processing only (Proactor mode).
    phase: Option<Phase>,
}

struct QueueState {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

struct WorkerCtx {
    db: Arc<ConnectionPool>,
    users: Arc<UserDirectory>,
    registry: Arc<EventRegistry>,
    completions: Arc<CompletionBoard>,
    queue: Arc<TaskQueue>,
}

/// Fixed-size pool of worker threads over a bounded task queue.
pub struct WorkerPool {
    model: ActorModel,
    queue: Arc<TaskQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("model", &self.model)
            .field("workers", &self.workers.len())
            .field("capacity", &self.queue.capacity)
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `threads` workers sharing a queue of at most `backlog` tasks.
    pub fn new(
        model: ActorModel,
        db: Arc<ConnectionPool>,
        users: Arc<UserDirectory>,
        registry: Arc<EventRegistry>,
        completions: Arc<CompletionBoard>,
        threads: usize,
        backlog: usize,
    ) -> CoreResult<Self> {
        if threads == 0 {
            return Err(CoreError::InvalidCapacity {
                what: "thread count",
            });
        }
        if backlog == 0 {
            return Err(CoreError::InvalidCapacity {
                what: "task backlog",
            });
        }

        let queue = Arc::new(TaskQueue {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stop: false,
            }),
            ready: Condvar::new(),
            capacity: backlog,
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let ctx = WorkerCtx {
                db: Arc::clone(&db),
                users: Arc::clone(&users),
                registry: Arc::clone(&registry),
                completions: Arc::clone(&completions),
                queue: Arc::clone(&queue),
            };
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker_loop(&ctx))?;
            workers.push(handle);
        }
        debug!("worker pool started: {model:?}, {threads} threads, backlog {backlog}");

        Ok(Self {
            model,
            queue,
            workers,
        })
    }

    /// The dispatch model this pool was built for.
    pub fn model(&self) -> ActorModel {
        self.model
    }

    fn enqueue(&self, task: Task) -> bool {
        let mut state = self.queue.state.lock();
        if state.tasks.len() >= self.queue.capacity {
            return false;
        }
        state.tasks.push_back(task);
        drop(state);
        self.queue.ready.notify_one();
        true
    }

    /// Reactor-mode submission: the worker performs `phase` I/O first.
    /// Returns `false` when the queue is full.
    pub fn dispatch(&self, conn: Arc<ClientConn>, phase: Phase) -> bool {
        self.enqueue(Task {
            conn,
            phase: Some(phase),
        })
    }

    /// Proactor-mode submission: the read already happened; the worker
    /// only runs the state machine. Returns `false` when the queue is full.
    pub fn dispatch_completed(&self, conn: Arc<ClientConn>) -> bool {
        self.enqueue(Task { conn, phase: None })
    }

    /// Stop accepting work and join every worker. Queued tasks are drained
    /// before the workers exit.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.queue.state.lock();
            if state.stop {
                return;
            }
            state.stop = true;
        }
        self.queue.ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(ctx: &WorkerCtx) {
    loop {
        let task = {
            let mut state = ctx.queue.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.stop {
                    return;
                }
                ctx.queue.ready.wait(&mut state);
            }
        };
        run_task(ctx, task);
    }
}

fn run_task(ctx: &WorkerCtx, task: Task) {
    let conn = task.conn;
    match task.phase {
        Some(Phase::Read) => {
            let ok = conn.http.lock().read_once();
            if ok {
                process_with_lease(ctx, &conn);
            } else {
                request_close(ctx, &conn);
            }
        }
        Some(Phase::Write) => {
            let outcome = conn.http.lock().write();
            match outcome {
                SendOutcome::Blocked => rearm(ctx, &conn, Interest::Write),
                SendOutcome::KeepAlive => rearm(ctx, &conn, Interest::Read),
                SendOutcome::Close => request_close(ctx, &conn),
            }
        }
        None => process_with_lease(ctx, &conn),
    }
}

/// Run the state machine under a scoped database lease.
fn process_with_lease(ctx: &WorkerCtx, conn: &Arc<ClientConn>) {
    let mut lease = ctx.db.acquire();
    let step = conn.http.lock().process(&ctx.users, Some(&mut *lease));
    drop(lease);
    dispatch_step(ctx, conn, step);
}

fn dispatch_step(ctx: &WorkerCtx, conn: &Arc<ClientConn>, step: NextStep) {
    match step {
        NextStep::AwaitRead => rearm(ctx, conn, Interest::Read),
        NextStep::AwaitWrite => rearm(ctx, conn, Interest::Write),
        NextStep::Close => request_close(ctx, conn),
    }
}

fn rearm(ctx: &WorkerCtx, conn: &Arc<ClientConn>, interest: Interest) {
    let http = conn.http.lock();
    if let Err(err) = ctx
        .registry
        .rearm(http.as_fd(), interest, conn.fd() as u64)
    {
        // The reactor may have already dropped the fd (idle reap).
        warn!("re-arm of fd {} failed: {err}", conn.fd());
    }
}

fn request_close(ctx: &WorkerCtx, conn: &Arc<ClientConn>) {
    conn.request_close();
    ctx.completions.post(conn.fd());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_board_roundtrip() {
        let board = CompletionBoard::new().unwrap();
        board.post(7);
        board.post(9);
        assert_eq!(board.drain(), vec![7, 9]);
        // Drained board is empty and drains again cleanly.
        assert!(board.drain().is_empty());
    }

}
