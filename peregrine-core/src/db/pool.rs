use std::ops::{Deref, DerefMut};

use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{CoreError, CoreResult};
use crate::sync::Semaphore;

/// Connection parameters for the pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Database host name or address.
    pub host: String,
    /// TCP port the database listens on.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Schema holding the `user` table.
    pub database: String,
    /// Number of live handles the pool keeps.
    pub size: usize,
}

impl PoolOptions {
    fn to_opts(&self) -> Opts {
        OptsBuilder::new()
            .ip_or_hostname(Some(self.host.clone()))
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.database.clone()))
            .into()
    }
}

struct PoolInner {
    free: Vec<Conn>,
    in_use: usize,
    closed: bool,
}

/// Fixed-size pool of live database handles.
///
/// All `size` connections are opened eagerly at construction. A counting
/// semaphore holds exactly as many permits as there are free handles, so
/// [`acquire`](Self::acquire) blocks when every handle is leased and never
/// finds the free list empty afterwards.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    slots: Semaphore,
    size: usize,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size)
            .field("free", &self.free())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Open `options.size` connections. Any failure closes the handles
    /// opened so far and surfaces the error.
    pub fn connect(options: &PoolOptions) -> CoreResult<Self> {
        if options.size == 0 {
            return Err(CoreError::InvalidCapacity { what: "pool size" });
        }

        let opts = options.to_opts();
        let mut free = Vec::with_capacity(options.size);
        for _ in 0..options.size {
            // On error `free` is dropped, closing the handles already open.
            let mut conn = Conn::new(opts.clone())?;
            conn.query_drop("SELECT 1")?;
            free.push(conn);
        }
        debug!("database pool ready with {} connections", options.size);

        Ok(Self {
            inner: Mutex::new(PoolInner {
                free,
                in_use: 0,
                closed: false,
            }),
            slots: Semaphore::new(options.size),
            size: options.size,
        })
    }

    /// Lease a handle, blocking until one is free. The lease returns its
    /// handle on every exit path when dropped.
    pub fn acquire(&self) -> PooledConn<'_> {
        self.slots.wait();
        let mut inner = self.inner.lock();
        // The semaphore permit guarantees a free handle.
        let conn = inner
            .free
            .pop()
            .unwrap_or_else(|| unreachable!("semaphore permit without a free connection"));
        inner.in_use += 1;
        PooledConn {
            conn: Some(conn),
            pool: self,
        }
    }

    fn release(&self, conn: Conn) {
        {
            let mut inner = self.inner.lock();
            inner.in_use -= 1;
            if inner.closed {
                // Dropping the handle closes it.
                drop(conn);
            } else {
                inner.free.push(conn);
            }
        }
        self.slots.post();
    }

    /// Free handles currently in the pool.
    pub fn free(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Handles currently leased out.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Total handles the pool was built with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Close every pooled handle. Idempotent; leases still out are closed
    /// when they drop back into the closed pool.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        debug!("closing {} pooled database connections", inner.free.len());
        inner.free.clear();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scoped lease on a pooled connection.
///
/// Dereferences to [`mysql::Conn`]; the handle is returned to the pool when
/// the lease goes out of scope, on success and failure paths alike.
pub struct PooledConn<'a> {
    conn: Option<Conn>,
    pool: &'a ConnectionPool,
}

impl std::fmt::Debug for PooledConn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl Deref for PooledConn<'_> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease already released"))
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease already released"))
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) => self.pool.release(conn),
            None => error!("database lease dropped twice"),
        }
    }
}
