//! Database access: the bounded connection pool and the user directory.

mod pool;
mod users;

pub use pool::{ConnectionPool, PoolOptions, PooledConn};
pub use users::UserDirectory;
