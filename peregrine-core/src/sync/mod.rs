//! Blocking synchronization primitives.
//!
//! The DB pool gates leases with [`Semaphore`]; the asynchronous log sink
//! buffers records in a [`BoundedQueue`]. Both are deliberately plain
//! mutex-and-condvar constructions: nothing here suspends while holding a
//! lock, and every wait re-checks its predicate.

mod queue;
mod semaphore;

pub use queue::BoundedQueue;
pub use semaphore::Semaphore;
