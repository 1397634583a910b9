use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
///
/// `wait` blocks until the count is positive and decrements it; `post`
/// increments the count and wakes one waiter. The count is a `usize`, so a
/// negative initial count is unrepresentable.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `count` permits.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Return a permit and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_permits_are_consumed_and_returned() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.post();
        sem.wait();
        sem.post();
        sem.post();
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.wait();
            })
        };
        // Give the waiter time to block, then release it.
        thread::sleep(Duration::from_millis(50));
        sem.post();
        waiter.join().unwrap();
    }
}
