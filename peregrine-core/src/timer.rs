//! Idle-connection expiry timers.
//!
//! An ascending doubly-linked list of per-connection timers, reaped by
//! [`TimerList::tick`] on every alarm. Nodes live in a slab arena and link
//! to each other by slab key, so connections hold a plain [`TimerKey`]
//! instead of an intrusive pointer. Every mutation happens on the reactor
//! thread; workers only flag outcomes and never touch the list.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use slab::Slab;

/// The connection a timer guards: enough to close it when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Socket descriptor of the guarded connection.
    pub fd: RawFd,
    /// Peer address, for logging.
    pub addr: SocketAddr,
}

/// Handle to a timer owned by a [`TimerList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey(usize);

#[derive(Debug)]
struct Node {
    expire: u64,
    client: PeerInfo,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Sorted (ascending by expiry) list of connection timers.
#[derive(Debug, Default)]
pub struct TimerList {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl TimerList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` when no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a timer expiring at `expire` (seconds). O(n) scan from the
    /// head for the first node with an expiry not below the new one.
    pub fn add(&mut self, expire: u64, client: PeerInfo) -> TimerKey {
        let key = self.nodes.insert(Node {
            expire,
            client,
            prev: None,
            next: None,
        });
        let at = self.position_from(self.head, expire);
        self.link_before(key, at);
        TimerKey(key)
    }

    /// Push a timer's expiry forward. Timers only ever move later (a
    /// connection saw activity), so the search for the new slot starts at
    /// the old successor.
    pub fn adjust(&mut self, key: TimerKey, expire: u64) {
        let Some(node) = self.nodes.get_mut(key.0) else {
            return;
        };
        node.expire = expire;
        let next = node.next;
        match next {
            // Already last, or still ahead of the successor: stays put.
            None => {}
            Some(n) if expire <= self.nodes[n].expire => {}
            Some(n) => {
                self.unlink(key.0);
                let at = self.position_from(Some(n), expire);
                self.link_before(key.0, at);
            }
        }
    }

    /// Remove a timer. O(1) unlink.
    pub fn remove(&mut self, key: TimerKey) {
        if self.nodes.contains(key.0) {
            self.unlink(key.0);
            self.nodes.remove(key.0);
        }
    }

    /// Pop every timer with `expire <= now`, handing its client data to
    /// `reap` (which removes the connection from the epoll set and closes
    /// it) before the node is unlinked.
    pub fn tick<F>(&mut self, now: u64, mut reap: F)
    where
        F: FnMut(&PeerInfo),
    {
        while let Some(h) = self.head {
            if self.nodes[h].expire > now {
                break;
            }
            let client = self.nodes[h].client;
            reap(&client);
            self.unlink(h);
            self.nodes.remove(h);
        }
    }

    /// First node at or after `start` whose expiry is `>= expire`; `None`
    /// means append at the tail.
    fn position_from(&self, start: Option<usize>, expire: u64) -> Option<usize> {
        let mut cursor = start;
        while let Some(c) = cursor {
            if self.nodes[c].expire >= expire {
                return Some(c);
            }
            cursor = self.nodes[c].next;
        }
        None
    }

    fn link_before(&mut self, key: usize, at: Option<usize>) {
        match at {
            Some(at) => {
                let prev = self.nodes[at].prev;
                self.nodes[key].prev = prev;
                self.nodes[key].next = Some(at);
                self.nodes[at].prev = Some(key);
                match prev {
                    Some(p) => self.nodes[p].next = Some(key),
                    None => self.head = Some(key),
                }
            }
            None => {
                let prev = self.tail;
                self.nodes[key].prev = prev;
                self.nodes[key].next = None;
                match prev {
                    Some(p) => self.nodes[p].next = Some(key),
                    None => self.head = Some(key),
                }
                self.tail = Some(key);
            }
        }
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = (self.nodes[key].prev, self.nodes[key].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[key].prev = None;
        self.nodes[key].next = None;
    }

    #[cfg(test)]
    fn expiries(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while let Some(c) = cursor {
            out.push(self.nodes[c].expire);
            cursor = self.nodes[c].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(fd: RawFd) -> PeerInfo {
        PeerInfo {
            fd,
            addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    fn assert_sorted(list: &TimerList) {
        let expiries = list.expiries();
        let mut sorted = expiries.clone();
        sorted.sort_unstable();
        assert_eq!(expiries, sorted);
        assert_eq!(expiries.len(), list.len());
    }

    #[test]
    fn test_add_keeps_ascending_order() {
        let mut list = TimerList::new();
        for (fd, expire) in [(3, 30), (1, 10), (2, 20), (5, 20), (4, 5)] {
            list.add(expire, client(fd));
            assert_sorted(&list);
        }
        assert_eq!(list.expiries(), vec![5, 10, 20, 20, 30]);
    }

    #[test]
    fn test_adjust_moves_timer_later() {
        let mut list = TimerList::new();
        let a = list.add(10, client(1));
        list.add(20, client(2));
        list.add(30, client(3));

        list.adjust(a, 25);
        assert_sorted(&list);
        assert_eq!(list.expiries(), vec![20, 25, 30]);

        // Still ahead of its successor: no move.
        let b = list.add(5, client(4));
        list.adjust(b, 15);
        assert_sorted(&list);
        assert_eq!(list.expiries(), vec![15, 20, 25, 30]);
    }

    #[test]
    fn test_adjust_to_tail() {
        let mut list = TimerList::new();
        let a = list.add(10, client(1));
        list.add(20, client(2));
        list.adjust(a, 99);
        assert_sorted(&list);
        assert_eq!(list.expiries(), vec![20, 99]);
    }

    #[test]
    fn test_remove_middle_node() {
        let mut list = TimerList::new();
        list.add(10, client(1));
        let b = list.add(20, client(2));
        list.add(30, client(3));
        list.remove(b);
        assert_sorted(&list);
        assert_eq!(list.expiries(), vec![10, 30]);
        // Double remove is a no-op.
        list.remove(b);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_tick_reaps_only_expired() {
        let mut list = TimerList::new();
        list.add(10, client(1));
        list.add(20, client(2));
        list.add(30, client(3));

        let mut reaped = Vec::new();
        list.tick(20, |c| reaped.push(c.fd));
        assert_eq!(reaped, vec![1, 2]);
        assert_eq!(list.expiries(), vec![30]);

        list.tick(19, |_| panic!("nothing left to reap"));
    }

    #[test]
    fn test_tick_on_empty_list() {
        let mut list = TimerList::new();
        list.tick(100, |_| panic!("empty list must not reap"));
        assert!(list.is_empty());
    }
}
