use std::collections::HashMap;

use mysql::prelude::Queryable;
use mysql::Conn;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::error::CoreResult;

/// In-memory username → password map.
///
/// Loaded once at startup from the `user` table and consulted on every
/// login. Reads take a shared lock; only registration writes, and the map
/// is updated after the row is durably in the database.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: RwLock<HashMap<String, String>>,
}

impl UserDirectory {
    /// Build an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every registered user from the database.
    pub fn load(conn: &mut Conn) -> CoreResult<Self> {
        let rows: Vec<(String, String)> =
            conn.query("SELECT username, passwd FROM user")?;
        info!("loaded {} registered users", rows.len());
        Ok(Self {
            users: RwLock::new(rows.into_iter().collect()),
        })
    }

    /// `true` when `username` has a matching registered password.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .read()
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    /// `true` when `username` is registered.
    pub fn contains(&self, username: &str) -> bool {
        self.users.read().contains_key(username)
    }

    /// Insert a user into the in-memory map only. Used at registration
    /// after the database insert succeeded, and by tests to seed state.
    pub fn insert(&self, username: &str, password: &str) {
        self.users
            .write()
            .insert(username.to_owned(), password.to_owned());
    }

    /// Register a new user: insert the row, then publish it to the map.
    /// Returns `false` (and logs) when the database rejects the insert;
    /// the map is left untouched in that case.
    pub fn register(&self, username: &str, password: &str, conn: &mut Conn) -> bool {
        let inserted = conn.exec_drop(
            "INSERT INTO user(username, passwd) VALUES(?, ?)",
            (username, password),
        );
        match inserted {
            Ok(()) => {
                self.insert(username, password);
                true
            }
            Err(err) => {
                error!("registration insert failed for {username}: {err}");
                false
            }
        }
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// `true` when nobody is registered.
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_checks_password() {
        let users = UserDirectory::new();
        users.insert("alice", "secret");

        assert!(users.verify("alice", "secret"));
        assert!(!users.verify("alice", "wrong"));
        assert!(!users.verify("bob", "secret"));
    }

    #[test]
    fn test_contains_tracks_registration_state() {
        let users = UserDirectory::new();
        assert!(!users.contains("alice"));
        users.insert("alice", "secret");
        assert!(users.contains("alice"));
        assert_eq!(users.len(), 1);
    }
}
