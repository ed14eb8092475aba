// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-account storage and the connection pool that guards it.
//!
//! The schema is a single `user(username, password)` table: login checks a
//! row exists with a matching password, register checks the username is
//! free before inserting. Passwords are compared and stored in plaintext.

mod pool;

pub use pool::{DbHandlePool, PooledConnection};

use thiserror::Error;

/// A user row as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub username: String,
    pub password: String,
}

/// Errors a `DbHandle` can surface. Every variant is recoverable from the
/// caller's perspective except `PoolInit`, which is fatal at startup.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] mysql::Error),

    #[error("query failed: {0}")]
    Query(#[source] mysql::Error),

    #[error("connection pool exhausted")]
    PoolExhausted,
}

/// A single database connection capable of answering the two queries the
/// login/register endpoints need. Abstracted behind a trait so tests run
/// against an in-memory fake instead of a live MySQL instance.
pub trait DbHandle: Send {
    /// Looks up `username`, returning its stored row if one exists.
    fn query_user(&mut self, username: &str) -> Result<Option<StoredUser>, DbError>;

    /// Inserts a new `(username, password)` row. Returns `Ok(false)` without
    /// writing anything if `username` is already taken (unique constraint
    /// in the schema, checked here to surface it as a value rather than a
    /// driver error).
    fn insert_user(&mut self, username: &str, password: &str) -> Result<bool, DbError>;
}

/// A `DbHandle` backed by a live `mysql::Conn`.
pub struct MysqlHandle {
    conn: mysql::Conn,
}

impl MysqlHandle {
    /// Opens a new connection using the given options.
    pub fn connect(opts: mysql::Opts) -> Result<Self, DbError> {
        let conn = mysql::Conn::new(opts).map_err(DbError::Connect)?;
        Ok(Self { conn })
    }
}

impl DbHandle for MysqlHandle {
    fn query_user(&mut self, username: &str) -> Result<Option<StoredUser>, DbError> {
        use mysql::prelude::Queryable;

        let row: Option<(String, String)> = self
            .conn
            .exec_first(
                "SELECT username, password FROM user WHERE username = ?",
                (username,),
            )
            .map_err(DbError::Query)?;

        Ok(row.map(|(username, password)| StoredUser { username, password }))
    }

    fn insert_user(&mut self, username: &str, password: &str) -> Result<bool, DbError> {
        use mysql::prelude::Queryable;

        if self.query_user(username)?.is_some() {
            return Ok(false);
        }

        self.conn
            .exec_drop(
                "INSERT INTO user(username, password) VALUES (?, ?)",
                (username, password),
            )
            .map_err(DbError::Query)?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory `DbHandle` for tests that don't need a live database.

    use super::{DbError, DbHandle, StoredUser};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, Clone)]
    pub struct FakeHandle {
        users: Arc<Mutex<HashMap<String, String>>>,
    }

    impl FakeHandle {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl DbHandle for FakeHandle {
        fn query_user(&mut self, username: &str) -> Result<Option<StoredUser>, DbError> {
            let users = self.users.lock().unwrap();
            Ok(users.get(username).map(|password| StoredUser {
                username: username.to_string(),
                password: password.clone(),
            }))
        }

        fn insert_user(&mut self, username: &str, password: &str) -> Result<bool, DbError> {
            let mut users = self.users.lock().unwrap();
            if users.contains_key(username) {
                return Ok(false);
            }
            users.insert(username.to_string(), password.to_string());
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeHandle;
    use super::*;

    #[test]
    fn insert_then_query_round_trips() {
        let mut h = FakeHandle::new();
        assert!(h.insert_user("alice", "hunter2").unwrap());
        let row = h.query_user("alice").unwrap().unwrap();
        assert_eq!(row, StoredUser { username: "alice".into(), password: "hunter2".into() });
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut h = FakeHandle::new();
        assert!(h.insert_user("alice", "hunter2").unwrap());
        assert!(!h.insert_user("alice", "different").unwrap());
    }

    #[test]
    fn query_unknown_user_is_none() {
        let mut h = FakeHandle::new();
        assert!(h.query_user("nobody").unwrap().is_none());
    }
}
