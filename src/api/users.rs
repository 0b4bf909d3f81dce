//! API users and their roles.
//!
//! Users are loaded from a CSV (`user_id,role,auth_sha`). A `Login` call
//! presents a token whose sha-256 digest is matched against the table.

use std::path::Path;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::support::authutil::{digest_eq, sha256_hex};
use crate::support::errors::ModelError;

/// Role ladder; each level may run everything the previous levels may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Status,
    Analysis,
    SessionPriority,
    Tags,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Status" => Some(Self::Status),
            "Analysis" => Some(Self::Analysis),
            "SessionPriority" => Some(Self::SessionPriority),
            "Tags" => Some(Self::Tags),
            "Admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct User {
    user_id: String,
    role: Role,
    auth_sha: String,
}

#[derive(Debug, Deserialize)]
struct UserRow {
    user_id: String,
    role: String,
    auth_sha: String,
}

/// The user table. Reloadable at runtime.
#[derive(Default)]
pub struct UserTable {
    users: RwLock<Vec<User>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (replace) users from CSV.
    pub fn load_csv(&self, path: &Path) -> Result<(), ModelError> {
        info!(path = %path.display(), "reading users");
        let mut reader = csv::Reader::from_path(path)?;
        let mut users = Vec::new();
        for row in reader.deserialize() {
            let row: UserRow = row?;
            let Some(role) = Role::parse(&row.role) else {
                warn!(user_id = row.user_id.as_str(), role = row.role.as_str(), "unknown role, skipping user");
                continue;
            };
            users.push(User {
                user_id: row.user_id,
                role,
                auth_sha: row.auth_sha.to_lowercase(),
            });
        }
        info!(count = users.len(), "users loaded");
        *self.users.write() = users;
        Ok(())
    }

    /// Insert or replace one user with a plain-text token (test and
    /// bootstrap convenience).
    pub fn put(&self, user_id: &str, role: Role, token: &str) {
        let mut users = self.users.write();
        users.retain(|u| u.user_id != user_id);
        users.push(User {
            user_id: user_id.to_string(),
            role,
            auth_sha: sha256_hex(token),
        });
    }

    /// Match a presented token against the table, returning the user's role.
    pub fn check_token(&self, token: &str) -> Option<Role> {
        let digest = sha256_hex(token);
        self.users
            .read()
            .iter()
            .find(|u| digest_eq(&u.auth_sha, &digest))
            .map(|u| u.role)
    }
}
