//! RFID tag model.

use serde::{Deserialize, Serialize};

/// Tag status as persisted in the tags CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagStatus {
    Activated,
    Blocked,
}

impl Default for TagStatus {
    fn default() -> Self {
        Self::Activated
    }
}

/// An RFID tag/card, associated with a user. Tag ids are upper-cased on
/// insert so that all lookups are case-insensitive.
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub id_tag: String,
    pub user_name: Option<String>,
    pub parent_id_tag: Option<String>,
    pub description: Option<String>,
    pub status: TagStatus,
    /// Optional priority override applied to transactions started with this tag.
    pub priority: Option<i32>,
}

impl Tag {
    pub fn new(
        id_tag: &str,
        user_name: Option<String>,
        parent_id_tag: Option<String>,
        description: Option<String>,
        status: TagStatus,
        priority: Option<i32>,
    ) -> Self {
        Self {
            id_tag: id_tag.to_uppercase(),
            user_name,
            parent_id_tag,
            description,
            status,
            priority,
        }
    }
}
