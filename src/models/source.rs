//! Followed or blocked feed.

use serde::{Deserialize, Serialize};

/// A remote feed tracked in a follows or blocks list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Source {
    pub user_id: String,
    pub user_name: String,
    /// Canonical locator of the remote feed document
    pub user_link: String,
}

impl Source {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        user_link: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into().trim().to_string(),
            user_name: user_name.into().trim().to_string(),
            user_link: user_link.into().trim().to_string(),
        }
    }

    /// All three fields must match; ids and names alone are not unique.
    pub fn matches(&self, user_id: &str, user_link: &str, user_name: &str) -> bool {
        self.user_id == user_id && self.user_link == user_link && self.user_name == user_name
    }
}
