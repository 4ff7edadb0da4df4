use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_CHARS;

/// Moderation state of a goodnight message
///
/// Fixed to `Approved` in this design; the field exists so stored data can
/// grow a review flow without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Approved,
}

/// Goodnight message stored in redb, keyed by `uid_date`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodnightMessage {
    pub uid: String,
    /// `YYYYMMDD`
    pub date: String,
    pub text: String,
    /// Copied from the submitting user at creation time
    #[serde(rename = "slotKey")]
    pub slot_key: String,
    pub likes: i64,
    pub dislikes: i64,
    /// likes - dislikes, maintained by the reaction consumer
    pub score: i64,
    /// Uniform [0, 1) sampling key assigned at creation
    pub rand: f64,
    pub status: MessageStatus,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Storage key for a goodnight message: `uid_date`
pub fn message_key(uid: &str, date: &str) -> String {
    format!("{}_{}", uid, date)
}

/// Trim and cap submitted text; `None` when nothing is left after trimming
pub fn normalize_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_MESSAGE_CHARS).collect())
}
