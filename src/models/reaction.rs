use serde::{Deserialize, Serialize};

/// Reaction submitted by a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Dislike,
}

impl ReactionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(ReactionKind::Like),
            "dislike" => Some(ReactionKind::Dislike),
            _ => None,
        }
    }
}

/// Processing state of a queued reaction event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionStatus {
    Queued,
    Done,
    Failed,
}

/// Append-only reaction queue entry
///
/// Immutable apart from the `status` transition made by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionEvent {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "deltaLikes")]
    pub delta_likes: i64,
    #[serde(rename = "deltaDislikes")]
    pub delta_dislikes: i64,
    #[serde(rename = "deltaScore")]
    pub delta_score: i64,
    pub status: ReactionStatus,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl ReactionEvent {
    /// Build a queued event for one reaction
    pub fn queued(message_id: &str, kind: ReactionKind, created_at: i64) -> Self {
        let (delta_likes, delta_dislikes, delta_score) = match kind {
            ReactionKind::Like => (1, 0, 1),
            ReactionKind::Dislike => (0, 1, -1),
        };
        Self {
            message_id: message_id.to_string(),
            delta_likes,
            delta_dislikes,
            delta_score,
            status: ReactionStatus::Queued,
            created_at,
        }
    }
}
