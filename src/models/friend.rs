use serde::{Deserialize, Serialize};

/// Lifecycle of a friend request
///
/// `Accepted` and `Rejected` are terminal for the request instance; a new
/// request must be sent to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
        }
    }
}

/// Friend request stored in redb, keyed by a generated request id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    #[serde(rename = "fromUid")]
    pub from_uid: String,
    #[serde(rename = "toUid")]
    pub to_uid: String,
    pub status: RequestStatus,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Symmetric friendship edge, keyed by the sorted uid pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendshipEdge {
    /// Lexicographically smaller uid
    #[serde(rename = "uidA")]
    pub uid_a: String,
    /// Lexicographically larger uid
    #[serde(rename = "uidB")]
    pub uid_b: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Storage key for the edge between two uids: `min#max`
pub fn edge_key(uid_a: &str, uid_b: &str) -> String {
    if uid_a <= uid_b {
        format!("{}#{}", uid_a, uid_b)
    } else {
        format!("{}#{}", uid_b, uid_a)
    }
}

/// Pending-request index key for the ordered pair: `fromUid#toUid`
pub fn pending_key(from_uid: &str, to_uid: &str) -> String {
    format!("{}#{}", from_uid, to_uid)
}
