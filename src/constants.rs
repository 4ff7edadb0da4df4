/// Alphabet for public uids: digits and letters minus the visually
/// ambiguous `0 O I l` (58 symbols, base58 order)
pub const UID_ALPHABET: &[u8] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Shortest generated uid
pub const UID_MIN_LEN: usize = 8;

/// Longest generated uid
pub const UID_MAX_LEN: usize = 10;

/// Uniqueness retries before uid generation gives up
pub const UID_MAX_ATTEMPTS: u32 = 10;

/// Target time assigned to users who never picked one
pub const DEFAULT_TARGET_TIME: &str = "22:30";

/// Width of a cohort slot in minutes (target times quantize to this)
pub const SLOT_MINUTES: u32 = 30;

/// Goodnight message length cap (characters, after trimming)
pub const MAX_MESSAGE_CHARS: usize = 240;

/// Reaction events drained per consumer pass
pub const REACTION_BATCH_SIZE: usize = 100;

/// Check-in index rows scanned per rollup page
pub const ROLLUP_PAGE_SIZE: usize = 100;

/// Batched user lookups are chunked to this size (store IN-clause limit)
pub const LOOKUP_CHUNK_SIZE: usize = 10;

// =============================================================================
// Error Messages
// =============================================================================

/// Error message for a malformed check-in date
pub const ERR_INVALID_DATE: &str = "Date must be YYYYMMDD";

/// Error message for a malformed check-in status
pub const ERR_INVALID_STATUS: &str = "Status must be one of hit, late, miss, pending";

/// Error message for an empty goodnight message
pub const ERR_EMPTY_MESSAGE: &str = "Message text must not be empty";

/// Error message for a friend request sent to oneself
pub const ERR_SELF_REQUEST: &str = "Cannot send a friend request to yourself";
