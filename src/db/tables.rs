use redb::TableDefinition;

/// Users table: identity key (platform-derived, opaque) -> UserRecord (serialized)
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Uid index: public uid -> identity key
/// Doubles as the uniqueness probe during uid generation
pub const UIDS: TableDefinition<&str, &str> = TableDefinition::new("uids");

/// Check-ins table: `uid#date` -> CheckinRecord (serialized)
pub const CHECKINS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkins");

/// Check-in date index: `date#uid` -> ()
/// Lets the rollup job range-scan one day's check-ins
pub const CHECKINS_BY_DATE: TableDefinition<&str, ()> =
    TableDefinition::new("checkins_by_date");

/// Friend requests table: request id -> FriendRequest (serialized)
pub const FRIEND_REQUESTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("friend_requests");

/// Pending-request index: `fromUid#toUid` -> request id
/// Enforces at most one pending request per ordered pair
pub const PENDING_REQUESTS: TableDefinition<&str, &str> =
    TableDefinition::new("pending_requests");

/// Friendship edges table: sorted `min(uidA,uidB)#max(uidA,uidB)` -> FriendshipEdge
pub const FRIEND_EDGES: TableDefinition<&str, &[u8]> = TableDefinition::new("friend_edges");

/// Goodnight messages table: `uid_date` -> GoodnightMessage (serialized)
pub const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Message sampling index: (rand bits, message id) -> ()
/// `rand.to_bits()` preserves order for floats in [0, 1), so range scans
/// over this table walk messages in ascending `rand` order
pub const MESSAGE_RAND_INDEX: TableDefinition<(u64, &str), ()> =
    TableDefinition::new("message_rand_index");

/// Reaction event queue: (created-at millis, sequence) -> ReactionEvent (serialized)
/// Key order is creation order, which the consumer relies on
pub const REACTION_EVENTS: TableDefinition<(i64, u64), &[u8]> =
    TableDefinition::new("reaction_events");

/// Slot rollups table: `slotKey#date` -> SlotDailyRollup (serialized)
pub const SLOT_ROLLUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("slot_rollups");
