pub mod checkin;
pub mod friend;
pub mod message;
pub mod reaction;
pub mod rollup;
pub mod user;

pub use checkin::{CheckinRecord, CheckinStatus};
pub use friend::{FriendRequest, FriendshipEdge, RequestStatus};
pub use message::GoodnightMessage;
pub use reaction::{ReactionEvent, ReactionKind, ReactionStatus};
pub use rollup::SlotDailyRollup;
pub use user::UserRecord;
