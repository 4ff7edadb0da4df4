pub mod admin;
pub mod checkin;
pub mod friend;
pub mod goodnight;
pub mod health;
pub mod jobs;
pub mod query;
pub mod user;

pub use admin::admin_stats;
pub use checkin::{get_checkin, submit_checkin};
pub use friend::{list_friends, list_requests, remove_friend, resolve_request, send_request};
pub use goodnight::{pick_random, react, submit_message};
pub use health::health_check;
pub use jobs::{consume_reactions_handler, rollup_handler};
pub use query::execute_query;
pub use user::{ensure_user_handler, update_profile};
