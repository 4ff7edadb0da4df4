use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::user::UserRecord;

/// Outcome of a daily check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckinStatus {
    Hit,
    Late,
    Miss,
    Pending,
}

impl CheckinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckinStatus::Hit => "hit",
            CheckinStatus::Late => "late",
            CheckinStatus::Miss => "miss",
            CheckinStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hit" => Some(CheckinStatus::Hit),
            "late" => Some(CheckinStatus::Late),
            "miss" => Some(CheckinStatus::Miss),
            "pending" => Some(CheckinStatus::Pending),
            _ => None,
        }
    }
}

/// Check-in record stored in redb, keyed by `uid#date`
///
/// At most one record exists per (uid, date); status never changes after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRecord {
    pub uid: String,
    /// `YYYYMMDD`
    pub date: String,
    pub status: CheckinStatus,
    #[serde(rename = "timezoneOffsetMinutes")]
    pub timezone_offset_minutes: i32,
    pub timestamp: i64,
    /// Back-reference filled in when the user submits a goodnight message
    #[serde(rename = "goodnightMessageId")]
    pub goodnight_message_id: Option<String>,
}

/// Storage key for a check-in: `uid#date`
pub fn checkin_key(uid: &str, date: &str) -> String {
    format!("{}#{}", uid, date)
}

/// Validate a `YYYYMMDD` date string
pub fn validate_date(date: &str) -> bool {
    date.len() == 8 && NaiveDate::parse_from_str(date, "%Y%m%d").is_ok()
}

/// The calendar day before `date`, in `YYYYMMDD`
pub fn previous_date(date: &str) -> Option<String> {
    let parsed = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    Some(parsed.pred_opt()?.format("%Y%m%d").to_string())
}

/// Apply a freshly created check-in to the owning user's counters
///
/// Consecutive-day `hit`s extend the streak; a gap restarts it at 1; any
/// non-`hit` outcome resets it to 0. `total_days` counts every new record.
pub fn apply_checkin(user: &mut UserRecord, date: &str, status: CheckinStatus) {
    user.total_days += 1;

    if status == CheckinStatus::Hit {
        let yesterday = previous_date(date);
        if user.last_checkin_date.as_deref() == yesterday.as_deref() {
            user.streak += 1;
        } else if user.last_checkin_date.as_deref() != Some(date) {
            user.streak = 1;
        }
        // Same-day re-entry leaves the streak untouched
    } else {
        user.streak = 0;
    }

    user.last_checkin_date = Some(date.to_string());
    user.today_status = Some(status);
}
