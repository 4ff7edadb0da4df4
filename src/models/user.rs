use serde::{Deserialize, Serialize};

use crate::constants::{SLOT_MINUTES, UID_ALPHABET, UID_MAX_LEN, UID_MIN_LEN};
use crate::models::checkin::CheckinStatus;

/// User record stored in redb, keyed by the caller's identity key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Public-facing random identifier (8-10 chars, unambiguous alphabet)
    pub uid: String,
    pub nickname: String,
    #[serde(rename = "timezoneOffsetMinutes")]
    pub timezone_offset_minutes: i32,
    /// Target bedtime, `HH:MM`
    #[serde(rename = "targetTime")]
    pub target_time: String,
    /// Target time quantized to the nearest 30-minute bucket
    #[serde(rename = "slotKey")]
    pub slot_key: String,
    #[serde(rename = "todayStatus")]
    pub today_status: Option<CheckinStatus>,
    pub streak: u32,
    #[serde(rename = "totalDays")]
    pub total_days: u32,
    /// `YYYYMMDD` of the most recent check-in
    #[serde(rename = "lastCheckinDate")]
    pub last_checkin_date: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Quantize an `HH:MM` target time to the nearest 30-minute slot key
///
/// `22:40` maps to `22:30`, `22:50` to `23:00`; rounding past midnight
/// wraps to `00:00`.
pub fn slot_key_for(target_time: &str) -> Option<String> {
    let (h, m) = target_time.split_once(':')?;
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }

    let total = hours * 60 + minutes;
    let slot = ((total + SLOT_MINUTES / 2) / SLOT_MINUTES * SLOT_MINUTES) % (24 * 60);
    Some(format!("{:02}:{:02}", slot / 60, slot % 60))
}

/// Validate a public uid: 8-10 chars, all from the unambiguous alphabet
pub fn validate_uid(uid: &str) -> bool {
    (UID_MIN_LEN..=UID_MAX_LEN).contains(&uid.len())
        && uid.bytes().all(|b| UID_ALPHABET.contains(&b))
}
