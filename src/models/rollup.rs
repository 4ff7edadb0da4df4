use serde::{Deserialize, Serialize};

/// Per-slot participation summary for one day, keyed by `slotKey#date`
///
/// Overwritten wholesale on every rollup run; never incremented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDailyRollup {
    #[serde(rename = "slotKey")]
    pub slot_key: String,
    /// `YYYYMMDD`
    pub date: String,
    pub participants: u64,
    pub hits: u64,
    /// hits / participants, rounded to 4 decimals
    #[serde(rename = "hitRate")]
    pub hit_rate: f64,
}

/// Storage key for a rollup document: `slotKey#date`
pub fn rollup_key(slot_key: &str, date: &str) -> String {
    format!("{}#{}", slot_key, date)
}

/// hits / participants rounded to 4 decimals; 0.0 for an empty slot
pub fn hit_rate(hits: u64, participants: u64) -> f64 {
    if participants == 0 {
        return 0.0;
    }
    (hits as f64 / participants as f64 * 10_000.0).round() / 10_000.0
}
