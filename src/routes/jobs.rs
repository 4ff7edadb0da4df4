use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    Json,
};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ERR_INVALID_DATE, LOOKUP_CHUNK_SIZE, REACTION_BATCH_SIZE, ROLLUP_PAGE_SIZE,
};
use crate::db::{self, tables, Db};
use crate::error::{AppError, Result};
use crate::models::checkin::{validate_date, CheckinRecord, CheckinStatus};
use crate::models::message::GoodnightMessage;
use crate::models::reaction::{ReactionEvent, ReactionStatus};
use crate::models::rollup::{hit_rate, rollup_key, SlotDailyRollup};
use crate::models::user::UserRecord;
use crate::AppState;

/// Query parameters for the job endpoints
#[derive(Debug, Deserialize)]
pub struct JobQuery {
    /// Admin secret key for authentication
    pub key: String,
}

fn require_admin(state: &AppState, key: &str) -> Result<()> {
    let admin_key = state
        .config
        .admin_secret_key
        .as_ref()
        .ok_or(AppError::Unauthorized)?;
    if key != admin_key {
        tracing::warn!("Invalid admin key attempt");
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ConsumeReactionsResponse {
    pub code: &'static str,
    /// Queued events picked up this pass
    pub consumed: usize,
    /// Distinct messages incremented
    pub messages: usize,
    /// Events whose target message could not be updated
    pub failed: usize,
}

/// Drain one batch of queued reaction events
///
/// Events are read in creation order, grouped by message, and folded into
/// one increment per message. Events whose message is gone are marked
/// `failed` and left for a diagnostic pass; they are never silently
/// dropped, and this pass does not retry them.
pub fn consume_reactions(db: &Db) -> Result<(usize, usize, usize)> {
    let write_txn = db.begin_write()?;
    let (consumed, applied, failed) = {
        let mut events = write_txn.open_table(tables::REACTION_EVENTS)?;

        // Collect the batch first; the table cannot be mutated mid-iteration
        let mut batch: Vec<((i64, u64), ReactionEvent)> = Vec::new();
        for entry in events.iter()? {
            if batch.len() >= REACTION_BATCH_SIZE {
                break;
            }
            let (key, value) = entry?;
            let event: ReactionEvent = db::decode(value.value())?;
            if event.status == ReactionStatus::Queued {
                let (millis, seq) = key.value();
                batch.push(((millis, seq), event));
            }
        }

        // Sum deltas per message
        let mut groups: BTreeMap<String, (i64, i64, i64, Vec<(i64, u64)>)> = BTreeMap::new();
        for (key, event) in &batch {
            let entry = groups
                .entry(event.message_id.clone())
                .or_insert((0, 0, 0, Vec::new()));
            entry.0 += event.delta_likes;
            entry.1 += event.delta_dislikes;
            entry.2 += event.delta_score;
            entry.3.push(*key);
        }

        let mut messages = write_txn.open_table(tables::MESSAGES)?;
        let mut done_keys: Vec<(i64, u64)> = Vec::new();
        let mut failed_keys: Vec<(i64, u64)> = Vec::new();

        for (message_id, (likes, dislikes, score, keys)) in &groups {
            let stored = messages
                .get(message_id.as_str())?
                .map(|v| db::decode::<GoodnightMessage>(v.value()))
                .transpose()?;

            match stored {
                Some(mut message) => {
                    // One increment per message per pass
                    message.likes += likes;
                    message.dislikes += dislikes;
                    message.score += score;
                    let bytes = db::encode(&message)?;
                    messages.insert(message_id.as_str(), bytes.as_slice())?;
                    done_keys.extend_from_slice(keys);
                }
                None => {
                    tracing::warn!(
                        "Reaction target {} missing; marking {} events failed",
                        message_id,
                        keys.len()
                    );
                    failed_keys.extend_from_slice(keys);
                }
            }
        }
        drop(messages);

        let by_key: BTreeMap<(i64, u64), ReactionEvent> = batch.into_iter().collect();
        for (keys, status) in [
            (&done_keys, ReactionStatus::Done),
            (&failed_keys, ReactionStatus::Failed),
        ] {
            for key in keys {
                if let Some(event) = by_key.get(key) {
                    let mut event = event.clone();
                    event.status = status;
                    let bytes = db::encode(&event)?;
                    events.insert(*key, bytes.as_slice())?;
                }
            }
        }

        let consumed = done_keys.len() + failed_keys.len();
        (consumed, groups.len(), failed_keys.len())
    };
    write_txn.commit()?;

    Ok((consumed, applied, failed))
}

/// POST /api/jobs/reactions?key=<admin_secret_key>
pub async fn consume_reactions_handler(
    State(state): State<AppState>,
    Query(params): Query<JobQuery>,
) -> Result<Json<ConsumeReactionsResponse>> {
    require_admin(&state, &params.key)?;

    let db = state.db.clone();
    let (consumed, messages, failed) =
        tokio::task::spawn_blocking(move || consume_reactions(&db)).await??;

    tracing::info!(
        "Reaction pass: {} events over {} messages ({} failed)",
        consumed,
        messages,
        failed
    );

    Ok(Json(ConsumeReactionsResponse {
        code: "OK",
        consumed,
        messages,
        failed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RollupRequest {
    /// `YYYYMMDD`
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct RollupResponse {
    pub code: &'static str,
    pub date: String,
    /// Check-ins scanned for the day
    pub participants: u64,
    /// Slots written
    pub slots: usize,
}

/// Recompute one day's per-slot participation summaries
///
/// Pages the date index, resolves owners' slot keys in bounded chunks, and
/// overwrites each slot document. Pure recomputation: re-running over
/// unchanged check-ins produces identical output.
pub fn rollup(db: &Db, date: &str) -> Result<(u64, usize)> {
    let read_txn = db.begin_read()?;
    let by_date = read_txn.open_table(tables::CHECKINS_BY_DATE)?;
    let checkins = read_txn.open_table(tables::CHECKINS)?;
    let uids = read_txn.open_table(tables::UIDS)?;
    let users = read_txn.open_table(tables::USERS)?;

    // `#` sorts just below `$`, so this range covers exactly one day
    let start = format!("{}#", date);
    let end = format!("{}$", date);

    let mut page: Vec<(String, bool)> = Vec::with_capacity(ROLLUP_PAGE_SIZE);
    let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut participants: u64 = 0;

    let flush = |page: &mut Vec<(String, bool)>,
                     totals: &mut BTreeMap<String, (u64, u64)>|
     -> Result<()> {
        // Resolve slot keys in chunks, mirroring the store's IN-clause limit
        for chunk in page.chunks(LOOKUP_CHUNK_SIZE) {
            for (uid, hit) in chunk {
                let Some(identity_key) = uids.get(uid.as_str())? else {
                    continue;
                };
                let Some(user_bytes) = users.get(identity_key.value())? else {
                    continue;
                };
                let user: UserRecord = db::decode(user_bytes.value())?;
                let entry = totals.entry(user.slot_key).or_insert((0, 0));
                entry.0 += 1;
                if *hit {
                    entry.1 += 1;
                }
            }
        }
        page.clear();
        Ok(())
    };

    for entry in by_date.range(start.as_str()..end.as_str())? {
        let (key, _) = entry?;
        let key = key.value();
        let Some((_, uid)) = key.split_once('#') else {
            continue;
        };

        let hit = checkins
            .get(format!("{}#{}", uid, date).as_str())?
            .map(|v| db::decode::<CheckinRecord>(v.value()))
            .transpose()?
            .map(|r| r.status == CheckinStatus::Hit)
            .unwrap_or(false);

        participants += 1;
        page.push((uid.to_string(), hit));
        if page.len() >= ROLLUP_PAGE_SIZE {
            flush(&mut page, &mut totals)?;
        }
    }
    flush(&mut page, &mut totals)?;
    drop(by_date);

    // Overwrite, never increment: the slot documents are a pure function
    // of the day's check-ins
    let write_txn = db.begin_write()?;
    {
        let mut rollups = write_txn.open_table(tables::SLOT_ROLLUPS)?;
        for (slot_key, (participants, hits)) in &totals {
            let doc = SlotDailyRollup {
                slot_key: slot_key.clone(),
                date: date.to_string(),
                participants: *participants,
                hits: *hits,
                hit_rate: hit_rate(*hits, *participants),
            };
            let bytes = db::encode(&doc)?;
            rollups.insert(rollup_key(slot_key, date).as_str(), bytes.as_slice())?;
        }
    }
    write_txn.commit()?;

    Ok((participants, totals.len()))
}

/// POST /api/jobs/rollup?key=<admin_secret_key>
pub async fn rollup_handler(
    State(state): State<AppState>,
    Query(params): Query<JobQuery>,
    Json(payload): Json<RollupRequest>,
) -> Result<Json<RollupResponse>> {
    require_admin(&state, &params.key)?;

    if !validate_date(&payload.date) {
        return Err(AppError::InvalidArg(ERR_INVALID_DATE.to_string()));
    }

    let db = state.db.clone();
    let date = payload.date.clone();
    let (participants, slots) =
        tokio::task::spawn_blocking(move || rollup(&db, &date)).await??;

    tracing::info!(
        "Rollup for {}: {} participants across {} slots",
        payload.date,
        participants,
        slots
    );

    Ok(Json(RollupResponse {
        code: "OK",
        date: payload.date,
        participants,
        slots,
    }))
}
