use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use rand::Rng;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use crate::constants::{ERR_EMPTY_MESSAGE, ERR_INVALID_DATE};
use crate::db::{self, tables};
use crate::error::{AppError, Result};
use crate::identity::{require_user, CallerIdentity};
use crate::models::checkin::{checkin_key, validate_date, CheckinRecord};
use crate::models::message::{message_key, normalize_text, GoodnightMessage, MessageStatus};
use crate::models::reaction::{ReactionEvent, ReactionKind};
use crate::AppState;

/// Tie-breaker for reaction queue keys created in the same millisecond
static REACTION_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Deserialize)]
pub struct SubmitMessageRequest {
    /// `YYYYMMDD`
    pub date: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitMessageResponse {
    pub code: &'static str,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub message: GoodnightMessage,
    /// True when a message for (uid, date) already existed; its id is
    /// returned and the call still succeeds
    pub duplicate: bool,
}

/// Submit the caller's goodnight message for one date
///
/// One message per (uid, date), enforced with the same in-transaction
/// get-then-insert as the check-in ledger. The sampling key `rand` is fixed
/// at creation and mirrored into the rand index for pivot lookups.
pub async fn submit_message(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(payload): Json<SubmitMessageRequest>,
) -> Result<Json<SubmitMessageResponse>> {
    if !validate_date(&payload.date) {
        return Err(AppError::InvalidArg(ERR_INVALID_DATE.to_string()));
    }
    let text = normalize_text(&payload.text)
        .ok_or_else(|| AppError::InvalidArg(ERR_EMPTY_MESSAGE.to_string()))?;

    let db = state.db.clone();

    let (message_id, message, duplicate) =
        tokio::task::spawn_blocking(move || -> Result<(String, GoodnightMessage, bool)> {
            let user = require_user(&db, &identity.0)?;
            let key = message_key(&user.uid, &payload.date);

            let write_txn = db.begin_write()?;
            let outcome = {
                let mut messages = write_txn.open_table(tables::MESSAGES)?;

                let existing: Option<GoodnightMessage> = messages
                    .get(key.as_str())?
                    .map(|v| db::decode(v.value()))
                    .transpose()?;

                if let Some(message) = existing {
                    (key.clone(), message, true)
                } else {
                    let message = GoodnightMessage {
                        uid: user.uid.clone(),
                        date: payload.date.clone(),
                        text,
                        slot_key: user.slot_key.clone(),
                        likes: 0,
                        dislikes: 0,
                        score: 0,
                        rand: rand::rng().random::<f64>(),
                        status: MessageStatus::Approved,
                        created_at: Utc::now().timestamp(),
                    };
                    let bytes = db::encode(&message)?;
                    messages.insert(key.as_str(), bytes.as_slice())?;

                    let mut rand_index = write_txn.open_table(tables::MESSAGE_RAND_INDEX)?;
                    rand_index.insert((message.rand.to_bits(), key.as_str()), ())?;

                    // Back-fill the same-day check-in with the message id
                    let mut checkins = write_txn.open_table(tables::CHECKINS)?;
                    let ck = checkin_key(&user.uid, &payload.date);
                    let stored: Option<CheckinRecord> = checkins
                        .get(ck.as_str())?
                        .map(|v| db::decode(v.value()))
                        .transpose()?;
                    if let Some(mut record) = stored {
                        record.goodnight_message_id = Some(key.clone());
                        let record_bytes = db::encode(&record)?;
                        checkins.insert(ck.as_str(), record_bytes.as_slice())?;
                    }

                    (key.clone(), message, false)
                }
            };
            write_txn.commit()?;
            Ok(outcome)
        })
        .await??;

    tracing::info!(
        "Goodnight message {} for {} (duplicate: {})",
        message_id,
        message.uid,
        duplicate
    );

    Ok(Json(SubmitMessageResponse {
        code: "OK",
        message_id,
        message,
        duplicate,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PickRandomParams {
    #[serde(rename = "slotKey")]
    pub slot_key: Option<String>,
    /// Minimum score a candidate must have (default 0)
    #[serde(rename = "minScore")]
    pub min_score: Option<i64>,
    /// Fixed sampling pivot in [0, 1); drawn uniformly when absent
    pub pivot: Option<f64>,
    /// Uid to skip; defaults to the caller so nobody draws their own message
    #[serde(rename = "excludeUid")]
    pub exclude_uid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PickRandomResponse {
    pub code: &'static str,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
    /// `null` when nothing in the pool matches the filters
    pub message: Option<GoodnightMessage>,
}

/// Pick a uniformly random goodnight message matching the filters
///
/// Two index lookups instead of a scan: the smallest `rand` at or after the
/// pivot, then a wraparound to the smallest `rand` overall when the pivot
/// fell past the filtered set's largest key. A fixed pivot replays the same
/// choice deterministically.
pub async fn pick_random(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Query(params): Query<PickRandomParams>,
) -> Result<Json<PickRandomResponse>> {
    if let Some(pivot) = params.pivot {
        if !(0.0..1.0).contains(&pivot) {
            return Err(AppError::InvalidArg("Pivot must be in [0, 1)".to_string()));
        }
    }

    let db = state.db.clone();

    let picked = tokio::task::spawn_blocking(move || -> Result<Option<(String, GoodnightMessage)>> {
        let caller = require_user(&db, &identity.0)?;
        let exclude_uid = params.exclude_uid.clone().unwrap_or(caller.uid);

        let pivot = params.pivot.unwrap_or_else(|| rand::rng().random::<f64>());
        let pivot_bits = pivot.to_bits();

        let read_txn = db.begin_read()?;
        let index = read_txn.open_table(tables::MESSAGE_RAND_INDEX)?;
        let messages = read_txn.open_table(tables::MESSAGES)?;

        let matches = |message_id: &str| -> Result<Option<GoodnightMessage>> {
            let Some(bytes) = messages.get(message_id)? else {
                return Ok(None);
            };
            let message: GoodnightMessage = db::decode(bytes.value())?;
            if message.status != MessageStatus::Approved {
                return Ok(None);
            }
            if message.uid == exclude_uid {
                return Ok(None);
            }
            if let Some(slot) = params.slot_key.as_deref() {
                if message.slot_key != slot {
                    return Ok(None);
                }
            }
            if message.score < params.min_score.unwrap_or(0) {
                return Ok(None);
            }
            Ok(Some(message))
        };

        // Query 1: smallest rand >= pivot
        for entry in index.range((pivot_bits, "")..)? {
            let (key, _) = entry?;
            let (_, message_id) = key.value();
            if let Some(message) = matches(message_id)? {
                return Ok(Some((message_id.to_string(), message)));
            }
        }

        // Query 2 (wraparound): pivot fell past the largest rand in the
        // filtered set; take the smallest rand < pivot instead
        for entry in index.range(..(pivot_bits, ""))? {
            let (key, _) = entry?;
            let (_, message_id) = key.value();
            if let Some(message) = matches(message_id)? {
                return Ok(Some((message_id.to_string(), message)));
            }
        }

        Ok(None)
    })
    .await??;

    let (message_id, message) = match picked {
        Some((id, message)) => (Some(id), Some(message)),
        None => (None, None),
    };

    Ok(Json(PickRandomResponse {
        code: "OK",
        message_id,
        message,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// `like` or `dislike`
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct ReactResponse {
    pub code: &'static str,
    pub queued: bool,
}

/// Queue a reaction against a goodnight message
///
/// Appends to the reaction queue instead of touching the message document;
/// the consumer folds queued deltas into the counters in batches, which
/// keeps popular messages free of write contention.
pub async fn react(
    State(state): State<AppState>,
    _identity: CallerIdentity,
    Json(payload): Json<ReactRequest>,
) -> Result<Json<ReactResponse>> {
    let kind = ReactionKind::parse(&payload.kind)
        .ok_or_else(|| AppError::InvalidArg("Type must be like or dislike".to_string()))?;

    let db = state.db.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let write_txn = db.begin_write()?;
        {
            let messages = write_txn.open_table(tables::MESSAGES)?;
            if messages.get(payload.message_id.as_str())?.is_none() {
                return Err(AppError::NotFound("No such message".to_string()));
            }
            drop(messages);

            let now = Utc::now().timestamp_millis();
            let seq = REACTION_SEQ.fetch_add(1, Ordering::Relaxed);
            let event = ReactionEvent::queued(&payload.message_id, kind, now);

            let mut events = write_txn.open_table(tables::REACTION_EVENTS)?;
            let bytes = db::encode(&event)?;
            events.insert((now, seq), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    })
    .await??;

    Ok(Json(ReactResponse {
        code: "OK",
        queued: true,
    }))
}
