use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use crate::constants::{ERR_INVALID_DATE, ERR_INVALID_STATUS};
use crate::db::{self, tables};
use crate::error::{AppError, Result};
use crate::identity::{require_user, CallerIdentity};
use crate::models::checkin::{apply_checkin, checkin_key, validate_date, CheckinRecord, CheckinStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitCheckinRequest {
    /// `YYYYMMDD`
    pub date: String,
    pub status: String,
    #[serde(rename = "timezoneOffsetMinutes")]
    pub timezone_offset_minutes: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct SubmitCheckinResponse {
    pub code: &'static str,
    pub record: CheckinRecord,
    /// True when an earlier submission already created the record; the
    /// stored record is returned and the call still succeeds
    pub duplicate: bool,
}

/// Record the caller's daily check-in
///
/// At most one record ever exists per (uid, date). The get-then-insert runs
/// inside a single write transaction, so a concurrent duplicate submission
/// observes the winner's record instead of double-writing; duplicates are a
/// success outcome, never an error.
pub async fn submit_checkin(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(payload): Json<SubmitCheckinRequest>,
) -> Result<Json<SubmitCheckinResponse>> {
    if !validate_date(&payload.date) {
        return Err(AppError::InvalidArg(ERR_INVALID_DATE.to_string()));
    }
    let status = CheckinStatus::parse(&payload.status)
        .ok_or_else(|| AppError::InvalidArg(ERR_INVALID_STATUS.to_string()))?;

    let db = state.db.clone();

    let (record, duplicate) =
        tokio::task::spawn_blocking(move || -> Result<(CheckinRecord, bool)> {
            let user = require_user(&db, &identity.0)?;
            let key = checkin_key(&user.uid, &payload.date);

            let write_txn = db.begin_write()?;
            let outcome = {
                let mut checkins = write_txn.open_table(tables::CHECKINS)?;

                let existing: Option<CheckinRecord> = checkins
                    .get(key.as_str())?
                    .map(|v| db::decode(v.value()))
                    .transpose()?;

                if let Some(record) = existing {
                    // A concurrent or repeated submission won the race;
                    // return the stored record as a duplicate outcome
                    (record, true)
                } else {
                    let record = CheckinRecord {
                        uid: user.uid.clone(),
                        date: payload.date.clone(),
                        status,
                        timezone_offset_minutes: payload
                            .timezone_offset_minutes
                            .unwrap_or(user.timezone_offset_minutes),
                        timestamp: Utc::now().timestamp(),
                        goodnight_message_id: None,
                    };
                    let bytes = db::encode(&record)?;
                    checkins.insert(key.as_str(), bytes.as_slice())?;

                    // Date index row for the rollup job's day scan
                    let mut by_date = write_txn.open_table(tables::CHECKINS_BY_DATE)?;
                    let index_key = format!("{}#{}", payload.date, user.uid);
                    by_date.insert(index_key.as_str(), ())?;

                    // Streak bookkeeping on the owning user record
                    let mut users = write_txn.open_table(tables::USERS)?;
                    let mut owner = user;
                    apply_checkin(&mut owner, &payload.date, status);
                    let owner_bytes = db::encode(&owner)?;
                    users.insert(identity.0.as_str(), owner_bytes.as_slice())?;

                    (record, false)
                }
            };
            write_txn.commit()?;
            Ok(outcome)
        })
        .await??;

    if duplicate {
        tracing::info!("Duplicate check-in for {} on {}", record.uid, record.date);
    } else {
        tracing::info!(
            "Check-in stored for {} on {}: {}",
            record.uid,
            record.date,
            record.status.as_str()
        );
    }

    Ok(Json(SubmitCheckinResponse {
        code: "OK",
        record,
        duplicate,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GetCheckinParams {
    /// `YYYYMMDD`
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct GetCheckinResponse {
    pub code: &'static str,
    /// `null` when the caller has not checked in on that date; absence is a
    /// normal outcome, not an error
    pub record: Option<CheckinRecord>,
}

/// Fetch the caller's check-in for one date
pub async fn get_checkin(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Query(params): Query<GetCheckinParams>,
) -> Result<Json<GetCheckinResponse>> {
    if !validate_date(&params.date) {
        return Err(AppError::InvalidArg(ERR_INVALID_DATE.to_string()));
    }

    let db = state.db.clone();

    let record = tokio::task::spawn_blocking(move || -> Result<Option<CheckinRecord>> {
        let user = require_user(&db, &identity.0)?;
        let key = checkin_key(&user.uid, &params.date);

        let read_txn = db.begin_read()?;
        let checkins = read_txn.open_table(tables::CHECKINS)?;
        checkins
            .get(key.as_str())?
            .map(|v| db::decode(v.value()))
            .transpose()
    })
    .await??;

    Ok(Json(GetCheckinResponse { code: "OK", record }))
}
