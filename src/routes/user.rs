use axum::{extract::State, Json};
use redb::ReadableTable;
use serde::Serialize;

use crate::db::{self, tables};
use crate::error::{AppError, Result};
use crate::identity::{ensure_user, CallerIdentity, ProfileOverrides, RandomUidSource};
use crate::models::user::{slot_key_for, UserRecord};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct EnsureUserResponse {
    pub code: &'static str,
    pub user: UserRecord,
    pub created: bool,
}

/// Resolve the caller to a user record, creating one on first contact
///
/// Overrides in the body apply only when this call creates the user; an
/// existing user is returned unchanged.
pub async fn ensure_user_handler(
    State(state): State<AppState>,
    identity: CallerIdentity,
    payload: Option<Json<ProfileOverrides>>,
) -> Result<Json<EnsureUserResponse>> {
    let overrides = payload.map(|Json(p)| p).unwrap_or_default();

    if let Some(target_time) = overrides.target_time.as_deref() {
        if slot_key_for(target_time).is_none() {
            return Err(AppError::InvalidArg("Target time must be HH:MM".to_string()));
        }
    }

    let db = state.db.clone();
    let (user, created) = tokio::task::spawn_blocking(move || {
        ensure_user(&db, &identity.0, &overrides, &mut RandomUidSource)
    })
    .await??;

    Ok(Json(EnsureUserResponse {
        code: "OK",
        user,
        created,
    }))
}

#[derive(Debug, Serialize)]
pub struct UpdateProfileResponse {
    pub code: &'static str,
    pub user: UserRecord,
}

/// Update the caller's own profile fields
///
/// Only nickname, target time, and timezone offset are writable; the slot
/// key is recomputed whenever the target time changes.
pub async fn update_profile(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(payload): Json<ProfileOverrides>,
) -> Result<Json<UpdateProfileResponse>> {
    let db = state.db.clone();

    let user = tokio::task::spawn_blocking(move || -> Result<UserRecord> {
        let write_txn = db.begin_write()?;
        let record = {
            let mut users = write_txn.open_table(tables::USERS)?;

            let mut record: UserRecord = users
                .get(identity.0.as_str())?
                .map(|v| db::decode(v.value()))
                .transpose()?
                .ok_or(AppError::Unauthorized)?;

            if let Some(nickname) = payload.nickname {
                record.nickname = nickname;
            }
            if let Some(offset) = payload.timezone_offset_minutes {
                record.timezone_offset_minutes = offset;
            }
            if let Some(target_time) = payload.target_time {
                record.slot_key = slot_key_for(&target_time).ok_or_else(|| {
                    AppError::InvalidArg("Target time must be HH:MM".to_string())
                })?;
                record.target_time = target_time;
            }

            let bytes = db::encode(&record)?;
            users.insert(identity.0.as_str(), bytes.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    })
    .await??;

    Ok(Json(UpdateProfileResponse { code: "OK", user }))
}
