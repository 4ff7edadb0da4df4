use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use rand::Rng;
use redb::{ReadableDatabase, ReadableTable};
use serde::Deserialize;

use crate::constants::{
    DEFAULT_TARGET_TIME, UID_ALPHABET, UID_MAX_ATTEMPTS, UID_MAX_LEN, UID_MIN_LEN,
};
use crate::db::{self, tables, Db};
use crate::error::{AppError, Result};
use crate::models::user::{slot_key_for, UserRecord};

/// Header carrying the caller's exchanged identity key
///
/// The platform login-code exchange happens outside this server; handlers
/// only ever see the resulting opaque key.
pub const IDENTITY_HEADER: &str = "x-identity-key";

/// Caller identity extracted from the request headers
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub String);

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let key = parts
            .headers
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(AppError::Unauthorized)?;

        Ok(CallerIdentity(key.to_string()))
    }
}

/// Source of candidate uids, injectable so tests can force collisions
pub trait UidSource {
    fn draw(&mut self) -> String;
}

/// Production source: 8-10 chars drawn from the unambiguous alphabet
pub struct RandomUidSource;

impl UidSource for RandomUidSource {
    fn draw(&mut self) -> String {
        let mut rng = rand::rng();
        let len = rng.random_range(UID_MIN_LEN..=UID_MAX_LEN);
        (0..len)
            .map(|_| UID_ALPHABET[rng.random_range(0..UID_ALPHABET.len())] as char)
            .collect()
    }
}

/// Draw uids until one passes the existence probe
///
/// Bounded at `UID_MAX_ATTEMPTS`; exhaustion is an internal error, not a
/// retry loop the caller has to manage.
pub fn generate_uid<E>(source: &mut dyn UidSource, mut exists: E) -> Result<String>
where
    E: FnMut(&str) -> Result<bool>,
{
    for _ in 0..UID_MAX_ATTEMPTS {
        let candidate = source.draw();
        if !exists(&candidate)? {
            return Ok(candidate);
        }
    }

    tracing::error!(
        "Uid generation exhausted after {} attempts",
        UID_MAX_ATTEMPTS
    );
    Err(AppError::Internal("uid generation exhausted".to_string()))
}

/// Creation-time profile overrides; ignored for existing users
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileOverrides {
    pub nickname: Option<String>,
    #[serde(rename = "targetTime")]
    pub target_time: Option<String>,
    #[serde(rename = "timezoneOffsetMinutes")]
    pub timezone_offset_minutes: Option<i32>,
}

/// Resolve an identity key to its user, creating the user on first contact
///
/// Returns the record plus whether this call created it. Idempotent: a
/// pre-existing user short-circuits before any write.
pub fn ensure_user(
    db: &Db,
    identity_key: &str,
    overrides: &ProfileOverrides,
    source: &mut dyn UidSource,
) -> Result<(UserRecord, bool)> {
    let write_txn = db.begin_write()?;
    let (record, created) = {
        let mut users = write_txn.open_table(tables::USERS)?;

        let existing: Option<UserRecord> = users
            .get(identity_key)?
            .map(|v| db::decode(v.value()))
            .transpose()?;

        if let Some(record) = existing {
            (record, false)
        } else {
            let mut uids = write_txn.open_table(tables::UIDS)?;

            let uid = generate_uid(source, |candidate| {
                Ok(uids.get(candidate)?.is_some())
            })?;

            let target_time = overrides
                .target_time
                .clone()
                .unwrap_or_else(|| DEFAULT_TARGET_TIME.to_string());
            let slot_key = slot_key_for(&target_time)
                .ok_or_else(|| AppError::InvalidArg("Target time must be HH:MM".to_string()))?;

            let record = UserRecord {
                uid: uid.clone(),
                nickname: overrides.nickname.clone().unwrap_or_default(),
                timezone_offset_minutes: overrides.timezone_offset_minutes.unwrap_or(0),
                target_time,
                slot_key,
                today_status: None,
                streak: 0,
                total_days: 0,
                last_checkin_date: None,
                created_at: Utc::now().timestamp(),
            };

            let bytes = db::encode(&record)?;
            users.insert(identity_key, bytes.as_slice())?;
            uids.insert(uid.as_str(), identity_key)?;

            tracing::info!("New user created with uid {}", uid);
            (record, true)
        }
    };
    write_txn.commit()?;

    Ok((record, created))
}

/// Look up an existing user by identity key; absence is `UNAUTHORIZED`
/// (the caller never completed first contact)
pub fn require_user(db: &Db, identity_key: &str) -> Result<UserRecord> {
    let read_txn = db.begin_read()?;
    let users = read_txn.open_table(tables::USERS)?;
    let record = users
        .get(identity_key)?
        .map(|v| db::decode::<UserRecord>(v.value()))
        .transpose()?
        .ok_or(AppError::Unauthorized)?;
    Ok(record)
}
