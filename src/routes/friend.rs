use axum::{extract::State, Json};
use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use crate::constants::ERR_SELF_REQUEST;
use crate::db::{self, tables};
use crate::error::{AppError, Result};
use crate::identity::{generate_uid, require_user, CallerIdentity, RandomUidSource};
use crate::models::friend::{edge_key, pending_key, FriendRequest, RequestStatus};
use crate::models::user::{validate_uid, UserRecord};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SendRequestRequest {
    #[serde(rename = "toUid")]
    pub to_uid: String,
}

#[derive(Debug, Serialize)]
pub struct SendRequestResponse {
    pub code: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub request: FriendRequest,
}

/// Send a friend request from the caller to another uid
///
/// Rejected when the pair is already friends or an identical pending
/// request exists; both are domain-level `ALREADY_EXISTS`, not races.
pub async fn send_request(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(payload): Json<SendRequestRequest>,
) -> Result<Json<SendRequestResponse>> {
    if !validate_uid(&payload.to_uid) {
        return Err(AppError::InvalidArg("Invalid uid format".to_string()));
    }

    let db = state.db.clone();

    let (request_id, request) =
        tokio::task::spawn_blocking(move || -> Result<(String, FriendRequest)> {
            let caller = require_user(&db, &identity.0)?;
            if caller.uid == payload.to_uid {
                return Err(AppError::InvalidArg(ERR_SELF_REQUEST.to_string()));
            }

            let write_txn = db.begin_write()?;
            let outcome = {
                let uids = write_txn.open_table(tables::UIDS)?;
                if uids.get(payload.to_uid.as_str())?.is_none() {
                    return Err(AppError::NotFound("No such user".to_string()));
                }
                drop(uids);

                let edges = write_txn.open_table(tables::FRIEND_EDGES)?;
                let edge = edge_key(&caller.uid, &payload.to_uid);
                if edges.get(edge.as_str())?.is_some() {
                    return Err(AppError::AlreadyExists("Already friends".to_string()));
                }
                drop(edges);

                let mut pending = write_txn.open_table(tables::PENDING_REQUESTS)?;
                let pending_idx = pending_key(&caller.uid, &payload.to_uid);
                if pending.get(pending_idx.as_str())?.is_some() {
                    return Err(AppError::AlreadyExists(
                        "A pending request for this pair already exists".to_string(),
                    ));
                }

                let mut requests = write_txn.open_table(tables::FRIEND_REQUESTS)?;
                let request_id = generate_uid(&mut RandomUidSource, |candidate| {
                    Ok(requests.get(candidate)?.is_some())
                })?;

                let request = FriendRequest {
                    from_uid: caller.uid.clone(),
                    to_uid: payload.to_uid.clone(),
                    status: RequestStatus::Pending,
                    created_at: Utc::now().timestamp(),
                };
                let bytes = db::encode(&request)?;
                requests.insert(request_id.as_str(), bytes.as_slice())?;
                pending.insert(pending_idx.as_str(), request_id.as_str())?;

                (request_id, request)
            };
            write_txn.commit()?;
            Ok(outcome)
        })
        .await??;

    tracing::info!(
        "Friend request {} from {} to {}",
        request_id,
        request.from_uid,
        request.to_uid
    );

    Ok(Json(SendRequestResponse {
        code: "OK",
        request_id,
        request,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequestRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// `accepted` or `rejected`
    pub decision: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveRequestResponse {
    pub code: &'static str,
    pub status: RequestStatus,
    /// Set when the resolution (or an earlier one) created the edge
    #[serde(rename = "edgeKey")]
    pub edge_key: Option<String>,
}

/// Accept or reject a friend request addressed to the caller
///
/// Runs as one write transaction across the request, pending-index, and
/// edge tables, so the status flip, index removal, and edge creation are
/// atomic. Resolving an already-resolved request returns its terminal
/// status idempotently with no further writes.
pub async fn resolve_request(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(payload): Json<ResolveRequestRequest>,
) -> Result<Json<ResolveRequestResponse>> {
    let decision = match payload.decision.as_str() {
        "accepted" => RequestStatus::Accepted,
        "rejected" => RequestStatus::Rejected,
        _ => {
            return Err(AppError::InvalidArg(
                "Decision must be accepted or rejected".to_string(),
            ))
        }
    };

    let db = state.db.clone();
    let request_id = payload.request_id.clone();

    let (status, edge) =
        tokio::task::spawn_blocking(move || -> Result<(RequestStatus, Option<String>)> {
            let caller = require_user(&db, &identity.0)?;

            let write_txn = db.begin_write()?;
            let outcome = {
                let mut requests = write_txn.open_table(tables::FRIEND_REQUESTS)?;

                let mut request: FriendRequest = requests
                    .get(payload.request_id.as_str())?
                    .map(|v| db::decode(v.value()))
                    .transpose()?
                    .ok_or_else(|| AppError::NotFound("No such request".to_string()))?;

                if request.to_uid != caller.uid {
                    return Err(AppError::Unauthorized);
                }

                if request.status != RequestStatus::Pending {
                    // Terminal already; repeated resolution is a no-op
                    let edge = match request.status {
                        RequestStatus::Accepted => {
                            Some(edge_key(&request.from_uid, &request.to_uid))
                        }
                        _ => None,
                    };
                    (request.status, edge)
                } else {
                    let edge = if decision == RequestStatus::Accepted {
                        let mut edges = write_txn.open_table(tables::FRIEND_EDGES)?;
                        let key = edge_key(&request.from_uid, &request.to_uid);
                        // The existence check and the write share the
                        // transaction, so a doubly-resolved request cannot
                        // produce two edges
                        if edges.get(key.as_str())?.is_none() {
                            let edge = crate::models::friend::FriendshipEdge {
                                uid_a: key.split('#').next().unwrap_or_default().to_string(),
                                uid_b: key.split('#').nth(1).unwrap_or_default().to_string(),
                                created_at: Utc::now().timestamp(),
                            };
                            let bytes = db::encode(&edge)?;
                            edges.insert(key.as_str(), bytes.as_slice())?;
                        }
                        Some(key)
                    } else {
                        None
                    };

                    request.status = decision;
                    let bytes = db::encode(&request)?;
                    requests.insert(payload.request_id.as_str(), bytes.as_slice())?;

                    let mut pending = write_txn.open_table(tables::PENDING_REQUESTS)?;
                    pending.remove(pending_key(&request.from_uid, &request.to_uid).as_str())?;

                    (decision, edge)
                }
            };
            write_txn.commit()?;
            Ok(outcome)
        })
        .await??;

    tracing::info!("Friend request {} resolved: {}", request_id, status.as_str());

    Ok(Json(ResolveRequestResponse {
        code: "OK",
        status,
        edge_key: edge,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RemoveFriendRequest {
    pub uid: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveFriendResponse {
    pub code: &'static str,
    /// False when no edge existed; removal is idempotent either way
    pub removed: bool,
}

/// Remove the friendship edge between the caller and another uid
pub async fn remove_friend(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(payload): Json<RemoveFriendRequest>,
) -> Result<Json<RemoveFriendResponse>> {
    if !validate_uid(&payload.uid) {
        return Err(AppError::InvalidArg("Invalid uid format".to_string()));
    }

    let db = state.db.clone();

    let removed = tokio::task::spawn_blocking(move || -> Result<bool> {
        let caller = require_user(&db, &identity.0)?;
        let key = edge_key(&caller.uid, &payload.uid);

        let write_txn = db.begin_write()?;
        let removed = {
            let mut edges = write_txn.open_table(tables::FRIEND_EDGES)?;
            let removed = edges.remove(key.as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    })
    .await??;

    Ok(Json(RemoveFriendResponse {
        code: "OK",
        removed,
    }))
}

#[derive(Debug, Serialize)]
pub struct FriendView {
    pub uid: String,
    pub nickname: String,
    #[serde(rename = "slotKey")]
    pub slot_key: String,
    pub streak: u32,
}

#[derive(Debug, Serialize)]
pub struct ListFriendsResponse {
    pub code: &'static str,
    pub friends: Vec<FriendView>,
}

/// List the caller's friends with their public profile fields
pub async fn list_friends(
    State(state): State<AppState>,
    identity: CallerIdentity,
) -> Result<Json<ListFriendsResponse>> {
    let db = state.db.clone();

    let friends = tokio::task::spawn_blocking(move || -> Result<Vec<FriendView>> {
        let caller = require_user(&db, &identity.0)?;

        let read_txn = db.begin_read()?;
        let edges = read_txn.open_table(tables::FRIEND_EDGES)?;
        let uids = read_txn.open_table(tables::UIDS)?;
        let users = read_txn.open_table(tables::USERS)?;

        let mut friends = Vec::new();
        for entry in edges.iter()? {
            let (key, _) = entry?;
            let key = key.value();
            let Some((a, b)) = key.split_once('#') else {
                continue;
            };
            let other = if a == caller.uid {
                b
            } else if b == caller.uid {
                a
            } else {
                continue;
            };

            // Resolve uid -> identity -> user for the public fields
            let Some(identity_key) = uids.get(other)? else {
                continue;
            };
            let Some(user_bytes) = users.get(identity_key.value())? else {
                continue;
            };
            let user: UserRecord = db::decode(user_bytes.value())?;
            friends.push(FriendView {
                uid: user.uid,
                nickname: user.nickname,
                slot_key: user.slot_key,
                streak: user.streak,
            });
        }
        Ok(friends)
    })
    .await??;

    Ok(Json(ListFriendsResponse {
        code: "OK",
        friends,
    }))
}

#[derive(Debug, Serialize)]
pub struct PendingRequestView {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "fromUid")]
    pub from_uid: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct ListRequestsResponse {
    pub code: &'static str,
    pub requests: Vec<PendingRequestView>,
}

/// List pending friend requests addressed to the caller
pub async fn list_requests(
    State(state): State<AppState>,
    identity: CallerIdentity,
) -> Result<Json<ListRequestsResponse>> {
    let db = state.db.clone();

    let requests = tokio::task::spawn_blocking(move || -> Result<Vec<PendingRequestView>> {
        let caller = require_user(&db, &identity.0)?;

        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(tables::FRIEND_REQUESTS)?;

        let mut requests = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let request: FriendRequest = db::decode(value.value())?;
            if request.to_uid == caller.uid && request.status == RequestStatus::Pending {
                requests.push(PendingRequestView {
                    request_id: key.value().to_string(),
                    from_uid: request.from_uid,
                    created_at: request.created_at,
                });
            }
        }
        Ok(requests)
    })
    .await??;

    Ok(Json(ListRequestsResponse {
        code: "OK",
        requests,
    }))
}
