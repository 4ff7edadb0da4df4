use axum::{extract::State, Json};
use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{self, tables};
use crate::error::{AppError, Result};
use crate::identity::CallerIdentity;
use crate::models::message::GoodnightMessage;
use crate::models::user::{slot_key_for, UserRecord};
use crate::models::CheckinRecord;
use crate::AppState;

/// Actions a thin client may request through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    DocGet,
    DocSet,
    DocUpdate,
    DocRemove,
    CollectionGet,
    CollectionCount,
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "doc.get" => Some(Action::DocGet),
            "doc.set" => Some(Action::DocSet),
            "doc.update" => Some(Action::DocUpdate),
            "doc.remove" => Some(Action::DocRemove),
            "collection.get" => Some(Action::CollectionGet),
            "collection.count" => Some(Action::CollectionCount),
            _ => None,
        }
    }
}

/// Record kinds exposed through the proxy; anything else is rejected
/// before the store is touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// "self" policy: a user may only touch their own document
    Users,
    /// "owned-by-uid" policy: every query must be scoped to the caller
    Checkins,
    /// "public-read" policy: open reads, owner-only counter patches
    GoodnightMessages,
}

impl RecordKind {
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            "users" => Some(RecordKind::Users),
            "checkins" => Some(RecordKind::Checkins),
            "goodnight_messages" => Some(RecordKind::GoodnightMessages),
            _ => None,
        }
    }

    /// Declared action set; undeclared actions are FORBIDDEN
    pub fn allows(&self, action: Action) -> bool {
        match self {
            RecordKind::Users => matches!(
                action,
                Action::DocGet | Action::DocUpdate | Action::CollectionGet
            ),
            RecordKind::Checkins => matches!(
                action,
                Action::DocGet | Action::CollectionGet | Action::CollectionCount
            ),
            RecordKind::GoodnightMessages => matches!(
                action,
                Action::DocGet
                    | Action::DocUpdate
                    | Action::CollectionGet
                    | Action::CollectionCount
            ),
        }
    }

    /// Fields a query expression may reference for this kind
    pub fn query_fields(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Users => &["id", "uid", "nickname", "slotKey", "targetTime"],
            RecordKind::Checkins => &["uid", "date", "status", "timestamp", "goodnightMessageId"],
            RecordKind::GoodnightMessages => {
                &["uid", "date", "slotKey", "score", "rand", "status", "createdAt"]
            }
        }
    }

    /// Fields a `doc.update` may patch for this kind
    pub fn patch_fields(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Users => &["nickname", "targetTime", "timezoneOffsetMinutes"],
            RecordKind::Checkins => &[],
            RecordKind::GoodnightMessages => &["likes", "dislikes"],
        }
    }
}

/// Typed leaf values of the query language
///
/// Server-timestamp and date markers resolve server-side, so a thin client
/// can say "newer than now minus a week" without shipping clock math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    ServerTimestamp {
        #[serde(rename = "$serverTimestamp")]
        server_timestamp: bool,
    },
    Date {
        #[serde(rename = "$date")]
        millis: i64,
    },
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl QueryValue {
    /// Resolve markers against the server clock
    fn resolve(&self, now_millis: i64) -> Value {
        match self {
            QueryValue::ServerTimestamp { .. } => Value::from(now_millis),
            QueryValue::Date { millis } => Value::from(*millis),
            QueryValue::Bool(b) => Value::from(*b),
            QueryValue::Int(i) => Value::from(*i),
            QueryValue::Float(f) => Value::from(*f),
            QueryValue::Str(s) => Value::from(s.clone()),
        }
    }
}

/// Closed recursive query expression
///
/// The operator set is fixed by construction: an unrecognized `op` tag
/// fails deserialization instead of passing through to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum QueryExpr {
    Eq { field: String, value: QueryValue },
    Ne { field: String, value: QueryValue },
    Gt { field: String, value: QueryValue },
    Ge { field: String, value: QueryValue },
    Lt { field: String, value: QueryValue },
    Le { field: String, value: QueryValue },
    In { field: String, values: Vec<QueryValue> },
    And { clauses: Vec<QueryExpr> },
}

impl QueryExpr {
    /// Every field the expression references
    pub fn fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QueryExpr::Eq { field, .. }
            | QueryExpr::Ne { field, .. }
            | QueryExpr::Gt { field, .. }
            | QueryExpr::Ge { field, .. }
            | QueryExpr::Lt { field, .. }
            | QueryExpr::Le { field, .. }
            | QueryExpr::In { field, .. } => out.push(field),
            QueryExpr::And { clauses } => {
                for clause in clauses {
                    clause.fields(out);
                }
            }
        }
    }

    /// True when the expression pins `field` to exactly `value`
    ///
    /// Used by policies to prove a query cannot leave the caller's own
    /// rows: an `eq`, a single-element `in`, or any conjunct doing either.
    pub fn scopes_to(&self, field: &str, value: &str) -> bool {
        match self {
            QueryExpr::Eq { field: f, value: v } => {
                f == field && matches!(v, QueryValue::Str(s) if s == value)
            }
            QueryExpr::In { field: f, values } => {
                f == field
                    && values.len() == 1
                    && matches!(&values[0], QueryValue::Str(s) if s == value)
            }
            QueryExpr::And { clauses } => clauses.iter().any(|c| c.scopes_to(field, value)),
            _ => false,
        }
    }

    /// Evaluate against a materialized document
    pub fn eval(&self, doc: &Map<String, Value>, now_millis: i64) -> bool {
        match self {
            QueryExpr::Eq { field, value } => {
                compare(doc.get(field), &value.resolve(now_millis)) == Some(std::cmp::Ordering::Equal)
            }
            QueryExpr::Ne { field, value } => {
                compare(doc.get(field), &value.resolve(now_millis))
                    .map(|o| o != std::cmp::Ordering::Equal)
                    .unwrap_or(false)
            }
            QueryExpr::Gt { field, value } => {
                compare(doc.get(field), &value.resolve(now_millis)) == Some(std::cmp::Ordering::Greater)
            }
            QueryExpr::Ge { field, value } => matches!(
                compare(doc.get(field), &value.resolve(now_millis)),
                Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
            ),
            QueryExpr::Lt { field, value } => {
                compare(doc.get(field), &value.resolve(now_millis)) == Some(std::cmp::Ordering::Less)
            }
            QueryExpr::Le { field, value } => matches!(
                compare(doc.get(field), &value.resolve(now_millis)),
                Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
            ),
            QueryExpr::In { field, values } => values.iter().any(|v| {
                compare(doc.get(field), &v.resolve(now_millis)) == Some(std::cmp::Ordering::Equal)
            }),
            QueryExpr::And { clauses } => clauses.iter().all(|c| c.eval(doc, now_millis)),
        }
    }
}

/// Compare a document field with a resolved literal; `None` when the field
/// is missing or the types do not order
fn compare(field: Option<&Value>, literal: &Value) -> Option<std::cmp::Ordering> {
    let field = field?;
    match (field, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderBy {
    pub field: String,
    /// `asc` (default) or `desc`
    #[serde(default)]
    pub direction: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryPayload {
    pub id: Option<String>,
    pub data: Option<Map<String, Value>>,
    /// Raw expression; parsed against the closed operator set in-handler so
    /// a malformed query surfaces as INVALID_ARG, not a transport error
    pub query: Option<Value>,
    #[serde(rename = "orderBy")]
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub payload: QueryPayload,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub code: &'static str,
    pub result: Value,
}

/// Default and maximum page sizes for collection reads
const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

/// Per-kind authorization, evaluated before any store access
///
/// `resolve_uid` is called lazily: only the policies that need the
/// caller's public uid pay for the lookup.
fn authorize(
    kind: RecordKind,
    action: Action,
    id: Option<&str>,
    data: Option<&Map<String, Value>>,
    query: Option<&QueryExpr>,
    identity_key: &str,
    resolve_uid: &mut dyn FnMut() -> Result<String>,
) -> Result<()> {
    // Query field allow-list applies to every kind
    if let Some(expr) = query {
        let mut fields = Vec::new();
        expr.fields(&mut fields);
        for field in fields {
            if !kind.query_fields().contains(&field) {
                return Err(AppError::Forbidden(format!(
                    "Field {} is not queryable for this record kind",
                    field
                )));
            }
        }
    }

    // Patch allow-list applies to every update
    if action == Action::DocUpdate {
        let data = data.ok_or_else(|| {
            AppError::InvalidArg("doc.update requires a data object".to_string())
        })?;
        for field in data.keys() {
            if !kind.patch_fields().contains(&field.as_str()) {
                return Err(AppError::Forbidden(format!(
                    "Field {} is not writable for this record kind",
                    field
                )));
            }
        }
    }

    match kind {
        RecordKind::Users => match action {
            Action::DocGet | Action::DocUpdate => {
                let id = id.ok_or_else(|| {
                    AppError::InvalidArg("Document actions require an id".to_string())
                })?;
                if id != identity_key {
                    return Err(AppError::Forbidden(
                        "Only your own user document is accessible".to_string(),
                    ));
                }
                Ok(())
            }
            Action::CollectionGet => {
                let scoped = query
                    .map(|q| q.scopes_to("id", identity_key))
                    .unwrap_or(false);
                if !scoped {
                    return Err(AppError::Forbidden(
                        "User queries must be scoped to your own id".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(AppError::Forbidden("Action not declared".to_string())),
        },
        RecordKind::Checkins => {
            let uid = resolve_uid()?;
            match action {
                Action::DocGet => {
                    let id = id.ok_or_else(|| {
                        AppError::InvalidArg("Document actions require an id".to_string())
                    })?;
                    if !id.starts_with(&format!("{}#", uid)) {
                        return Err(AppError::Forbidden(
                            "Only your own check-ins are accessible".to_string(),
                        ));
                    }
                    Ok(())
                }
                Action::CollectionGet | Action::CollectionCount => {
                    let scoped = query.map(|q| q.scopes_to("uid", &uid)).unwrap_or(false);
                    if !scoped {
                        return Err(AppError::Forbidden(
                            "Check-in queries must be scoped to your own uid".to_string(),
                        ));
                    }
                    Ok(())
                }
                _ => Err(AppError::Forbidden("Action not declared".to_string())),
            }
        }
        RecordKind::GoodnightMessages => match action {
            Action::DocGet | Action::CollectionGet | Action::CollectionCount => Ok(()),
            Action::DocUpdate => {
                let uid = resolve_uid()?;
                let id = id.ok_or_else(|| {
                    AppError::InvalidArg("Document actions require an id".to_string())
                })?;
                if !id.starts_with(&format!("{}_", uid)) {
                    return Err(AppError::Forbidden(
                        "Only your own message counters are writable".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(AppError::Forbidden("Action not declared".to_string())),
        },
    }
}

/// Materialize one stored record as a JSON document with its key as `id`
fn to_doc<T: Serialize>(id: &str, record: &T) -> Result<Map<String, Value>> {
    let mut doc = match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map,
        _ => return Err(AppError::Internal("record did not serialize to an object".to_string())),
    };
    doc.insert("id".to_string(), Value::from(id));
    Ok(doc)
}

/// Constrained dynamic query endpoint
///
/// Dispatch order: action parse, kind lookup, declared-action check, query
/// parse, policy authorization, and only then the store. The store is
/// never reached by an undeclared kind/action pair.
pub async fn execute_query(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    let action = Action::parse(&request.action).ok_or_else(|| {
        AppError::Forbidden(format!("Unknown action {}", request.action))
    })?;
    let kind = RecordKind::for_name(&request.kind).ok_or_else(|| {
        AppError::Forbidden(format!("Unknown record kind {}", request.kind))
    })?;
    if !kind.allows(action) {
        return Err(AppError::Forbidden(format!(
            "Action {} is not declared for record kind {}",
            request.action, request.kind
        )));
    }

    let query = request
        .payload
        .query
        .clone()
        .map(serde_json::from_value::<QueryExpr>)
        .transpose()
        .map_err(|e| AppError::InvalidArg(format!("Invalid query expression: {}", e)))?;

    let db = state.db.clone();
    let payload = request.payload;

    let result = tokio::task::spawn_blocking(move || -> Result<Value> {
        // Lazy uid resolution: cached after the first policy that asks
        let mut cached_uid: Option<String> = None;
        let resolver_db = db.clone();
        let identity_for_uid = identity.0.clone();
        let mut resolve_uid = move || -> Result<String> {
            if let Some(uid) = &cached_uid {
                return Ok(uid.clone());
            }
            let read_txn = resolver_db.begin_read()?;
            let users = read_txn.open_table(tables::USERS)?;
            let user: UserRecord = users
                .get(identity_for_uid.as_str())?
                .map(|v| db::decode(v.value()))
                .transpose()?
                .ok_or(AppError::Unauthorized)?;
            cached_uid = Some(user.uid.clone());
            Ok(user.uid)
        };

        authorize(
            kind,
            action,
            payload.id.as_deref(),
            payload.data.as_ref(),
            query.as_ref(),
            &identity.0,
            &mut resolve_uid,
        )?;

        let now_millis = Utc::now().timestamp_millis();

        match action {
            Action::DocGet => {
                let id = payload.id.as_deref().unwrap_or_default();
                let read_txn = db.begin_read()?;
                let doc = match kind {
                    RecordKind::Users => {
                        let table = read_txn.open_table(tables::USERS)?;
                        table
                            .get(id)?
                            .map(|v| db::decode::<UserRecord>(v.value()))
                            .transpose()?
                            .map(|r| to_doc(id, &r))
                            .transpose()?
                    }
                    RecordKind::Checkins => {
                        let table = read_txn.open_table(tables::CHECKINS)?;
                        table
                            .get(id)?
                            .map(|v| db::decode::<CheckinRecord>(v.value()))
                            .transpose()?
                            .map(|r| to_doc(id, &r))
                            .transpose()?
                    }
                    RecordKind::GoodnightMessages => {
                        let table = read_txn.open_table(tables::MESSAGES)?;
                        table
                            .get(id)?
                            .map(|v| db::decode::<GoodnightMessage>(v.value()))
                            .transpose()?
                            .map(|r| to_doc(id, &r))
                            .transpose()?
                    }
                };
                // Absence is a normal outcome for a point read
                Ok(doc.map(Value::Object).unwrap_or(Value::Null))
            }
            Action::CollectionGet | Action::CollectionCount => {
                let limit = payload.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
                let read_txn = db.begin_read()?;

                let mut docs: Vec<Map<String, Value>> = Vec::new();
                match kind {
                    RecordKind::Users => {
                        let table = read_txn.open_table(tables::USERS)?;
                        for entry in table.iter()? {
                            let (key, value) = entry?;
                            let record: UserRecord = db::decode(value.value())?;
                            let doc = to_doc(key.value(), &record)?;
                            if query.as_ref().map(|q| q.eval(&doc, now_millis)).unwrap_or(true) {
                                docs.push(doc);
                            }
                        }
                    }
                    RecordKind::Checkins => {
                        let table = read_txn.open_table(tables::CHECKINS)?;
                        for entry in table.iter()? {
                            let (key, value) = entry?;
                            let record: CheckinRecord = db::decode(value.value())?;
                            let doc = to_doc(key.value(), &record)?;
                            if query.as_ref().map(|q| q.eval(&doc, now_millis)).unwrap_or(true) {
                                docs.push(doc);
                            }
                        }
                    }
                    RecordKind::GoodnightMessages => {
                        let table = read_txn.open_table(tables::MESSAGES)?;
                        for entry in table.iter()? {
                            let (key, value) = entry?;
                            let record: GoodnightMessage = db::decode(value.value())?;
                            let doc = to_doc(key.value(), &record)?;
                            if query.as_ref().map(|q| q.eval(&doc, now_millis)).unwrap_or(true) {
                                docs.push(doc);
                            }
                        }
                    }
                }

                if action == Action::CollectionCount {
                    return Ok(Value::from(docs.len()));
                }

                if let Some(order_by) = &payload.order_by {
                    let descending = order_by.direction.as_deref() == Some("desc");
                    docs.sort_by(|a, b| {
                        let ord = compare(a.get(&order_by.field), b.get(&order_by.field).unwrap_or(&Value::Null))
                            .unwrap_or(std::cmp::Ordering::Equal);
                        if descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    });
                }
                docs.truncate(limit);

                Ok(Value::Array(docs.into_iter().map(Value::Object).collect()))
            }
            Action::DocUpdate => {
                let id = payload.id.as_deref().unwrap_or_default();
                let data = payload.data.as_ref().ok_or_else(|| {
                    AppError::InvalidArg("doc.update requires a data object".to_string())
                })?;

                let write_txn = db.begin_write()?;
                let doc = match kind {
                    RecordKind::Users => {
                        let mut table = write_txn.open_table(tables::USERS)?;
                        let mut record: UserRecord = table
                            .get(id)?
                            .map(|v| db::decode(v.value()))
                            .transpose()?
                            .ok_or_else(|| AppError::NotFound("No such user".to_string()))?;

                        if let Some(nickname) = data.get("nickname").and_then(Value::as_str) {
                            record.nickname = nickname.to_string();
                        }
                        if let Some(offset) =
                            data.get("timezoneOffsetMinutes").and_then(Value::as_i64)
                        {
                            record.timezone_offset_minutes = offset as i32;
                        }
                        if let Some(target_time) = data.get("targetTime").and_then(Value::as_str) {
                            record.slot_key = slot_key_for(target_time).ok_or_else(|| {
                                AppError::InvalidArg("Target time must be HH:MM".to_string())
                            })?;
                            record.target_time = target_time.to_string();
                        }

                        let bytes = db::encode(&record)?;
                        table.insert(id, bytes.as_slice())?;
                        to_doc(id, &record)?
                    }
                    RecordKind::GoodnightMessages => {
                        let mut table = write_txn.open_table(tables::MESSAGES)?;
                        let mut record: GoodnightMessage = table
                            .get(id)?
                            .map(|v| db::decode(v.value()))
                            .transpose()?
                            .ok_or_else(|| AppError::NotFound("No such message".to_string()))?;

                        if let Some(likes) = data.get("likes").and_then(Value::as_i64) {
                            record.likes = likes;
                        }
                        if let Some(dislikes) = data.get("dislikes").and_then(Value::as_i64) {
                            record.dislikes = dislikes;
                        }
                        record.score = record.likes - record.dislikes;

                        let bytes = db::encode(&record)?;
                        table.insert(id, bytes.as_slice())?;
                        to_doc(id, &record)?
                    }
                    // Check-ins are immutable; doc.update is not declared
                    RecordKind::Checkins => {
                        return Err(AppError::Forbidden("Action not declared".to_string()))
                    }
                };
                write_txn.commit()?;
                Ok(Value::Object(doc))
            }
            // No record kind declares doc.set or doc.remove
            Action::DocSet | Action::DocRemove => {
                Err(AppError::Forbidden("Action not declared".to_string()))
            }
        }
    })
    .await??;

    Ok(Json(QueryResponse { code: "OK", result }))
}
