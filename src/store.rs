//! Schema-less document store over the workspace SQLite file.
//!
//! Documents are JSON objects grouped by collection. Reads are equality
//! filters with an optional single-field ordering; writes go through bounded
//! batches that commit atomically. Live listeners receive the full matching
//! set after every committed mutation of their collection.

use crate::db;
use anyhow::{anyhow, bail, Context};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{self, Receiver, Sender};

pub const MAX_BATCH_LIMIT: usize = 500;
pub const DEFAULT_BATCH_LIMIT: usize = 450;

const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub data: Document,
}

impl Snapshot {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Self {
            collection: name.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        data: Document,
    },
    Update {
        collection: String,
        id: String,
        fields: Document,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, collection: &str, id: &str, data: Document) -> &mut Self {
        self.ops.push(WriteOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
        self
    }

    pub fn update(&mut self, collection: &str, id: &str, fields: Document) -> &mut Self {
        self.ops.push(WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
        self
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Sequential chunked commit that stopped part way. Earlier chunks stay
/// committed.
#[derive(Debug, thiserror::Error)]
#[error("write batch {failed_batch} of {total_batches} failed after {committed_writes} committed writes: {reason}")]
pub struct BatchFailure {
    pub committed_writes: usize,
    pub committed_batches: usize,
    pub failed_batch: usize,
    pub total_batches: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkedCommit {
    pub batches: usize,
    pub writes: usize,
    pub touched: usize,
}

struct Listener {
    query: Query,
    tx: Sender<Vec<Snapshot>>,
}

type ListenerMap = RefCell<HashMap<u64, Listener>>;

/// Handle for a live listener. Removing it (or dropping it) stops delivery.
pub struct ListenerRegistration {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl ListenerRegistration {
    pub fn remove(self) {}
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.borrow_mut().remove(&self.id);
        }
    }
}

pub struct DocumentStore {
    conn: Connection,
    batch_limit: usize,
    listeners: Rc<ListenerMap>,
    next_listener_id: Cell<u64>,
    tx_depth: Cell<u32>,
    pending: RefCell<BTreeSet<String>>,
}

/// Placeholder replaced with the store clock when the document is written.
pub fn server_timestamp() -> Value {
    let mut marker = Map::new();
    marker.insert(SERVER_TIMESTAMP_KEY.to_string(), Value::Bool(true));
    Value::Object(marker)
}

impl DocumentStore {
    pub fn new(conn: Connection, batch_limit: usize) -> Self {
        Self {
            conn,
            batch_limit: batch_limit.clamp(1, MAX_BATCH_LIMIT),
            listeners: Rc::new(RefCell::new(HashMap::new())),
            next_listener_id: Cell::new(1),
            tx_depth: Cell::new(0),
            pending: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn open(workspace: &Path, batch_limit: usize) -> anyhow::Result<Self> {
        Ok(Self::new(db::open_db(workspace)?, batch_limit))
    }

    #[cfg(test)]
    pub fn in_memory(batch_limit: usize) -> anyhow::Result<Self> {
        Ok(Self::new(db::open_in_memory()?, batch_limit))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Snapshot>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ? AND id = ?",
                (collection, id),
                |r| r.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {}/{}", collection, id))?;
        let Some(body) = body else {
            return Ok(None);
        };
        let data: Document = serde_json::from_str(&body)
            .with_context(|| format!("document {}/{} is not a JSON object", collection, id))?;
        Ok(Some(Snapshot {
            id: id.to_string(),
            data,
        }))
    }

    pub fn query(&self, query: &Query) -> anyhow::Result<Vec<Snapshot>> {
        let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(query.collection.clone())];
        for (field, value) in &query.filters {
            let path = json_path(field)?;
            if value.is_null() {
                sql.push_str(&format!(" AND json_extract(body, '{}') IS NULL", path));
            } else {
                sql.push_str(&format!(" AND json_extract(body, '{}') = ?", path));
                params.push(to_sql_value(value)?);
            }
        }
        match &query.order_by {
            Some((field, direction)) => {
                let dir = match direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                // Equal keys fall back to insertion order.
                sql.push_str(&format!(
                    " ORDER BY json_extract(body, '{}') {dir}, rowid {dir}",
                    json_path(field)?,
                    dir = dir
                ));
            }
            None => sql.push_str(" ORDER BY rowid"),
        }
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare query on {}", query.collection))?;
        let rows = stmt
            .query_map(params_from_iter(params), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to query {}", query.collection))?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            match serde_json::from_str::<Document>(&body) {
                Ok(data) => out.push(Snapshot { id, data }),
                Err(e) => {
                    tracing::warn!(collection = %query.collection, %id, error = %e, "skipping unreadable document")
                }
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self, collection: &str) -> anyhow::Result<bool> {
        Ok(self.query(&Query::collection(collection).limit(1))?.is_empty())
    }

    /// Writes a new document under a store-assigned id.
    pub fn add(&self, collection: &str, data: Document) -> anyhow::Result<String> {
        let id = new_document_id();
        self.set(collection, &id, data)?;
        Ok(id)
    }

    pub fn set(&self, collection: &str, id: &str, data: Document) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new();
        batch.set(collection, id, data);
        self.commit(batch)?;
        Ok(())
    }

    pub fn update(&self, collection: &str, id: &str, fields: Document) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new();
        batch.update(collection, id, fields);
        self.commit(batch)?;
        Ok(())
    }

    pub fn delete(&self, collection: &str, id: &str) -> anyhow::Result<bool> {
        let mut batch = WriteBatch::new();
        batch.delete(collection, id);
        Ok(self.commit(batch)? > 0)
    }

    /// Applies every op of the batch or none of them. Returns how many
    /// documents were written or removed.
    pub fn commit(&self, batch: WriteBatch) -> anyhow::Result<usize> {
        if batch.len() > self.batch_limit {
            bail!(
                "write batch has {} ops, limit is {}",
                batch.len(),
                self.batch_limit
            );
        }
        if batch.is_empty() {
            return Ok(0);
        }
        self.atomically(|| {
            let mut touched = 0usize;
            for op in &batch.ops {
                touched += self.apply(op)?;
            }
            Ok(touched)
        })
    }

    /// Splits `ops` into batches of at most the batch limit and commits them
    /// one after another. A failing batch stops the run; nothing already
    /// committed is undone.
    pub fn commit_chunked(&self, ops: Vec<WriteOp>) -> anyhow::Result<ChunkedCommit> {
        let total_batches = ops.len().div_ceil(self.batch_limit);
        let mut out = ChunkedCommit::default();
        let mut iter = ops.into_iter();
        loop {
            let chunk: Vec<WriteOp> = iter.by_ref().take(self.batch_limit).collect();
            if chunk.is_empty() {
                break;
            }
            let size = chunk.len();
            match self.commit(WriteBatch { ops: chunk }) {
                Ok(touched) => {
                    out.batches += 1;
                    out.writes += size;
                    out.touched += touched;
                    tracing::debug!(
                        batch = out.batches,
                        total_batches,
                        size,
                        "committed write batch"
                    );
                }
                Err(e) => {
                    return Err(BatchFailure {
                        committed_writes: out.writes,
                        committed_batches: out.batches,
                        failed_batch: out.batches + 1,
                        total_batches,
                        reason: format!("{e:#}"),
                    }
                    .into())
                }
            }
        }
        Ok(out)
    }

    /// Runs `f` inside a savepoint. Reads and writes issued by `f` see each
    /// other; listeners are notified only once the outermost call commits.
    pub fn atomically<T>(&self, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        let depth = self.tx_depth.get();
        self.conn
            .execute_batch("SAVEPOINT ibadah_write")
            .context("failed to open write transaction")?;
        self.tx_depth.set(depth + 1);
        let result = f();
        self.tx_depth.set(depth);

        match result {
            Ok(v) => {
                if let Err(e) = self.conn.execute_batch("RELEASE ibadah_write") {
                    let _ = self
                        .conn
                        .execute_batch("ROLLBACK TO ibadah_write; RELEASE ibadah_write");
                    if depth == 0 {
                        self.pending.borrow_mut().clear();
                    }
                    return Err(anyhow!(e).context("failed to commit write transaction"));
                }
                if depth == 0 {
                    self.flush_notifications();
                }
                Ok(v)
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch("ROLLBACK TO ibadah_write; RELEASE ibadah_write");
                if depth == 0 {
                    self.pending.borrow_mut().clear();
                }
                Err(e)
            }
        }
    }

    /// Registers a live listener. The current matching set is delivered
    /// immediately; later deliveries follow each committed change to the
    /// collection.
    pub fn listen(
        &self,
        query: Query,
    ) -> anyhow::Result<(ListenerRegistration, Receiver<Vec<Snapshot>>)> {
        let initial = self.query(&query)?;
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(initial);

        let id = self.next_listener_id.get();
        self.next_listener_id.set(id + 1);
        self.listeners
            .borrow_mut()
            .insert(id, Listener { query, tx });
        Ok((
            ListenerRegistration {
                id,
                listeners: Rc::downgrade(&self.listeners),
            },
            rx,
        ))
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    fn apply(&self, op: &WriteOp) -> anyhow::Result<usize> {
        let touched = match op {
            WriteOp::Set {
                collection,
                id,
                data,
            } => {
                let mut data = data.clone();
                resolve_sentinels(&mut data);
                self.write_body(collection, id, &data)?;
                1
            }
            WriteOp::Update {
                collection,
                id,
                fields,
            } => {
                let Some(mut existing) = self.get(collection, id)? else {
                    bail!("document {}/{} does not exist", collection, id);
                };
                for (k, v) in fields {
                    existing.data.insert(k.clone(), v.clone());
                }
                resolve_sentinels(&mut existing.data);
                self.write_body(collection, id, &existing.data)?;
                1
            }
            WriteOp::Delete { collection, id } => self
                .conn
                .execute(
                    "DELETE FROM documents WHERE collection = ? AND id = ?",
                    (collection, id),
                )
                .with_context(|| format!("failed to delete {}/{}", collection, id))?,
        };
        if touched > 0 {
            self.pending
                .borrow_mut()
                .insert(op.collection().to_string());
        }
        Ok(touched)
    }

    fn write_body(&self, collection: &str, id: &str, data: &Document) -> anyhow::Result<()> {
        let body = serde_json::to_string(data)?;
        self.conn
            .execute(
                "INSERT INTO documents(collection, id, body, updated_at) VALUES(?, ?, ?, ?)
                 ON CONFLICT(collection, id) DO UPDATE SET
                   body = excluded.body,
                   updated_at = excluded.updated_at",
                (collection, id, body, now_rfc3339()),
            )
            .with_context(|| format!("failed to write {}/{}", collection, id))?;
        Ok(())
    }

    fn flush_notifications(&self) {
        let touched = std::mem::take(&mut *self.pending.borrow_mut());
        if touched.is_empty() {
            return;
        }
        let mut dead: Vec<u64> = Vec::new();
        {
            let listeners = self.listeners.borrow();
            for (id, listener) in listeners.iter() {
                if !touched.contains(&listener.query.collection) {
                    continue;
                }
                match self.query(&listener.query) {
                    Ok(snapshot) => {
                        if listener.tx.send(snapshot).is_err() {
                            dead.push(*id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(listener = id, error = %format!("{e:#}"), "listener refresh failed")
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut listeners = self.listeners.borrow_mut();
            for id in dead {
                listeners.remove(&id);
            }
        }
    }
}

pub fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn resolve_sentinels(data: &mut Document) {
    for value in data.values_mut() {
        resolve_value(value);
    }
}

fn resolve_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)) {
                *value = Value::String(now_rfc3339());
            } else {
                for v in map.values_mut() {
                    resolve_value(v);
                }
            }
        }
        Value::Array(items) => {
            for v in items {
                resolve_value(v);
            }
        }
        _ => {}
    }
}

fn json_path(field: &str) -> anyhow::Result<String> {
    let valid = !field.is_empty()
        && field
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        bail!("invalid field name: {}", field);
    }
    Ok(format!("$.{}", field))
}

fn to_sql_value(value: &Value) -> anyhow::Result<SqlValue> {
    Ok(match value {
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::Null => SqlValue::Null,
        Value::Array(_) | Value::Object(_) => bail!("filters only compare scalar values"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn query_filters_by_equality_and_orders() {
        let store = DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store");
        store
            .add("activities", doc(json!({ "studentId": "s1", "date": "2026-02-18", "n": 2 })))
            .expect("add");
        store
            .add("activities", doc(json!({ "studentId": "s1", "date": "2026-02-19", "n": 1 })))
            .expect("add");
        store
            .add("activities", doc(json!({ "studentId": "s2", "date": "2026-02-18", "n": 3 })))
            .expect("add");

        let s1 = store
            .query(
                &Query::collection("activities")
                    .where_eq("studentId", "s1")
                    .order_by("n", Direction::Asc),
            )
            .expect("query");
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].str_field("date"), Some("2026-02-19"));

        let both = store
            .query(
                &Query::collection("activities")
                    .where_eq("date", "2026-02-18")
                    .order_by("n", Direction::Desc)
                    .limit(1),
            )
            .expect("query");
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].str_field("studentId"), Some("s2"));
    }

    #[test]
    fn update_merges_fields_and_rejects_missing_documents() {
        let store = DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store");
        let id = store
            .add("students", doc(json!({ "name": "Ahmad", "class": "1A" })))
            .expect("add");
        store
            .update("students", &id, doc(json!({ "class": "2B" })))
            .expect("update");
        let snap = store.get("students", &id).expect("get").expect("exists");
        assert_eq!(snap.str_field("name"), Some("Ahmad"));
        assert_eq!(snap.str_field("class"), Some("2B"));

        assert!(store
            .update("students", "missing", doc(json!({ "class": "X" })))
            .is_err());
        assert!(!store.delete("students", "missing").expect("delete"));
    }

    #[test]
    fn server_timestamp_is_replaced_on_write() {
        let store = DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store");
        let id = store
            .add("logs", doc(json!({ "action": "x", "timestamp": server_timestamp() })))
            .expect("add");
        let snap = store.get("logs", &id).expect("get").expect("exists");
        let ts = snap.str_field("timestamp").expect("timestamp string");
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn oversized_batch_is_rejected_and_chunked_commit_covers_everything() {
        let store = DocumentStore::in_memory(3).expect("store");
        let mut batch = WriteBatch::new();
        for i in 0..4 {
            batch.set("students", &format!("s{i}"), doc(json!({ "name": "x" })));
        }
        assert!(store.commit(batch).is_err());
        assert!(store.is_empty("students").expect("empty"));

        let ops: Vec<WriteOp> = (0..7)
            .map(|i| WriteOp::Set {
                collection: "students".into(),
                id: format!("s{i}"),
                data: doc(json!({ "name": "x" })),
            })
            .collect();
        let out = store.commit_chunked(ops).expect("chunked");
        assert_eq!(out.batches, 3);
        assert_eq!(out.writes, 7);
        assert_eq!(
            store
                .query(&Query::collection("students"))
                .expect("query")
                .len(),
            7
        );
    }

    #[test]
    fn chunked_commit_reports_partial_failure() {
        let store = DocumentStore::in_memory(2).expect("store");
        let mut ops: Vec<WriteOp> = (0..2)
            .map(|i| WriteOp::Set {
                collection: "students".into(),
                id: format!("s{i}"),
                data: doc(json!({ "name": "x" })),
            })
            .collect();
        ops.push(WriteOp::Update {
            collection: "students".into(),
            id: "missing".into(),
            fields: doc(json!({ "name": "y" })),
        });
        let err = store.commit_chunked(ops).expect_err("second chunk fails");
        let failure = err.downcast_ref::<BatchFailure>().expect("batch failure");
        assert_eq!(failure.committed_writes, 2);
        assert_eq!(failure.failed_batch, 2);
        assert_eq!(failure.total_batches, 2);
        assert_eq!(
            store
                .query(&Query::collection("students"))
                .expect("query")
                .len(),
            2
        );
    }

    #[test]
    fn failed_atomic_block_rolls_back() {
        let store = DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store");
        let res: anyhow::Result<()> = store.atomically(|| {
            store.set("students", "a", doc(json!({ "name": "A" })))?;
            bail!("abort")
        });
        assert!(res.is_err());
        assert!(store.get("students", "a").expect("get").is_none());
    }

    #[test]
    fn listeners_get_initial_and_post_commit_snapshots_until_removed() {
        let store = DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store");
        let (reg, rx) = store
            .listen(Query::collection("activities").where_eq("date", "2026-02-18"))
            .expect("listen");
        assert_eq!(rx.try_recv().expect("initial").len(), 0);

        store
            .atomically(|| {
                store.add("activities", doc(json!({ "date": "2026-02-18" })))?;
                store.add("activities", doc(json!({ "date": "2026-02-18" })))?;
                Ok(())
            })
            .expect("writes");
        // One delivery for the whole transaction.
        assert_eq!(rx.try_recv().expect("after commit").len(), 2);
        assert!(rx.try_recv().is_err());

        store
            .add("students", doc(json!({ "name": "A" })))
            .expect("other collection");
        assert!(rx.try_recv().is_err());

        assert_eq!(store.listener_count(), 1);
        reg.remove();
        assert_eq!(store.listener_count(), 0);
        store
            .add("activities", doc(json!({ "date": "2026-02-18" })))
            .expect("add");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn invalid_field_names_are_rejected() {
        let store = DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store");
        assert!(store
            .query(&Query::collection("students").where_eq("name') OR 1=1 --", "x"))
            .is_err());
    }
}
