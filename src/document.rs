//! In-memory document store
//!
//! The live key-value side of the engine: documents (flat field records or
//! structured JSON trees), their metadata table, and the global store lock.
//! Query pipelines read documents only while holding a shared guard; the
//! buffer-and-lock stage keeps one across its yield phase so downstream
//! loaders observe a stable store.
//!
//! The store version increments on every mutation. A pipeline records the
//! version at request start; buffered results are re-validated when the
//! version moved before the lock was re-acquired.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};

use crate::schema::{DocMetadata, SchemaCache, SortVector};
use crate::value::Value;

/// A stored document: either a flat field record or a structured tree.
#[derive(Debug, Clone)]
pub enum Document {
    /// Flat record: ordered `(field, text)` pairs.
    Record(Vec<(String, String)>),
    /// Structured document, addressed by path expressions.
    Structured(serde_json::Value),
}

impl Document {
    /// Fetch a record field by name. `None` for structured documents.
    pub fn record_field(&self, name: &str) -> Option<&str> {
        match self {
            Document::Record(fields) => fields
                .iter()
                .find(|(f, _)| f == name)
                .map(|(_, v)| v.as_str()),
            Document::Structured(_) => None,
        }
    }
}

/// Shared guard over the store contents. Holding one blocks writers but not
/// other readers.
pub type StoreReadGuard = ArcRwLockReadGuard<RawRwLock, StoreInner>;

#[derive(Debug, Default)]
pub struct StoreInner {
    docs: HashMap<String, Arc<Document>>,
    meta_by_id: HashMap<u64, Arc<DocMetadata>>,
    id_by_key: HashMap<String, u64>,
    next_doc_id: u64,
    version: u64,
}

impl StoreInner {
    /// Borrow the metadata of a document by id.
    pub fn metadata(&self, doc_id: u64) -> Option<Arc<DocMetadata>> {
        self.meta_by_id.get(&doc_id).cloned()
    }

    /// Open a live document by its store key.
    pub fn open_document(&self, key: &str) -> Option<Arc<Document>> {
        self.docs.get(key).cloned()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Handle to the shared in-memory store. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the global store lock for reading. The guard is owned and
    /// may be held across calls (the buffer-and-lock stage does).
    pub fn lock_shared(&self) -> StoreReadGuard {
        RwLock::read_arc(&self.inner)
    }

    /// Shared read that does not queue behind waiting writers. Stages that
    /// read while another stage of the same request already holds the lock
    /// must use this, or a queued writer would wedge the request.
    pub fn read_recursive(&self) -> parking_lot::RwLockReadGuard<'_, StoreInner> {
        self.inner.read_recursive()
    }

    /// Current store version. Bumped by every mutation.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Insert a flat record document, deriving its sort vector from the
    /// schema's sortable fields. Returns the assigned doc id.
    pub fn add_record(
        &self,
        schema: &SchemaCache,
        key: &str,
        fields: Vec<(String, String)>,
        score: f64,
    ) -> u64 {
        let doc_len = fields
            .iter()
            .map(|(_, v)| v.split_whitespace().count() as u32)
            .sum();
        let doc = Document::Record(fields);
        self.insert(schema, key, doc, score, doc_len)
    }

    /// Insert a structured document.
    pub fn add_structured(
        &self,
        schema: &SchemaCache,
        key: &str,
        body: serde_json::Value,
        score: f64,
    ) -> u64 {
        let doc_len = body.to_string().split_whitespace().count() as u32;
        self.insert(schema, key, Document::Structured(body), score, doc_len)
    }

    fn insert(
        &self,
        schema: &SchemaCache,
        key: &str,
        doc: Document,
        score: f64,
        doc_len: u32,
    ) -> u64 {
        let sv = build_sort_vector(schema, &doc);
        let mut inner = self.inner.write();
        // Re-insertion of a key replaces the document and retires the old
        // metadata entry.
        if let Some(old_id) = inner.id_by_key.remove(key) {
            if let Some(old) = inner.meta_by_id.remove(&old_id) {
                old.mark_deleted();
            }
        }
        inner.next_doc_id += 1;
        let doc_id = inner.next_doc_id;

        let mut meta = DocMetadata::new(doc_id, key);
        meta.score = score;
        meta.doc_len = doc_len;
        meta.sort_vector = sv.map(Arc::new);

        inner.docs.insert(key.to_owned(), Arc::new(doc));
        inner.meta_by_id.insert(doc_id, Arc::new(meta));
        inner.id_by_key.insert(key.to_owned(), doc_id);
        inner.version += 1;
        tracing::debug!(key, doc_id, "document stored");
        doc_id
    }

    /// Attach an opaque payload to an existing document.
    pub fn set_payload(&self, key: &str, payload: Vec<u8>) -> bool {
        let mut inner = self.inner.write();
        let Some(&id) = inner.id_by_key.get(key) else {
            return false;
        };
        let Some(meta) = inner.meta_by_id.get(&id).cloned() else {
            return false;
        };
        let mut replacement = DocMetadata::new(meta.doc_id, meta.key.clone());
        replacement.score = meta.score;
        replacement.doc_len = meta.doc_len;
        replacement.sort_vector = meta.sort_vector.clone();
        replacement.payload = Some(payload);
        inner.meta_by_id.insert(id, Arc::new(replacement));
        inner.version += 1;
        true
    }

    /// Delete a document. Existing metadata borrows observe the deletion.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(id) = inner.id_by_key.remove(key) else {
            return false;
        };
        inner.docs.remove(key);
        if let Some(meta) = inner.meta_by_id.get(&id) {
            meta.mark_deleted();
        }
        inner.version += 1;
        tracing::debug!(key, doc_id = id, "document deleted");
        true
    }
}

/// Build the sort vector of a document from the schema's sortable fields.
/// Missing fields hold null; normalised fields store a case-folded copy.
fn build_sort_vector(schema: &SchemaCache, doc: &Document) -> Option<SortVector> {
    let len = schema.sort_vector_len();
    if len == 0 {
        return None;
    }
    let mut sv: SortVector = vec![Value::null(); len];
    for field in schema.fields() {
        let Some(idx) = field.sort_idx else { continue };
        let raw = match doc {
            Document::Record(_) => doc.record_field(&field.path).map(|s| s.to_owned()),
            Document::Structured(body) => json_path(body, &field.path)
                .first()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
        };
        let Some(raw) = raw else { continue };
        sv[idx] = if field.numeric {
            match raw.trim().parse::<f64>() {
                Ok(n) => Value::number(n),
                Err(_) => continue,
            }
        } else if field.normalized {
            Value::string(raw.to_lowercase())
        } else {
            Value::string(raw)
        };
    }
    Some(sv)
}

/// Evaluate a dotted path expression against a structured document.
///
/// Supports an optional `$` / `$.` root prefix, object-key segments, and
/// `*` for "every element" on arrays and objects. A terminal array is
/// returned as its elements (one path, many values).
pub fn json_path<'a>(root: &'a serde_json::Value, path: &str) -> Vec<&'a serde_json::Value> {
    let trimmed = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);

    let mut current = vec![root];
    for segment in trimmed.split('.').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        for node in current {
            match node {
                serde_json::Value::Object(map) => {
                    if segment == "*" {
                        next.extend(map.values());
                    } else if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                serde_json::Value::Array(items) => {
                    if segment == "*" {
                        next.extend(items.iter());
                    } else if let Ok(idx) = segment.parse::<usize>() {
                        if let Some(v) = items.get(idx) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }

    // A single terminal array expands to its elements.
    if current.len() == 1 {
        if let serde_json::Value::Array(items) = current[0] {
            return items.iter().collect();
        }
    }
    current
}

/// Convert a structured node into a row value.
pub fn json_to_value(node: &serde_json::Value) -> Value {
    match node {
        serde_json::Value::Null => Value::null(),
        serde_json::Value::Bool(b) => Value::number(if *b { 1.0 } else { 0.0 }),
        serde_json::Value::Number(n) => Value::number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::string(s.clone()),
        serde_json::Value::Array(items) => {
            Value::array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::map(
            map.iter()
                .map(|(k, v)| (Value::string(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}
