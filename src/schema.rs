//! Schema cache and per-document metadata
//!
//! The schema cache is the read-only view of an index definition that the
//! lookup layer consults when resolving field names: whether a field is
//! sortable (its value lives in the document's sort vector), whether the
//! sortable copy is normalised, and whether the field is numeric.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::value::Value;

/// One field definition from the index schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name as referenced by queries.
    pub name: String,
    /// Path used to fetch the field from the source document. Defaults to
    /// the name; differs when the schema declares an alias.
    pub path: String,
    /// Whether the field value is kept in the per-document sort vector.
    pub sortable: bool,
    /// Whether the sortable copy is normalised (case-folded). A sortable,
    /// un-normalised field's sort-vector entry is byte-identical to the
    /// document value and can stand in for a load.
    pub normalized: bool,
    /// Numeric fields coerce to numbers on load.
    pub numeric: bool,
    /// Index of this field in the sort vector, when sortable.
    pub sort_idx: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            sortable: false,
            normalized: false,
            numeric: false,
            sort_idx: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn sortable(mut self, sort_idx: usize) -> Self {
        self.sortable = true;
        self.sort_idx = Some(sort_idx);
        self
    }

    /// Mark the sortable copy as normalised (not usable in place of a load).
    pub fn normalized(mut self) -> Self {
        self.normalized = true;
        self
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }
}

/// Read-only snapshot of an index schema, shared by every lookup of a
/// request.
#[derive(Debug, Default)]
pub struct SchemaCache {
    fields: Vec<FieldSpec>,
}

impl SchemaCache {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn find(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Number of sort-vector slots documents of this schema carry.
    pub fn sort_vector_len(&self) -> usize {
        self.fields
            .iter()
            .filter_map(|f| f.sort_idx)
            .map(|i| i + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Precomputed sortable-field values attached to a document. Slot `i` holds
/// the value of the schema field with `sort_idx == i`.
pub type SortVector = Vec<Value>;

/// Per-document attributes kept outside the document itself.
///
/// Metadata is borrowed into results via `Arc` clones; the document table
/// owns the canonical copy. Deletion is an atomic flag so that results
/// already holding a borrow observe it during buffered-result validation.
#[derive(Debug)]
pub struct DocMetadata {
    pub doc_id: u64,
    /// Store key of the document.
    pub key: String,
    /// Static document score assigned at ingestion.
    pub score: f64,
    /// Token count, used by length-normalising scorers.
    pub doc_len: u32,
    deleted: AtomicBool,
    /// Opaque per-document payload (payload scorers, replies).
    pub payload: Option<Vec<u8>>,
    pub sort_vector: Option<Arc<SortVector>>,
}

impl DocMetadata {
    pub fn new(doc_id: u64, key: impl Into<String>) -> Self {
        Self {
            doc_id,
            key: key.into(),
            score: 1.0,
            doc_len: 0,
            deleted: AtomicBool::new(false),
            payload: None,
            sort_vector: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}
