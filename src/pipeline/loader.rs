//! Document loader stage
//!
//! Fetches field values from the live store into row slots. Runs in one of
//! three modes: an explicit key list, sortable-only materialisation (no
//! store access, the values come from the sort vector), or load-everything.
//! A failed document load flags the result instead of failing the
//! pipeline; the row is still delivered.

use std::any::Any;

use crate::document::{json_path, json_to_value, Document, DocumentStore};
use crate::lookup::{KeyFlags, KeyId};
use crate::value::Value;

use super::{
    Behavior, LookupId, PipelineCtx, ResultFlags, SearchResult, Stage, StageKind, StageStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Load exactly the keys resolved at build time.
    KeyList,
    /// Materialise sort-vector values into row slots; no store access.
    SortableOnly,
    /// Load every field of the document.
    All,
}

pub struct LoaderStage {
    upstream: Box<dyn Stage>,
    store: DocumentStore,
    lookup: LookupId,
    keys: Vec<KeyId>,
    mode: LoadMode,
    /// Load even keys whose value is available from the sort vector.
    force_load: bool,
    /// Keep every loaded value a string; skip numeric coercion.
    force_string: bool,
}

impl LoaderStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        store: DocumentStore,
        lookup: LookupId,
        keys: Vec<KeyId>,
        mode: LoadMode,
        force_load: bool,
        force_string: bool,
    ) -> Self {
        Self {
            upstream,
            store,
            lookup,
            keys,
            mode,
            force_load,
            force_string,
        }
    }

    fn load_key_list(&self, cx: &mut PipelineCtx, res: &mut SearchResult, doc: &Document) {
        let lookup = cx.lookups.get(self.lookup);
        for &key_id in &self.keys {
            let key = lookup.key(key_id);
            if key.flags().contains(KeyFlags::VAL_AVAILABLE) && !self.force_load {
                continue;
            }
            let numeric = key.flags().contains(KeyFlags::NUMERIC) && !self.force_string;
            if let Some(value) = field_value(doc, key.path(), numeric) {
                res.row.set(key.dst_idx(), value);
            }
        }
    }

    fn load_sortables(&self, cx: &mut PipelineCtx, res: &mut SearchResult) {
        let lookup = cx.lookups.get(self.lookup);
        for &key_id in &self.keys {
            let key = lookup.key(key_id);
            if !key.flags().contains(KeyFlags::SV_SRC) {
                continue;
            }
            if res.row.get(key.dst_idx()).is_some() {
                continue;
            }
            if let Some(v) = lookup.get_item(key_id, &res.row) {
                res.row.set(key.dst_idx(), v);
            }
        }
    }

    fn load_all(&self, cx: &mut PipelineCtx, res: &mut SearchResult, doc: &Document) {
        let lookup = cx.lookups.get_mut(self.lookup);
        let flags = KeyFlags::DOC_SRC | KeyFlags::IS_LOADED;
        match doc {
            Document::Record(fields) => {
                for (name, raw) in fields {
                    lookup.write_key_by_name(name, flags, &mut res.row, Value::string(raw.clone()));
                }
            }
            Document::Structured(body) => {
                // The whole serialised tree lands under the root path; the
                // fields themselves stay addressable via explicit loads.
                lookup.write_key_by_name("$", flags, &mut res.row, Value::string(body.to_string()));
            }
        }
    }
}

impl Stage for LoaderStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let rc = self.upstream.next(cx, res);
        if rc != StageStatus::Ok {
            return rc;
        }

        // A result without live metadata passes through untouched.
        let Some(dmd) = res.dmd.clone() else {
            return StageStatus::Ok;
        };
        if dmd.is_deleted() {
            return StageStatus::Ok;
        }

        if self.mode == LoadMode::SortableOnly {
            self.load_sortables(cx, res);
            return StageStatus::Ok;
        }

        // Recursive read: a buffer-and-lock stage upstream may already
        // hold the store lock for this request.
        let doc = self.store.read_recursive().open_document(&dmd.key);
        let Some(doc) = doc else {
            // Document vanished between indexing and loading. Deliver the
            // row anyway.
            res.flags |= ResultFlags::VAL_IS_NULL;
            return StageStatus::Ok;
        };

        match self.mode {
            LoadMode::KeyList => self.load_key_list(cx, res, &doc),
            LoadMode::All => self.load_all(cx, res, &doc),
            LoadMode::SortableOnly => unreachable!("handled above"),
        }
        StageStatus::Ok
    }

    fn kind(&self) -> StageKind {
        StageKind::Loader
    }

    fn behavior(&self) -> Behavior {
        Behavior::ACCESS_STORE
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fetch one field from a document.
///
/// Record documents resolve by field name, optionally coercing to a
/// number. Structured documents evaluate the path; multiple hits build a
/// `Duo` so ordering sees the first value while serialisation sees the
/// whole list.
fn field_value(doc: &Document, path: &str, numeric: bool) -> Option<Value> {
    match doc {
        Document::Record(_) => {
            let raw = doc.record_field(path)?;
            if numeric {
                match raw.trim().parse::<f64>() {
                    Ok(n) => Some(Value::number(n)),
                    Err(_) => Some(Value::string(raw.to_owned())),
                }
            } else {
                Some(Value::string(raw.to_owned()))
            }
        }
        Document::Structured(body) => {
            let hits = json_path(body, path);
            match hits.len() {
                0 => None,
                1 => Some(json_to_value(hits[0])),
                _ => {
                    let values: Vec<Value> = hits.iter().map(|h| json_to_value(h)).collect();
                    let serialized =
                        serde_json::Value::Array(hits.into_iter().cloned().collect()).to_string();
                    Some(Value::duo_expanded(
                        values[0].clone(),
                        Value::string(serialized),
                        Value::array(values),
                    ))
                }
            }
        }
    }
}
