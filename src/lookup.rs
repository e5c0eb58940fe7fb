//! Field lookups and row storage
//!
//! A [`Lookup`] is the per-request symbol table mapping field names to row
//! slots. Stages resolve names to [`KeyId`]s once at build time and read or
//! write row slots by index afterwards. Keys record their provenance (index
//! schema, document load, query projection) so downstream stages know
//! whether a value is already available or must be loaded, and whether it
//! should appear in replies.
//!
//! A [`Row`] is the slot array itself plus an optional borrowed sort vector
//! (precomputed sortable fields attached to the document's metadata).

use std::sync::Arc;

use bitflags::bitflags;

use crate::schema::{FieldSpec, SchemaCache, SortVector};
use crate::value::Value;

bitflags! {
    /// Provenance and behavior flags of a lookup key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u32 {
        /// The field is (or is assumed to be) part of the document itself.
        const DOC_SRC = 0x01;
        /// The field is part of the index schema.
        const SCHEMA_SRC = 0x02;
        /// The field value can be read from the document's sort vector.
        const SV_SRC = 0x04;
        /// The key was created by the query itself (projection, metric).
        const QUERY_SRC = 0x08;
        /// Transient: replace an existing key instead of failing.
        const OVERRIDE = 0x10;
        /// Transient: hand the key to a loader even if already available.
        const FORCE_LOAD = 0x20;
        /// The key's source could not be determined at creation.
        const UNRESOLVED = 0x40;
        /// Transient field for another consumer; never emitted in replies.
        const HIDDEN = 0x80;
        /// Explicitly requested in the return list; always emitted.
        const EXPLICIT_RETURN = 0x100;
        /// The value is obtainable without touching the document (sortable
        /// and un-normalised), so a loader may skip it.
        const VAL_AVAILABLE = 0x200;
        /// The value was loaded from the document by a loader stage.
        const IS_LOADED = 0x400;
        /// The field is numeric; loads coerce to a number.
        const NUMERIC = 0x800;
    }
}

impl KeyFlags {
    /// Flags accepted by the get-key entry points; anything else is derived.
    const GET_KEY_MASK: KeyFlags = KeyFlags::OVERRIDE
        .union(KeyFlags::FORCE_LOAD)
        .union(KeyFlags::HIDDEN)
        .union(KeyFlags::EXPLICIT_RETURN);

    /// Flags that never persist onto the key.
    const TRANSIENT: KeyFlags = KeyFlags::OVERRIDE.union(KeyFlags::FORCE_LOAD);
}

bitflags! {
    /// Behavior switches of a whole lookup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupOptions: u32 {
        /// Read-mode misses create UNRESOLVED keys instead of failing.
        const UNRESOLVED_OK = 0x01;
        /// A loader upstream loads the entire document, so read mode may
        /// create schema keys even when they are not sortable.
        const ALL_LOADED = 0x02;
    }
}

/// Stable handle to a key within one [`Lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(pub usize);

/// A named slot descriptor.
#[derive(Debug)]
pub struct LookupKey {
    /// `None` once the key has been replaced by an override; replaced keys
    /// keep their entry (slot indices stay stable) but are unreachable by
    /// name.
    name: Option<String>,
    /// Where to fetch the value from the source document.
    path: String,
    dst_idx: usize,
    sv_idx: Option<usize>,
    flags: KeyFlags,
}

impl LookupKey {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The row slot this key addresses.
    pub fn dst_idx(&self) -> usize {
        self.dst_idx
    }

    pub fn sv_idx(&self) -> Option<usize> {
        self.sv_idx
    }

    pub fn flags(&self) -> KeyFlags {
        self.flags
    }

    pub fn is_hidden(&self) -> bool {
        self.name.is_none() || self.flags.contains(KeyFlags::HIDDEN)
    }

    fn set_from_spec(&mut self, spec: &FieldSpec) {
        self.flags |= KeyFlags::DOC_SRC | KeyFlags::SCHEMA_SRC;
        self.path = spec.path.clone();
        if spec.sortable {
            self.flags |= KeyFlags::SV_SRC;
            self.sv_idx = spec.sort_idx;
            if !spec.normalized {
                // Sortable and un-normalised: the sort-vector copy is
                // byte-identical to the document value.
                self.flags |= KeyFlags::VAL_AVAILABLE;
            }
        }
        if spec.numeric {
            self.flags |= KeyFlags::NUMERIC;
        }
    }
}

/// Per-request symbol table: an ordered key list plus the row length every
/// row of this request shares.
#[derive(Debug, Default)]
pub struct Lookup {
    keys: Vec<LookupKey>,
    row_len: usize,
    schema: Option<Arc<SchemaCache>>,
    options: LookupOptions,
}

impl Lookup {
    pub fn new(schema: Option<Arc<SchemaCache>>) -> Self {
        Self {
            keys: Vec::new(),
            row_len: 0,
            schema,
            options: LookupOptions::empty(),
        }
    }

    pub fn set_option(&mut self, opt: LookupOptions) {
        self.options |= opt;
    }

    pub fn options(&self) -> LookupOptions {
        self.options
    }

    /// Slot count of rows built against this lookup. Monotone
    /// non-decreasing for the lookup's lifetime.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn key(&self, id: KeyId) -> &LookupKey {
        &self.keys[id.0]
    }

    pub fn schema(&self) -> Option<&Arc<SchemaCache>> {
        self.schema.as_ref()
    }

    /// All reachable keys, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (KeyId, &LookupKey)> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.name.is_some())
            .map(|(i, k)| (KeyId(i), k))
    }

    pub fn find(&self, name: &str) -> Option<KeyId> {
        self.keys
            .iter()
            .position(|k| k.name.as_deref() == Some(name))
            .map(KeyId)
    }

    fn create_key(&mut self, name: &str, flags: KeyFlags) -> KeyId {
        self.keys.push(LookupKey {
            name: Some(name.to_owned()),
            path: name.to_owned(),
            dst_idx: self.row_len,
            sv_idx: None,
            flags: flags & !KeyFlags::TRANSIENT,
        });
        self.row_len += 1;
        KeyId(self.keys.len() - 1)
    }

    /// Replace `old` with a fresh key reusing its slot. The old key keeps
    /// its entry but becomes unreachable by name.
    fn override_key(&mut self, old: KeyId, flags: KeyFlags) -> KeyId {
        let (name, dst_idx) = {
            let old = &mut self.keys[old.0];
            let name = old.name.take().expect("overriding an unreachable key");
            old.flags |= KeyFlags::HIDDEN;
            (name, old.dst_idx)
        };
        self.keys.push(LookupKey {
            path: name.clone(),
            name: Some(name),
            dst_idx,
            sv_idx: None,
            flags: flags & !KeyFlags::TRANSIENT,
        });
        KeyId(self.keys.len() - 1)
    }

    fn key_from_schema(&mut self, name: &str, flags: KeyFlags) -> Option<KeyId> {
        let schema = self.schema.clone()?;
        let spec = schema.find(name)?;
        // Only sortable fields have their value available for reading;
        // other schema fields need a loader, unless one upstream promised
        // to load the whole document.
        if !spec.sortable && !self.options.contains(LookupOptions::ALL_LOADED) {
            return None;
        }
        let id = self.create_key(name, flags);
        self.keys[id.0].set_from_spec(spec);
        Some(id)
    }

    /// Resolve a key for reading.
    ///
    /// Finds an existing key; otherwise creates one from the schema when the
    /// field's value is available (sortable, or fully loaded upstream).
    /// With [`LookupOptions::UNRESOLVED_OK`], a miss creates an UNRESOLVED
    /// key instead of failing.
    pub fn get_key_read(&mut self, name: &str, flags: KeyFlags) -> Option<KeyId> {
        let flags = flags & KeyFlags::GET_KEY_MASK;
        if let Some(id) = self.find(name) {
            return Some(id);
        }
        if let Some(id) = self.key_from_schema(name, flags) {
            return Some(id);
        }
        if self.options.contains(LookupOptions::UNRESOLVED_OK) {
            let id = self.create_key(name, flags);
            self.keys[id.0].flags |= KeyFlags::UNRESOLVED;
            return Some(id);
        }
        None
    }

    /// Resolve a key for writing a query-produced value.
    ///
    /// Returns `None` on a name conflict unless [`KeyFlags::OVERRIDE`] was
    /// requested, in which case the previous key is hidden and its slot
    /// reused.
    pub fn get_key_write(&mut self, name: &str, flags: KeyFlags) -> Option<KeyId> {
        let flags = flags & KeyFlags::GET_KEY_MASK;
        let id = match self.find(name) {
            None => self.create_key(name, flags),
            Some(existing) => {
                if !flags.contains(KeyFlags::OVERRIDE) {
                    return None;
                }
                self.override_key(existing, flags)
            }
        };
        self.keys[id.0].flags |= KeyFlags::QUERY_SRC;
        Some(id)
    }

    /// Resolve a key for loading from the document store.
    ///
    /// `path` is the location in the source document (the field name itself
    /// when no alias is involved). Returns `None` when the value is already
    /// present — loaded earlier, produced by the query, or available from
    /// the sort vector — and neither override nor force-load was requested.
    pub fn get_key_load(&mut self, name: &str, path: &str, flags: KeyFlags) -> Option<KeyId> {
        let flags = flags & KeyFlags::GET_KEY_MASK;
        let id = match self.find(name) {
            None => self.create_key(name, flags),
            Some(existing) => {
                let kf = self.keys[existing.0].flags;
                let available_unloaded = kf.contains(KeyFlags::VAL_AVAILABLE)
                    && !kf.contains(KeyFlags::IS_LOADED)
                    && !flags.intersects(KeyFlags::OVERRIDE | KeyFlags::FORCE_LOAD);
                let already_loaded =
                    kf.contains(KeyFlags::IS_LOADED) && !flags.contains(KeyFlags::OVERRIDE);
                let query_owned =
                    kf.contains(KeyFlags::QUERY_SRC) && !flags.contains(KeyFlags::OVERRIDE);
                if available_unloaded || already_loaded || query_owned {
                    // The caller may still want the field emitted.
                    self.keys[existing.0].flags |= flags & KeyFlags::EXPLICIT_RETURN;
                    return None;
                }
                self.override_key(existing, flags)
            }
        };

        let spec = self
            .schema
            .as_ref()
            .and_then(|s| s.find(path))
            .cloned();
        match spec {
            Some(spec) => {
                self.keys[id.0].set_from_spec(&spec);
                if self.keys[id.0].flags.contains(KeyFlags::VAL_AVAILABLE)
                    && !flags.contains(KeyFlags::FORCE_LOAD)
                {
                    // Sortable and un-normalised: the sort vector stands in
                    // for the document, nothing to load.
                    return None;
                }
            }
            None => {
                // Unknown to the schema; trust the caller-supplied path.
                self.keys[id.0].path = path.to_owned();
            }
        }
        self.keys[id.0].flags |= KeyFlags::DOC_SRC | KeyFlags::IS_LOADED;
        Some(id)
    }

    /// Write `value` into `row` under `id`.
    pub fn write_key(&self, id: KeyId, row: &mut Row, value: Value) {
        row.set(self.keys[id.0].dst_idx, value);
    }

    /// Write by name, creating the key when necessary (used by load-all,
    /// where field names are only known at runtime).
    pub fn write_key_by_name(&mut self, name: &str, flags: KeyFlags, row: &mut Row, value: Value) {
        let id = match self.find(name) {
            Some(id) => id,
            None => {
                let id = self.create_key(name, flags & KeyFlags::GET_KEY_MASK);
                self.keys[id.0].flags |= flags & !KeyFlags::TRANSIENT;
                id
            }
        };
        self.write_key(id, row, value);
    }

    /// Read the value for `id`: the row slot if written, otherwise the sort
    /// vector when this key is backed by one. `None` means the row has no
    /// value for this key.
    pub fn get_item(&self, id: KeyId, row: &Row) -> Option<Value> {
        let key = &self.keys[id.0];
        if let Some(v) = row.get(key.dst_idx) {
            return Some(v.clone());
        }
        if key.flags.contains(KeyFlags::SV_SRC) {
            if let (Some(sv), Some(idx)) = (row.sort_vector(), key.sv_idx) {
                let v = sv.get(idx)?;
                if !v.is_null() {
                    return Some(v.clone());
                }
            }
        }
        None
    }
}

/// One row in transit through a pipeline: a dynamic slot array plus an
/// optional borrowed sort vector.
#[derive(Debug, Default)]
pub struct Row {
    slots: Vec<Option<Value>>,
    sv: Option<Arc<SortVector>>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every held value and detach the sort vector, keeping the
    /// slot capacity for reuse.
    pub fn wipe(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.sv = None;
    }

    pub fn set(&mut self, idx: usize, value: Value) {
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(value);
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn sort_vector(&self) -> Option<&Arc<SortVector>> {
        self.sv.as_ref()
    }

    pub fn set_sort_vector(&mut self, sv: Option<Arc<SortVector>>) {
        self.sv = sv;
    }
}
