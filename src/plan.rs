//! Aggregation plans and request options
//!
//! A request arrives as a query (already reduced to a source iterator), a
//! set of flags, numeric bounds, and an ordered list of plan steps. The
//! pipeline builder translates the steps into a stage chain; this module
//! only describes them.

use bitflags::bitflags;

use crate::expr::Expr;
use crate::index::DistanceMetric;

bitflags! {
    /// Request-level execution flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Search-style request (default limit, output loading).
        const IS_SEARCH = 0x0000_0001;
        /// Extended (aggregate) request.
        const IS_EXTENDED = 0x0000_0002;
        /// Results are consumed through a cursor.
        const IS_CURSOR = 0x0000_0004;
        /// Count only; no rows are produced.
        const NO_ROWS = 0x0000_0008;
        /// Do not emit field content.
        const SEND_NOFIELDS = 0x0000_0010;
        /// Emit the score with each row.
        const SEND_SCORES = 0x0000_0020;
        /// Emit the score as a row field.
        const SEND_SCORES_AS_FIELD = 0x0000_0040;
        /// Emit document payloads.
        const SEND_PAYLOADS = 0x0000_0080;
        /// Emit sort keys.
        const SEND_SORTKEYS = 0x0000_0100;
        /// Apply the highlighter to the output.
        const SEND_HIGHLIGHT = 0x0000_0200;
        /// Attach score explanations.
        const SEND_SCORE_EXPLAIN = 0x0000_0400;
        /// Emit internal document ids instead of keys.
        const SEND_RAW_IDS = 0x0000_0800;
        /// Allow plan-level shortcuts (quick-exit sorting).
        const OPTIMIZE = 0x0000_1000;
        /// Wrap every stage with a profiler.
        const PROFILE = 0x0000_2000;
        /// The request carries a required-field list.
        const REQUIRED_FIELDS = 0x0000_4000;
        /// Expanded reply format (multi-value fields as arrays).
        const FORMAT_EXPAND = 0x0000_8000;
        /// This request is the text side of a hybrid query.
        const HYBRID_SEARCH_SUBQUERY = 0x0001_0000;
        /// This request is the vector side of a hybrid query.
        const HYBRID_VECTOR_SUBQUERY = 0x0002_0000;
    }
}

/// Maximum number of sort keys; the ascending map is one bit per key.
pub const MAX_SORT_KEYS: usize = 64;

/// Sort specification: key names plus a bitmap with bit `i` set when key
/// `i` sorts ascending.
#[derive(Debug, Clone, Default)]
pub struct SortSpec {
    pub keys: Vec<String>,
    pub asc_map: u64,
}

impl SortSpec {
    pub fn new(keys: Vec<String>, asc_map: u64) -> Self {
        debug_assert!(keys.len() <= MAX_SORT_KEYS);
        Self { keys, asc_map }
    }

    /// All-ascending sort over `keys`.
    pub fn ascending(keys: Vec<String>) -> Self {
        Self::new(keys, u64::MAX)
    }

    /// All-descending sort over `keys`.
    pub fn descending(keys: Vec<String>) -> Self {
        Self::new(keys, 0)
    }

    pub fn is_ascending(&self, idx: usize) -> bool {
        idx < MAX_SORT_KEYS && (self.asc_map >> idx) & 1 == 1
    }
}

/// One reducer of a GROUP step: `name(args) AS alias`.
#[derive(Debug, Clone)]
pub struct ReducerSpec {
    pub name: String,
    pub args: Vec<String>,
    pub alias: Option<String>,
    /// Hidden reducers feed later steps but are not emitted.
    pub hidden: bool,
}

impl ReducerSpec {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            alias: None,
            hidden: false,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// The output field name: the alias if given, otherwise derived from
    /// the reducer shape (`__generated_aliascount`, ...).
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => {
                let mut name = format!("__generated_alias{}", self.name.to_lowercase());
                for a in &self.args {
                    name.push('_');
                    name.push_str(a.trim_start_matches('@'));
                }
                name
            }
        }
    }
}

/// One field of a LOAD step: a document path with an optional alias.
#[derive(Debug, Clone)]
pub struct LoadField {
    pub path: String,
    pub alias: Option<String>,
}

impl LoadField {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.path)
    }
}

/// One step of an aggregation plan.
#[derive(Debug, Clone)]
pub enum PlanStep {
    /// Bucket rows by `properties` and reduce each bucket.
    Group {
        properties: Vec<String>,
        reducers: Vec<ReducerSpec>,
    },
    /// Sort and/or page the stream.
    Arrange {
        offset: usize,
        limit: usize,
        sort: Option<SortSpec>,
    },
    /// Compute an expression into a new field.
    Apply { expr: Expr, alias: String },
    /// Keep only rows where the expression is truthy.
    Filter { expr: Expr },
    /// Load fields from the live documents; empty field list = load all.
    Load { fields: Vec<LoadField> },
    /// Rewrite a raw vector distance into a normalised similarity score.
    VectorNormalizer {
        distance_field: String,
        alias: String,
        metric: DistanceMetric,
    },
    /// Start-of-plan marker; contributes no stage.
    Root,
    /// Cluster fan-out marker; contributes no stage on a shard.
    Distribute,
}

/// A parsed aggregation plan: the ordered step list.
#[derive(Debug, Clone, Default)]
pub struct AggregatePlan {
    pub steps: Vec<PlanStep>,
}

impl AggregatePlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// Whether any ARRANGE step carries explicit sort keys.
    pub fn has_sort_by(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, PlanStep::Arrange { sort: Some(spec), .. } if !spec.keys.is_empty()))
    }
}

/// Per-request parameters handed to the pipeline builder, already parsed
/// and validated upstream.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub flags: RequestFlags,
    /// Scorer name; `None` selects the default scorer.
    pub scorer: Option<String>,
    /// Query expander name, when token expansion was requested.
    pub expander: Option<String>,
    /// Stemming language of the query, recorded for expanders.
    pub language: Option<String>,
    /// Explicit RETURN field list; empty means "all visible fields".
    pub return_fields: Vec<LoadField>,
    /// Field to write the score into, when scores are sent as a field.
    pub score_alias: Option<String>,
    /// Opaque query payload for payload-aware scorers.
    pub query_payload: Option<Vec<u8>>,
    /// Terms to highlight when SEND_HIGHLIGHT is set.
    pub highlight_terms: Vec<String>,
    /// Fields to highlight; empty means every string field.
    pub highlight_fields: Vec<String>,
    /// Buffer results and hold the store lock for downstream loaders.
    pub safe_store_access: bool,
    pub dialect_version: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            flags: RequestFlags::empty(),
            scorer: None,
            expander: None,
            language: None,
            return_fields: Vec::new(),
            score_alias: None,
            query_payload: None,
            highlight_terms: Vec::new(),
            highlight_fields: Vec::new(),
            safe_store_access: false,
            dialect_version: 3,
        }
    }
}

impl RequestOptions {
    pub fn search() -> Self {
        Self {
            flags: RequestFlags::IS_SEARCH,
            ..Default::default()
        }
    }

    pub fn aggregate() -> Self {
        Self {
            flags: RequestFlags::IS_EXTENDED,
            ..Default::default()
        }
    }

    pub fn is_search(&self) -> bool {
        self.flags.contains(RequestFlags::IS_SEARCH)
    }
}
