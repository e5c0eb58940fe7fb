//! The result-processor chain
//!
//! A pipeline is a pull-based chain of stages. Each stage owns its upstream
//! and produces at most one result per [`Stage::next`] call; the terminal
//! stage is driven by the caller until end-of-stream, a timeout, or an
//! error. Stages share per-request state (result accounting, the score
//! floor, the error slot, lookups) through the [`PipelineCtx`] threaded
//! into every call.
//!
//! Stage set: source, scorer, metrics, loader, projector, filter,
//! highlighter, sorter, max-score normalizer, pager, counter, grouper,
//! profile wrapper, buffer-and-lock/unlocker, depleter and hybrid merger.

pub mod buffer;
pub mod build;
pub mod depleter;
pub mod group;
pub mod highlight;
pub mod loader;
pub mod merger;
pub mod profile;
pub mod score;
pub mod sort;
pub mod source;
pub mod transform;

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;

use crate::config::TimeoutPolicy;
use crate::error::QueryError;
use crate::index::IndexResult;
use crate::lookup::{Lookup, Row};
use crate::schema::DocMetadata;
use crate::scorer::Explanation;

/// Status of one pull on a stage.
///
/// `Depleting` and `Paused` are internal coordination states consumed by
/// the hybrid merger; they never reach the caller of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// A result was produced.
    Ok,
    /// Stream ended normally.
    Eof,
    /// The deadline passed.
    TimedOut,
    /// A depleter upstream is still flushing buffered rows.
    Depleting,
    /// Cooperative yield; ask again.
    Paused,
    /// Hard failure; the pipeline's error slot holds the cause.
    Error,
}

bitflags! {
    /// Optional behavior bits of a stage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Behavior: u8 {
        /// Produces nothing until its upstream reports EOF.
        const ACCUMULATOR = 0x01;
        /// May declare EOF without consulting its upstream again.
        const ABORTER = 0x02;
        /// Touches the live store; requires the store lock held.
        const ACCESS_STORE = 0x04;
    }
}

/// Stage discriminant, for diagnostics and profile reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Source,
    Scorer,
    Metrics,
    Loader,
    Sorter,
    MaxScoreNormalizer,
    Pager,
    Counter,
    Projector,
    Filter,
    Highlighter,
    Grouper,
    Profile,
    BufferLock,
    Unlocker,
    Depleter,
    HybridMerger,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Source => "Index",
            StageKind::Scorer => "Scorer",
            StageKind::Metrics => "Metrics Applier",
            StageKind::Loader => "Loader",
            StageKind::Sorter => "Sorter",
            StageKind::MaxScoreNormalizer => "Score Normalizer",
            StageKind::Pager => "Pager/Limiter",
            StageKind::Counter => "Counter",
            StageKind::Projector => "Projector",
            StageKind::Filter => "Filter",
            StageKind::Highlighter => "Highlighter",
            StageKind::Grouper => "Grouper",
            StageKind::Profile => "Profile",
            StageKind::BufferLock => "Buffer and Locker",
            StageKind::Unlocker => "Unlocker",
            StageKind::Depleter => "Depleter",
            StageKind::HybridMerger => "Hybrid Merger",
        }
    }
}

bitflags! {
    /// Per-result status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResultFlags: u8 {
        /// The document expired between indexing and loading.
        const EXPIRED_DOC = 0x01;
        /// A loader failed to resolve at least one field.
        const VAL_IS_NULL = 0x02;
    }
}

/// One row in transit through a pipeline.
///
/// The terminal consumer clears the result between rows; stages that buffer
/// results take ownership with `std::mem::take`.
#[derive(Debug, Default)]
pub struct SearchResult {
    pub doc_id: u64,
    pub score: f64,
    pub score_explain: Option<Explanation>,
    pub index_result: Option<IndexResult>,
    pub dmd: Option<Arc<DocMetadata>>,
    pub row: Row,
    pub flags: ResultFlags,
}

impl SearchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release everything this result holds, keeping allocations for
    /// reuse. Borrowed metadata is returned, row values are dropped.
    pub fn clear(&mut self) {
        self.score = 0.0;
        self.score_explain = None;
        self.index_result = None;
        self.dmd = None;
        self.row.wipe();
        self.flags = ResultFlags::empty();
    }
}

/// Handle to one lookup inside a pipeline's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupId(pub usize);

/// The lookups of one request. A plain chain has a single lookup; a
/// grouping step opens a fresh one for its output schema.
#[derive(Debug, Default)]
pub struct LookupRegistry {
    items: Vec<Lookup>,
}

impl LookupRegistry {
    pub fn add(&mut self, lookup: Lookup) -> LookupId {
        self.items.push(lookup);
        LookupId(self.items.len() - 1)
    }

    pub fn get(&self, id: LookupId) -> &Lookup {
        &self.items[id.0]
    }

    pub fn get_mut(&mut self, id: LookupId) -> &mut Lookup {
        &mut self.items[id.0]
    }
}

/// Shared per-request execution state, threaded through every stage call.
#[derive(Debug)]
pub struct PipelineCtx {
    /// Matching results seen by the source, net of scorer filtering.
    pub total_results: u64,
    /// Score floor propagated upward from the sorter to the scorer.
    pub min_score: f64,
    /// Shared error slot; set by whichever stage returns `Error` first.
    pub error: Option<QueryError>,
    pub timeout_policy: TimeoutPolicy,
    pub deadline: Option<Instant>,
    /// Cap on results this pipeline should produce (hybrid sub-queries).
    pub result_limit: usize,
    pub lookups: LookupRegistry,
}

impl PipelineCtx {
    pub fn new(timeout_policy: TimeoutPolicy, deadline: Option<Instant>) -> Self {
        Self {
            total_results: 0,
            min_score: 0.0,
            error: None,
            timeout_policy,
            deadline,
            result_limit: usize::MAX,
            lookups: LookupRegistry::default(),
        }
    }

    /// Record `err` in the shared slot and return the `Error` status.
    pub fn fail(&mut self, err: QueryError) -> StageStatus {
        tracing::debug!(error = %err, "pipeline error");
        if self.error.is_none() {
            self.error = Some(err);
        }
        StageStatus::Error
    }
}

/// One link of a result-processor chain.
///
/// A stage must not alter its upstream's state other than by calling
/// `next` on it.
pub trait Stage: Send {
    /// Attempt to produce one result. On `Ok` the result is populated; on
    /// any other status it is untouched or cleared.
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus;

    fn kind(&self) -> StageKind;

    fn behavior(&self) -> Behavior {
        Behavior::empty()
    }

    /// Structural link to the upstream stage, for chain walks.
    fn upstream(&self) -> Option<&dyn Stage> {
        None
    }

    /// Downcast support for out-of-band reads (counter value, profile
    /// numbers).
    fn as_any(&self) -> &dyn Any;
}

/// A stage chain plus its shared execution context.
///
/// Dropping a pipeline tears the chain down from the terminal stage up:
/// each stage owns its upstream, so the chain frees bottom-up.
pub struct Pipeline {
    end: Option<Box<dyn Stage>>,
    pub cx: PipelineCtx,
    profiling: bool,
}

impl Pipeline {
    pub fn new(cx: PipelineCtx) -> Self {
        Self {
            end: None,
            cx,
            profiling: false,
        }
    }

    /// Wrap every subsequently pushed stage with a profiler.
    pub fn enable_profiling(&mut self) {
        self.profiling = true;
    }

    /// Install the root stage (the upstream-most link).
    pub fn set_root(&mut self, stage: Box<dyn Stage>) {
        debug_assert!(self.end.is_none(), "root already installed");
        self.end = Some(self.maybe_profile(stage));
    }

    /// Append a stage downstream of the current terminal stage.
    pub fn push(&mut self, build: impl FnOnce(Box<dyn Stage>) -> Box<dyn Stage>) {
        let upstream = self.end.take().expect("pushing onto an empty pipeline");
        let stage = build(upstream);
        self.end = Some(self.maybe_profile(stage));
    }

    fn maybe_profile(&self, stage: Box<dyn Stage>) -> Box<dyn Stage> {
        if self.profiling {
            Box::new(profile::ProfileStage::new(stage))
        } else {
            stage
        }
    }

    /// Pull one result from the terminal stage.
    pub fn next(&mut self, res: &mut SearchResult) -> StageStatus {
        match &mut self.end {
            Some(stage) => stage.next(&mut self.cx, res),
            None => StageStatus::Eof,
        }
    }

    /// Drain the whole pipeline, collecting produced rows. Returns the
    /// rows together with the terminal status.
    pub fn drain(&mut self) -> (Vec<SearchResult>, StageStatus) {
        let mut rows = Vec::new();
        let mut res = SearchResult::new();
        loop {
            match self.next(&mut res) {
                StageStatus::Ok => rows.push(std::mem::take(&mut res)),
                StageStatus::Paused | StageStatus::Depleting => continue,
                terminal => return (rows, terminal),
            }
        }
    }

    pub fn end_stage(&self) -> Option<&dyn Stage> {
        self.end.as_deref()
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.cx.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<QueryError> {
        self.cx.error.take()
    }

    /// The stage kinds of the chain, terminal first.
    pub fn chain_kinds(&self) -> Vec<StageKind> {
        let mut kinds = Vec::new();
        let mut cur = self.end_stage();
        while let Some(stage) = cur {
            kinds.push(stage.kind());
            cur = stage.upstream();
        }
        kinds
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("chain", &self.chain_kinds())
            .field("total_results", &self.cx.total_results)
            .finish()
    }
}
