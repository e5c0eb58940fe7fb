//! Depleter stage
//!
//! Terminates one hybrid sub-pipeline: drains it into a bounded in-memory
//! buffer, then replays the buffer on demand for the merger. The two-phase
//! behavior is an explicit state machine — fill, then drain.
//!
//! All depleters of one hybrid request share a [`DepleterSync`] handle. A
//! depleter reports `Depleting` until every sibling holds its reference,
//! which keeps lock acquisition ordered when sub-pipelines run on the same
//! thread: no depleter starts reading (and locking) before the whole set
//! is wired up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::QueryError;
use crate::plan::RequestFlags;

use super::{LookupId, Pipeline, SearchResult, StageStatus};

/// Shared readiness counter for the depleters of one hybrid request.
#[derive(Debug, Clone)]
pub struct DepleterSync {
    inner: Arc<SyncInner>,
}

#[derive(Debug)]
struct SyncInner {
    expected: usize,
    registered: AtomicUsize,
}

impl DepleterSync {
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                expected,
                registered: AtomicUsize::new(0),
            }),
        }
    }

    fn register(&self) {
        self.inner.registered.fetch_add(1, Ordering::AcqRel);
    }

    fn ready(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire) >= self.inner.expected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepleterState {
    Filling,
    Draining,
}

/// Buffers one sub-pipeline's full output, then serves it row by row.
pub struct Depleter {
    pipeline: Pipeline,
    sync: DepleterSync,
    buffer: VecDeque<SearchResult>,
    state: DepleterState,
    exhaust: StageStatus,
    /// Request flags of the sub-query, for error-context enhancement.
    request_flags: RequestFlags,
    /// The sub-pipeline's output lookup, for key translation in the
    /// merger.
    lookup: LookupId,
}

impl Depleter {
    pub fn new(
        pipeline: Pipeline,
        sync: DepleterSync,
        request_flags: RequestFlags,
        lookup: LookupId,
    ) -> Self {
        sync.register();
        Self {
            pipeline,
            sync,
            buffer: VecDeque::new(),
            state: DepleterState::Filling,
            exhaust: StageStatus::Eof,
            request_flags,
            lookup,
        }
    }

    pub fn request_flags(&self) -> RequestFlags {
        self.request_flags
    }

    pub fn lookup(&self) -> LookupId {
        self.lookup
    }

    /// The sub-pipeline, for lookup access after depletion.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.pipeline.error()
    }

    pub fn take_error(&mut self) -> Option<QueryError> {
        self.pipeline.take_error()
    }

    fn fill(&mut self) {
        let limit = self.pipeline.cx.result_limit;
        let mut scratch = SearchResult::new();
        loop {
            if self.buffer.len() >= limit {
                self.exhaust = StageStatus::Eof;
                break;
            }
            match self.pipeline.next(&mut scratch) {
                StageStatus::Ok => {
                    self.buffer.push_back(std::mem::take(&mut scratch));
                }
                StageStatus::Paused | StageStatus::Depleting => continue,
                terminal => {
                    self.exhaust = terminal;
                    break;
                }
            }
        }
        self.state = DepleterState::Draining;
    }

    /// Stage-contract pull. `Depleting` until every sibling depleter is
    /// registered; afterwards OK per buffered result, then the
    /// sub-pipeline's terminal status.
    pub fn next(&mut self, out: &mut SearchResult) -> StageStatus {
        if self.state == DepleterState::Filling {
            if !self.sync.ready() {
                return StageStatus::Depleting;
            }
            self.fill();
        }
        match self.buffer.pop_front() {
            Some(item) => {
                *out = item;
                StageStatus::Ok
            }
            None => self.exhaust,
        }
    }
}
