//! Accumulator stages: top-K sorter, pager, counter, score normalizer
//!
//! The sorter keeps the best `K` candidates in a bounded min-max heap while
//! its upstream produces, then yields them best-first. The pager applies
//! offset/limit and declares EOF on its own once the window is exhausted.
//! The counter drains its upstream entirely and only counts. The max-score
//! normalizer buffers everything to divide by the best score.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::TimeoutPolicy;
use crate::lookup::KeyId;
use crate::util::minmax_heap::MinMaxHeap;
use crate::value::Value;

use super::{Behavior, LookupId, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

/// Resolved sort key: everything the comparator needs without a lookup.
#[derive(Debug, Clone)]
pub struct SortFieldKey {
    pub dst_idx: usize,
    pub sv_idx: Option<usize>,
    /// Whether the sort vector backs this key when the slot is empty.
    pub use_sv: bool,
    pub ascending: bool,
}

impl SortFieldKey {
    fn item(&self, res: &SearchResult) -> Option<Value> {
        if let Some(v) = res.row.get(self.dst_idx) {
            return Some(v.clone());
        }
        if self.use_sv {
            if let (Some(sv), Some(idx)) = (res.row.sort_vector(), self.sv_idx) {
                let v = sv.get(idx)?;
                if !v.is_null() {
                    return Some(v.clone());
                }
            }
        }
        None
    }
}

type ResultCmp = Arc<dyn Fn(&SearchResult, &SearchResult) -> Ordering + Send + Sync>;

/// `Greater` means "preferred": kept in the heap over the minimum, and
/// emitted earlier during the yield phase.
fn cmp_by_score(a: &SearchResult, b: &SearchResult) -> Ordering {
    match a.score.total_cmp(&b.score) {
        Ordering::Equal => b.doc_id.cmp(&a.doc_id),
        ord => ord,
    }
}

fn cmp_by_fields(keys: &[SortFieldKey], a: &SearchResult, b: &SearchResult) -> Ordering {
    for key in keys {
        match (key.item(a), key.item(b)) {
            // A row missing a sort key orders after one that has it,
            // regardless of direction.
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => break,
            (Some(va), Some(vb)) => {
                let ord = va.total_compare(&vb);
                if ord != Ordering::Equal {
                    return if key.ascending { ord.reverse() } else { ord };
                }
            }
        }
    }
    // docId tie-break, following the direction of the last key.
    let ascending = keys.last().map(|k| k.ascending).unwrap_or(false);
    let ord = match a.doc_id.cmp(&b.doc_id) {
        Ordering::Equal => return Ordering::Equal,
        Ordering::Less => Ordering::Less,
        Ordering::Greater => Ordering::Greater,
    };
    if ascending {
        ord.reverse()
    } else {
        ord
    }
}

pub struct SorterStage {
    upstream: Box<dyn Stage>,
    heap: MinMaxHeap<SearchResult>,
    cmp: ResultCmp,
    size: usize,
    quick_exit: bool,
    yielding: bool,
    exhaust: StageStatus,
    scratch: SearchResult,
}

impl SorterStage {
    /// Top-K by `score`, docId ascending on ties.
    pub fn by_score(upstream: Box<dyn Stage>, max_results: usize, quick_exit: bool) -> Self {
        Self::with_cmp(upstream, max_results, quick_exit, Arc::new(cmp_by_score))
    }

    /// Top-K by a composite sort-key tuple.
    pub fn by_fields(
        upstream: Box<dyn Stage>,
        max_results: usize,
        keys: Vec<SortFieldKey>,
        quick_exit: bool,
    ) -> Self {
        if keys.is_empty() {
            return Self::by_score(upstream, max_results, quick_exit);
        }
        Self::with_cmp(
            upstream,
            max_results,
            quick_exit,
            Arc::new(move |a, b| cmp_by_fields(&keys, a, b)),
        )
    }

    fn with_cmp(
        upstream: Box<dyn Stage>,
        max_results: usize,
        quick_exit: bool,
        cmp: ResultCmp,
    ) -> Self {
        let heap_cmp = cmp.clone();
        Self {
            upstream,
            heap: MinMaxHeap::with_capacity(max_results.min(4096), move |a, b| heap_cmp(a, b)),
            cmp,
            size: max_results,
            quick_exit,
            yielding: false,
            exhaust: StageStatus::Eof,
            scratch: SearchResult::new(),
        }
    }

    fn accumulate(&mut self, cx: &mut PipelineCtx) -> Option<StageStatus> {
        loop {
            self.scratch.clear();
            match self.upstream.next(cx, &mut self.scratch) {
                StageStatus::Ok => {}
                StageStatus::Eof => {
                    self.yielding = true;
                    return None;
                }
                StageStatus::TimedOut if cx.timeout_policy == TimeoutPolicy::Return => {
                    // Yield what we have; the terminal status stays a
                    // timeout once the heap is drained.
                    self.yielding = true;
                    self.exhaust = StageStatus::TimedOut;
                    return None;
                }
                other => return Some(other),
            }

            if self.size == 0 {
                continue;
            }

            if self.heap.len() < self.size {
                let mut taken = std::mem::take(&mut self.scratch);
                // The index result borrows reader state; it must not
                // outlive the scan.
                taken.index_result = None;
                if taken.score < cx.min_score {
                    cx.min_score = taken.score;
                }
                self.heap.push(taken);
                if self.quick_exit && self.heap.len() == self.size {
                    // A full heap cannot improve further under quick-exit.
                    self.yielding = true;
                    return None;
                }
            } else {
                let preferred = {
                    let min = self.heap.peek_min().expect("heap is full");
                    if min.score > cx.min_score {
                        cx.min_score = min.score;
                    }
                    (self.cmp)(&self.scratch, min) == Ordering::Greater
                };
                if preferred {
                    self.scratch.index_result = None;
                    let taken = std::mem::take(&mut self.scratch);
                    if let Some(evicted) = self.heap.replace_min(taken) {
                        // Reuse the evicted result's allocations.
                        self.scratch = evicted;
                    }
                }
            }
        }
    }
}

impl Stage for SorterStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        if !self.yielding {
            if let Some(status) = self.accumulate(cx) {
                return status;
            }
        }
        match self.heap.pop_max() {
            Some(best) => {
                *res = best;
                StageStatus::Ok
            }
            None => self.exhaust,
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Sorter
    }

    fn behavior(&self) -> Behavior {
        Behavior::ACCUMULATOR
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct PagerStage {
    upstream: Box<dyn Stage>,
    offset: usize,
    limit: usize,
    count: usize,
}

impl PagerStage {
    pub fn new(upstream: Box<dyn Stage>, offset: usize, limit: usize) -> Self {
        Self {
            upstream,
            offset,
            limit,
            count: 0,
        }
    }
}

impl Stage for PagerStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        // Skip until the offset.
        while self.count < self.offset {
            let rc = self.upstream.next(cx, res);
            if rc != StageStatus::Ok {
                return rc;
            }
            self.count += 1;
            res.clear();
        }

        // Window exhausted: EOF without consulting upstream again.
        if self.count >= self.offset + self.limit {
            return StageStatus::Eof;
        }

        let rc = self.upstream.next(cx, res);
        if rc == StageStatus::Ok {
            self.count += 1;
        }
        rc
    }

    fn kind(&self) -> StageKind {
        StageKind::Pager
    }

    fn behavior(&self) -> Behavior {
        Behavior::ABORTER
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Drains its upstream counting OK results; never produces a row. The
/// count is read out of band.
pub struct CounterStage {
    upstream: Box<dyn Stage>,
    count: u64,
}

impl CounterStage {
    pub fn new(upstream: Box<dyn Stage>) -> Self {
        Self { upstream, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Stage for CounterStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        loop {
            let rc = self.upstream.next(cx, res);
            if rc != StageStatus::Ok {
                return rc;
            }
            self.count += 1;
            res.clear();
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Counter
    }

    fn behavior(&self) -> Behavior {
        Behavior::ACCUMULATOR
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Buffers the whole stream, then emits each result with its score divided
/// by the maximum seen. All-zero result sets normalise to 1.
pub struct MaxScoreNormalizerStage {
    upstream: Box<dyn Stage>,
    score_key: Option<(LookupId, KeyId)>,
    buffer: VecDeque<SearchResult>,
    max_score: f64,
    yielding: bool,
    exhaust: StageStatus,
}

impl MaxScoreNormalizerStage {
    pub fn new(upstream: Box<dyn Stage>, score_key: Option<(LookupId, KeyId)>) -> Self {
        Self {
            upstream,
            score_key,
            buffer: VecDeque::new(),
            max_score: 0.0,
            yielding: false,
            exhaust: StageStatus::Eof,
        }
    }
}

impl Stage for MaxScoreNormalizerStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        if !self.yielding {
            loop {
                let mut item = SearchResult::new();
                match self.upstream.next(cx, &mut item) {
                    StageStatus::Ok => {
                        self.max_score = self.max_score.max(item.score);
                        self.buffer.push_back(item);
                    }
                    StageStatus::Eof => {
                        self.yielding = true;
                        break;
                    }
                    StageStatus::TimedOut if cx.timeout_policy == TimeoutPolicy::Return => {
                        self.yielding = true;
                        self.exhaust = StageStatus::TimedOut;
                        break;
                    }
                    other => return other,
                }
            }
        }

        match self.buffer.pop_front() {
            Some(mut item) => {
                item.score = if self.max_score > 0.0 {
                    item.score / self.max_score
                } else {
                    1.0
                };
                if let Some((lookup, key)) = self.score_key {
                    cx.lookups
                        .get(lookup)
                        .write_key(key, &mut item.row, Value::number(item.score));
                }
                *res = item;
                StageStatus::Ok
            }
            None => self.exhaust,
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::MaxScoreNormalizer
    }

    fn behavior(&self) -> Behavior {
        Behavior::ACCUMULATOR
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::FixtureStage;
    use crate::pipeline::Pipeline;

    fn scored_pipeline(items: Vec<(u64, f64)>) -> Pipeline {
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(FixtureStage::new(items)));
        p
    }

    // ===== sorter =====

    #[test]
    fn test_top_k_by_score() {
        let mut p = scored_pipeline(vec![(1, 0.5), (2, 0.9), (3, 0.1), (4, 0.7), (5, 0.3)]);
        p.push(|up| Box::new(SorterStage::by_score(up, 3, false)));
        let (rows, status) = p.drain();
        assert_eq!(status, StageStatus::Eof);
        let got: Vec<(u64, f64)> = rows.iter().map(|r| (r.doc_id, r.score)).collect();
        assert_eq!(got, vec![(2, 0.9), (4, 0.7), (1, 0.5)]);
    }

    #[test]
    fn test_score_ties_break_by_doc_id_ascending() {
        let mut p = scored_pipeline(vec![(3, 0.5), (1, 0.5), (2, 0.5)]);
        p.push(|up| Box::new(SorterStage::by_score(up, 3, false)));
        let (rows, _) = p.drain();
        let ids: Vec<u64> = rows.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_limit_larger_than_stream() {
        let mut p = scored_pipeline(vec![(1, 0.2), (2, 0.8)]);
        p.push(|up| Box::new(SorterStage::by_score(up, 100, false)));
        let (rows, _) = p.drain();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].doc_id, 2);
    }

    #[test]
    fn test_min_score_propagates_when_heap_full() {
        let mut p = scored_pipeline(vec![(1, 0.9), (2, 0.8), (3, 0.1), (4, 0.2)]);
        p.push(|up| Box::new(SorterStage::by_score(up, 2, false)));
        let (_, _) = p.drain();
        // With the heap full at {0.9, 0.8}, the floor rises to the kept
        // minimum.
        assert!(p.cx.min_score >= 0.8);
    }

    #[test]
    fn test_quick_exit_stops_at_capacity() {
        // Upstream that panics if pulled more than `cap` times.
        struct Limited {
            inner: FixtureStage,
            pulls: usize,
            cap: usize,
        }
        impl Stage for Limited {
            fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
                self.pulls += 1;
                assert!(self.pulls <= self.cap, "quick-exit must stop pulling");
                self.inner.next(cx, res)
            }
            fn kind(&self) -> StageKind {
                StageKind::Source
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(Limited {
            inner: FixtureStage::new(vec![(1, 0.1), (2, 0.2), (3, 0.3), (4, 0.4)]),
            pulls: 0,
            cap: 2,
        }));
        p.push(|up| Box::new(SorterStage::by_score(up, 2, true)));
        let (rows, _) = p.drain();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_timeout_return_yields_partial_then_timeout() {
        struct TimingOut {
            emitted: usize,
        }
        impl Stage for TimingOut {
            fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
                if self.emitted < 2 {
                    self.emitted += 1;
                    cx.total_results += 1;
                    res.doc_id = self.emitted as u64;
                    res.score = self.emitted as f64 * 0.1;
                    StageStatus::Ok
                } else {
                    StageStatus::TimedOut
                }
            }
            fn kind(&self) -> StageKind {
                StageKind::Source
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(TimingOut { emitted: 0 }));
        p.push(|up| Box::new(SorterStage::by_score(up, 100, false)));
        let (rows, status) = p.drain();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].score, 0.2);
        assert_eq!(rows[1].score, 0.1);
        assert_eq!(status, StageStatus::TimedOut);
    }

    #[test]
    fn test_timeout_fail_propagates_immediately() {
        struct TimesOut;
        impl Stage for TimesOut {
            fn next(&mut self, _cx: &mut PipelineCtx, _res: &mut SearchResult) -> StageStatus {
                StageStatus::TimedOut
            }
            fn kind(&self) -> StageKind {
                StageKind::Source
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Fail, None));
        p.set_root(Box::new(TimesOut));
        p.push(|up| Box::new(SorterStage::by_score(up, 10, false)));
        let (rows, status) = p.drain();
        assert!(rows.is_empty());
        assert_eq!(status, StageStatus::TimedOut);
    }

    #[test]
    fn test_cmp_by_fields_mixed_directions() {
        // Key 0 descending on slot 0, key 1 ascending on slot 1.
        let keys = vec![
            SortFieldKey {
                dst_idx: 0,
                sv_idx: None,
                use_sv: false,
                ascending: false,
            },
            SortFieldKey {
                dst_idx: 1,
                sv_idx: None,
                use_sv: false,
                ascending: true,
            },
        ];
        let result = |doc_id: u64, a: f64, b: f64| {
            let mut r = SearchResult::new();
            r.doc_id = doc_id;
            r.row.set(0, Value::number(a));
            r.row.set(1, Value::number(b));
            r
        };

        // Primary key differs: larger wins under descending.
        let hi = result(1, 9.0, 0.0);
        let lo = result(2, 1.0, 0.0);
        assert_eq!(cmp_by_fields(&keys, &hi, &lo), Ordering::Greater);

        // Primary ties: smaller secondary wins under ascending.
        let small = result(3, 5.0, 1.0);
        let big = result(4, 5.0, 2.0);
        assert_eq!(cmp_by_fields(&keys, &small, &big), Ordering::Greater);

        // A row missing the primary key loses either way.
        let mut missing = SearchResult::new();
        missing.doc_id = 5;
        assert_eq!(cmp_by_fields(&keys, &hi, &missing), Ordering::Greater);
        assert_eq!(cmp_by_fields(&keys, &missing, &hi), Ordering::Less);
    }

    // ===== pager =====

    #[test]
    fn test_pager_window() {
        let items: Vec<(u64, f64)> = (1..=10).map(|i| (i, i as f64)).collect();
        let mut p = scored_pipeline(items);
        p.push(|up| Box::new(PagerStage::new(up, 3, 4)));
        let (rows, status) = p.drain();
        assert_eq!(status, StageStatus::Eof);
        let ids: Vec<u64> = rows.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_pager_never_overpulls() {
        struct CountingSource {
            inner: FixtureStage,
            pulls: usize,
        }
        impl Stage for CountingSource {
            fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
                self.pulls += 1;
                self.inner.next(cx, res)
            }
            fn kind(&self) -> StageKind {
                StageKind::Source
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let items: Vec<(u64, f64)> = (1..=100).map(|i| (i, 1.0)).collect();
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(CountingSource {
            inner: FixtureStage::new(items),
            pulls: 0,
        }));
        p.push(|up| Box::new(PagerStage::new(up, 2, 3)));
        let (rows, _) = p.drain();
        assert_eq!(rows.len(), 3);

        // offset + limit pulls, not one more.
        let pager = p.end_stage().unwrap();
        let counting = pager.upstream().unwrap();
        let counting = counting.as_any().downcast_ref::<CountingSource>().unwrap();
        assert_eq!(counting.pulls, 5);
    }

    #[test]
    fn test_pager_short_stream() {
        let mut p = scored_pipeline(vec![(1, 1.0), (2, 1.0)]);
        p.push(|up| Box::new(PagerStage::new(up, 5, 5)));
        let (rows, status) = p.drain();
        assert!(rows.is_empty());
        assert_eq!(status, StageStatus::Eof);
    }

    // ===== counter =====

    #[test]
    fn test_counter_drains_without_rows() {
        let mut p = scored_pipeline(vec![(1, 1.0), (2, 1.0), (3, 1.0)]);
        p.push(|up| Box::new(CounterStage::new(up)));
        let (rows, status) = p.drain();
        assert!(rows.is_empty());
        assert_eq!(status, StageStatus::Eof);
        let counter = p
            .end_stage()
            .unwrap()
            .as_any()
            .downcast_ref::<CounterStage>()
            .unwrap();
        assert_eq!(counter.count(), 3);
    }

    // ===== max-score normalizer =====

    #[test]
    fn test_normalizer_divides_by_max() {
        let mut p = scored_pipeline(vec![(1, 2.0), (2, 4.0), (3, 1.0)]);
        p.push(|up| Box::new(MaxScoreNormalizerStage::new(up, None)));
        let (rows, _) = p.drain();
        let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![0.5, 1.0, 0.25]);
    }

    #[test]
    fn test_normalizer_all_zero() {
        let mut p = scored_pipeline(vec![(1, 0.0), (2, 0.0)]);
        p.push(|up| Box::new(MaxScoreNormalizerStage::new(up, None)));
        let (rows, _) = p.drain();
        assert!(rows.iter().all(|r| r.score == 1.0));
    }
}
