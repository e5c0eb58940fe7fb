//! Hybrid merger stage
//!
//! Fuses the ranked streams of N depleter upstreams into one stream of
//! merged results, scored by reciprocal-rank fusion or a weighted linear
//! combination. For every document the first upstream (by index) holding
//! it supplies the row; flags merge across all entries; the fused score
//! lands in the `score` field and, when a score key is configured, in the
//! row.
//!
//! Error precedence across upstreams is ERROR > TIMED_OUT > EOF. Under the
//! fail timeout policy a timeout aborts with no emissions; under the
//! return policy every fused row is emitted before the timeout surfaces.

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use crate::config::TimeoutPolicy;
use crate::error::{ErrorCode, QueryError};
use crate::hybrid::{enhance_subquery_error, HybridScoringMode};
use crate::lookup::{KeyId, Row};
use crate::value::Value;

use super::depleter::Depleter;
use super::{
    Behavior, LookupId, PipelineCtx, SearchResult, Stage, StageKind, StageStatus,
};

struct Bucket {
    entries: Vec<Option<SearchResult>>,
    score: f64,
    /// Whether any upstream ranked this document inside its window.
    ranked: bool,
}

pub struct HybridMergerStage {
    depleters: Vec<Depleter>,
    scoring: HybridScoringMode,
    tail_lookup: LookupId,
    score_key: Option<KeyId>,
    /// Per upstream: `(source slot, tail slot)` pairs translating rows
    /// into the unified schema.
    key_maps: Vec<Vec<(usize, usize)>>,
    fused: VecDeque<SearchResult>,
    collected: bool,
    exhaust: StageStatus,
}

impl HybridMergerStage {
    pub fn new(
        depleters: Vec<Depleter>,
        scoring: HybridScoringMode,
        tail_lookup: LookupId,
        score_key: Option<KeyId>,
        key_maps: Vec<Vec<(usize, usize)>>,
    ) -> Self {
        debug_assert_eq!(depleters.len(), key_maps.len());
        Self {
            depleters,
            scoring,
            tail_lookup,
            score_key,
            key_maps,
            fused: VecDeque::new(),
            collected: false,
            exhaust: StageStatus::Eof,
        }
    }

    /// Drain every depleter and fuse the buckets. Returns a status to
    /// surface immediately, or `None` when fused rows are ready.
    fn collect(&mut self, cx: &mut PipelineCtx) -> Option<StageStatus> {
        let n = self.depleters.len();
        let mut per_upstream: Vec<Vec<SearchResult>> = Vec::with_capacity(n);
        let mut timed_out = false;

        for depleter in &mut self.depleters {
            let mut list = Vec::new();
            loop {
                let mut item = SearchResult::new();
                match depleter.next(&mut item) {
                    StageStatus::Ok => list.push(item),
                    StageStatus::Depleting | StageStatus::Paused => continue,
                    StageStatus::Eof => break,
                    StageStatus::TimedOut => {
                        timed_out = true;
                        break;
                    }
                    StageStatus::Error => {
                        let err = depleter.take_error().unwrap_or_else(|| {
                            QueryError::new(ErrorCode::Generic, "sub-query failed")
                        });
                        let err = enhance_subquery_error(err, depleter.request_flags());
                        return Some(cx.fail(err));
                    }
                }
            }
            per_upstream.push(list);
        }

        if timed_out && cx.timeout_policy == TimeoutPolicy::Fail {
            return Some(StageStatus::TimedOut);
        }
        if timed_out {
            self.exhaust = StageStatus::TimedOut;
        }

        // Per-upstream contribution of each document.
        let contributions: Vec<HashMap<u64, f64>> = match &self.scoring {
            HybridScoringMode::Linear { weights } => per_upstream
                .iter()
                .enumerate()
                .map(|(i, list)| {
                    let w = weights.get(i).copied().unwrap_or(0.0);
                    let mut m = HashMap::with_capacity(list.len());
                    for r in list {
                        m.entry(r.doc_id).or_insert(w * r.score);
                    }
                    m
                })
                .collect(),
            HybridScoringMode::Rrf { k, window } => per_upstream
                .iter()
                .map(|list| {
                    let mut order: Vec<usize> = (0..list.len()).collect();
                    order.sort_by(|&a, &b| list[b].score.total_cmp(&list[a].score));
                    let mut m = HashMap::with_capacity((*window).min(list.len()));
                    for (rank, &idx) in order.iter().take(*window).enumerate() {
                        m.entry(list[idx].doc_id)
                            .or_insert(1.0 / (k + (rank + 1) as f64));
                    }
                    m
                })
                .collect(),
        };
        // RRF only emits documents ranked inside some upstream's window.
        let windowed = matches!(self.scoring, HybridScoringMode::Rrf { .. });

        let mut order: Vec<u64> = Vec::new();
        let mut buckets: HashMap<u64, Bucket> = HashMap::new();
        for (i, list) in per_upstream.into_iter().enumerate() {
            for result in list {
                let contribution = contributions[i].get(&result.doc_id).copied();
                let bucket = buckets.entry(result.doc_id).or_insert_with(|| {
                    order.push(result.doc_id);
                    Bucket {
                        entries: (0..n).map(|_| None).collect(),
                        score: 0.0,
                        ranked: false,
                    }
                });
                if bucket.entries[i].is_none() {
                    bucket.score += contribution.unwrap_or(0.0);
                    bucket.ranked |= contribution.is_some();
                    bucket.entries[i] = Some(result);
                }
            }
        }

        for doc_id in order {
            let bucket = buckets.remove(&doc_id).expect("bucket inserted above");
            // Under RRF, documents outside every upstream's window are not
            // emitted at all.
            if windowed && !bucket.ranked {
                continue;
            }
            let score = bucket.score;

            let mut primary: Option<(usize, SearchResult)> = None;
            let mut merged_flags = super::ResultFlags::empty();
            for (i, entry) in bucket.entries.into_iter().enumerate() {
                let Some(result) = entry else { continue };
                merged_flags |= result.flags;
                if primary.is_none() {
                    primary = Some((i, result));
                }
                // Later entries only contribute their flags; their rows,
                // metadata and explanations are released here.
            }
            let (primary_idx, mut primary) = primary.expect("bucket holds at least one entry");

            primary.flags = merged_flags;
            primary.score = score;

            // Translate the carrier row into the unified tail schema.
            let mut row = Row::new();
            row.set_sort_vector(primary.row.sort_vector().cloned());
            for &(src, dst) in &self.key_maps[primary_idx] {
                if let Some(v) = primary.row.get(src) {
                    row.set(dst, v.clone());
                }
            }
            primary.row = row;

            if let Some(key) = self.score_key {
                cx.lookups.get(self.tail_lookup).write_key(
                    key,
                    &mut primary.row,
                    Value::number(score),
                );
            }

            self.fused.push_back(primary);
        }

        cx.total_results += self.fused.len() as u64;
        None
    }
}

impl Stage for HybridMergerStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        if !self.collected {
            self.collected = true;
            if let Some(status) = self.collect(cx) {
                self.exhaust = status;
                return status;
            }
        }
        match self.fused.pop_front() {
            Some(item) => {
                *res = item;
                StageStatus::Ok
            }
            None => self.exhaust,
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::HybridMerger
    }

    fn behavior(&self) -> Behavior {
        Behavior::ACCUMULATOR
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::depleter::DepleterSync;
    use crate::pipeline::tests::FixtureStage;
    use crate::pipeline::Pipeline;
    use crate::plan::RequestFlags;

    fn depleter(items: Vec<(u64, f64)>, sync: &DepleterSync) -> Depleter {
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(FixtureStage::new(items)));
        let lookup = p.cx.lookups.add(crate::lookup::Lookup::new(None));
        Depleter::new(p, sync.clone(), RequestFlags::empty(), lookup)
    }

    fn merge(
        upstreams: Vec<Vec<(u64, f64)>>,
        scoring: HybridScoringMode,
    ) -> (Vec<SearchResult>, StageStatus) {
        let sync = DepleterSync::new(upstreams.len());
        let n = upstreams.len();
        let depleters: Vec<Depleter> = upstreams
            .into_iter()
            .map(|items| depleter(items, &sync))
            .collect();

        let mut cx = PipelineCtx::new(TimeoutPolicy::Return, None);
        let tail_lookup = cx.lookups.add(crate::lookup::Lookup::new(None));
        let mut p = Pipeline::new(cx);
        p.set_root(Box::new(HybridMergerStage::new(
            depleters,
            scoring,
            tail_lookup,
            None,
            vec![Vec::new(); n],
        )));
        p.drain()
    }

    fn score_of(rows: &[SearchResult], doc_id: u64) -> Option<f64> {
        rows.iter().find(|r| r.doc_id == doc_id).map(|r| r.score)
    }

    #[test]
    fn test_linear_partial_intersection() {
        let (rows, status) = merge(
            vec![
                vec![(1, 1.0), (2, 1.0), (3, 1.0)],
                vec![(2, 1.0), (3, 1.0), (4, 1.0), (5, 1.0)],
            ],
            HybridScoringMode::Linear {
                weights: vec![0.5, 0.5],
            },
        );
        assert_eq!(status, StageStatus::Eof);
        assert_eq!(rows.len(), 5);
        assert_eq!(score_of(&rows, 1), Some(0.5));
        assert_eq!(score_of(&rows, 4), Some(0.5));
        assert_eq!(score_of(&rows, 5), Some(0.5));
        assert_eq!(score_of(&rows, 2), Some(1.0));
        assert_eq!(score_of(&rows, 3), Some(1.0));
    }

    #[test]
    fn test_rrf_window_limits_emissions() {
        let (rows, _) = merge(
            vec![
                vec![(1, 0.9), (2, 0.5), (3, 0.1), (4, 0.05), (5, 0.01)],
                vec![(11, 0.8), (12, 0.4), (13, 0.2), (14, 0.06), (15, 0.02)],
            ],
            HybridScoringMode::Rrf { k: 60.0, window: 2 },
        );
        assert_eq!(rows.len(), 4);
        let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
        assert!(close(score_of(&rows, 1).unwrap(), 1.0 / 61.0));
        assert!(close(score_of(&rows, 11).unwrap(), 1.0 / 61.0));
        assert!(close(score_of(&rows, 2).unwrap(), 1.0 / 62.0));
        assert!(close(score_of(&rows, 12).unwrap(), 1.0 / 62.0));
        assert!(score_of(&rows, 3).is_none());
    }

    #[test]
    fn test_rrf_overlap_sums_ranks() {
        let (rows, _) = merge(
            vec![vec![(7, 0.9), (8, 0.5)], vec![(8, 0.8), (7, 0.4)]],
            HybridScoringMode::Rrf { k: 60.0, window: 10 },
        );
        assert_eq!(rows.len(), 2);
        // doc 7: rank 1 + rank 2; doc 8: rank 2 + rank 1 — equal fusion.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((score_of(&rows, 7).unwrap() - expected).abs() < 1e-12);
        assert!((score_of(&rows, 8).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_merged_count_lands_in_total_results() {
        let sync = DepleterSync::new(2);
        let depleters = vec![
            depleter(vec![(1, 1.0)], &sync),
            depleter(vec![(1, 1.0), (2, 1.0)], &sync),
        ];
        let mut cx = PipelineCtx::new(TimeoutPolicy::Return, None);
        let tail_lookup = cx.lookups.add(crate::lookup::Lookup::new(None));
        let mut p = Pipeline::new(cx);
        p.set_root(Box::new(HybridMergerStage::new(
            depleters,
            HybridScoringMode::Linear {
                weights: vec![1.0, 1.0],
            },
            tail_lookup,
            None,
            vec![Vec::new(), Vec::new()],
        )));
        let (rows, _) = p.drain();
        assert_eq!(rows.len(), 2);
        assert_eq!(p.cx.total_results, 2);
    }

    #[test]
    fn test_upstream_error_has_precedence() {
        struct Failing;
        impl Stage for Failing {
            fn next(&mut self, cx: &mut PipelineCtx, _res: &mut SearchResult) -> StageStatus {
                cx.fail(QueryError::new(
                    ErrorCode::VectorNotAllowed,
                    "Vector expressions are not allowed here",
                ))
            }
            fn kind(&self) -> StageKind {
                StageKind::Source
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let sync = DepleterSync::new(2);
        let ok_side = depleter(vec![(1, 1.0)], &sync);
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(Failing));
        let lookup = p.cx.lookups.add(crate::lookup::Lookup::new(None));
        let failing_side = Depleter::new(
            p,
            sync,
            RequestFlags::HYBRID_VECTOR_SUBQUERY,
            lookup,
        );

        let mut cx = PipelineCtx::new(TimeoutPolicy::Return, None);
        let tail_lookup = cx.lookups.add(crate::lookup::Lookup::new(None));
        let mut tail = Pipeline::new(cx);
        tail.set_root(Box::new(HybridMergerStage::new(
            vec![ok_side, failing_side],
            HybridScoringMode::Linear {
                weights: vec![0.5, 0.5],
            },
            tail_lookup,
            None,
            vec![Vec::new(), Vec::new()],
        )));
        let (rows, status) = tail.drain();
        assert!(rows.is_empty());
        assert_eq!(status, StageStatus::Error);
        let err = tail.error().unwrap();
        assert_eq!(err.code(), ErrorCode::VectorNotAllowed);
        // Context names the offending sub-query side.
        assert!(err.message.contains("VSIM FILTER"), "got: {}", err.message);
    }
}
