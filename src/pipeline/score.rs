//! Scorer and metrics stages
//!
//! The scorer applies the request's scoring function to each upstream
//! result, honouring the [`FILTER_OUT`] sentinel and attaching explanations
//! when requested. The metrics stage copies per-match metrics (vector
//! distances and the like) from the index result into the row under keys
//! resolved at build time.

use std::any::Any;

use crate::scorer::{ScoringArgs, ScoringFunction, FILTER_OUT};
use crate::value::Value;

use super::{LookupId, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

pub struct ScorerStage {
    upstream: Box<dyn Stage>,
    scorer: ScoringFunction,
    args: ScoringArgs,
    /// Where to write the score into the row, when scores are row fields.
    score_key: Option<(LookupId, crate::lookup::KeyId)>,
}

impl ScorerStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        scorer: ScoringFunction,
        args: ScoringArgs,
        score_key: Option<(LookupId, crate::lookup::KeyId)>,
    ) -> Self {
        Self {
            upstream,
            scorer,
            args,
            score_key,
        }
    }
}

impl Stage for ScorerStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        loop {
            let rc = self.upstream.next(cx, res);
            if rc != StageStatus::Ok {
                return rc;
            }

            let (Some(index_result), Some(dmd)) = (res.index_result.as_ref(), res.dmd.as_ref())
            else {
                // Nothing to score against; leave the zero score.
                return StageStatus::Ok;
            };

            let scored = (self.scorer)(&self.args, index_result, dmd, cx.min_score);
            if scored.score == FILTER_OUT {
                // The source already counted this result; take it back.
                cx.total_results -= 1;
                res.clear();
                continue;
            }

            res.score = scored.score;
            if self.args.explain {
                res.score_explain = scored.explanation;
            }
            if let Some((lookup, key)) = self.score_key {
                cx.lookups
                    .get(lookup)
                    .write_key(key, &mut res.row, Value::number(scored.score));
            }
            return StageStatus::Ok;
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Scorer
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Writes per-match metrics into the row. The `(metric name, key)` pairs
/// are resolved during pipeline construction.
pub struct MetricsStage {
    upstream: Box<dyn Stage>,
    lookup: LookupId,
    bindings: Vec<(String, crate::lookup::KeyId)>,
}

impl MetricsStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        lookup: LookupId,
        bindings: Vec<(String, crate::lookup::KeyId)>,
    ) -> Self {
        Self {
            upstream,
            lookup,
            bindings,
        }
    }
}

impl Stage for MetricsStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let rc = self.upstream.next(cx, res);
        if rc != StageStatus::Ok {
            return rc;
        }

        let Some(index_result) = res.index_result.as_ref() else {
            return rc;
        };
        let lookup = cx.lookups.get(self.lookup);
        for (name, value) in &index_result.metrics {
            if let Some((_, key)) = self.bindings.iter().find(|(n, _)| n == name) {
                lookup.write_key(*key, &mut res.row, value.clone());
            }
        }
        rc
    }

    fn kind(&self) -> StageKind {
        StageKind::Metrics
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
