//! Projector, filter and vector-normalizer stages
//!
//! One-in / one-out transformers. The projector evaluates an expression
//! and stores the result under its destination key; the filter drops rows
//! whose predicate is not truthy; the vector normalizer rewrites a raw
//! vector distance into a similarity score.

use std::any::Any;

use crate::expr::BoundExpr;
use crate::hybrid::normalize_distance;
use crate::index::DistanceMetric;
use crate::lookup::KeyId;
use crate::value::Value;

use super::{LookupId, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

pub struct ProjectorStage {
    upstream: Box<dyn Stage>,
    lookup: LookupId,
    expr: BoundExpr,
    out_key: KeyId,
}

impl ProjectorStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        lookup: LookupId,
        expr: BoundExpr,
        out_key: KeyId,
    ) -> Self {
        Self {
            upstream,
            lookup,
            expr,
            out_key,
        }
    }
}

impl Stage for ProjectorStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let rc = self.upstream.next(cx, res);
        if rc != StageStatus::Ok {
            return rc;
        }
        match self.expr.eval(cx.lookups.get(self.lookup), &res.row) {
            Ok(value) => {
                cx.lookups
                    .get(self.lookup)
                    .write_key(self.out_key, &mut res.row, value);
                StageStatus::Ok
            }
            Err(err) => cx.fail(err),
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Projector
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct FilterStage {
    upstream: Box<dyn Stage>,
    lookup: LookupId,
    expr: BoundExpr,
}

impl FilterStage {
    pub fn new(upstream: Box<dyn Stage>, lookup: LookupId, expr: BoundExpr) -> Self {
        Self {
            upstream,
            lookup,
            expr,
        }
    }
}

impl Stage for FilterStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        loop {
            let rc = self.upstream.next(cx, res);
            if rc != StageStatus::Ok {
                return rc;
            }
            match self.expr.eval(cx.lookups.get(self.lookup), &res.row) {
                Ok(value) if value.is_truthy() => return StageStatus::Ok,
                Ok(_) => {
                    res.clear();
                    continue;
                }
                Err(err) => return cx.fail(err),
            }
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Rewrites the raw distance a vector scan produced into a normalised
/// similarity in `[0, 1]`-ish range, under the requested alias.
pub struct VectorNormalizerStage {
    upstream: Box<dyn Stage>,
    lookup: LookupId,
    distance_key: KeyId,
    out_key: KeyId,
    metric: DistanceMetric,
}

impl VectorNormalizerStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        lookup: LookupId,
        distance_key: KeyId,
        out_key: KeyId,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            upstream,
            lookup,
            distance_key,
            out_key,
            metric,
        }
    }
}

impl Stage for VectorNormalizerStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let rc = self.upstream.next(cx, res);
        if rc != StageStatus::Ok {
            return rc;
        }
        let lookup = cx.lookups.get(self.lookup);
        let distance = lookup
            .get_item(self.distance_key, &res.row)
            .and_then(|v| v.to_number());
        if let Some(d) = distance {
            let similarity = normalize_distance(self.metric, d);
            lookup.write_key(self.out_key, &mut res.row, Value::number(similarity));
            res.score = similarity;
        }
        StageStatus::Ok
    }

    fn kind(&self) -> StageKind {
        StageKind::Projector
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
