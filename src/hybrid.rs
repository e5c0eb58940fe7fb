//! Hybrid request assembly
//!
//! A hybrid request runs N sub-queries (typically a text search and a
//! vector similarity scan), terminates each sub-pipeline with a depleter,
//! and fuses the depleted streams in a merger that feeds a shared tail
//! pipeline. Fusion is reciprocal-rank (RRF) or weighted-linear; the tail
//! applies any further aggregation steps to the merged rows.

use crate::error::{ErrorCode, QueryError};
use crate::expr::Expr;
use crate::index::{DistanceMetric, IndexIterator};
use crate::lookup::{KeyFlags, Lookup};
use crate::pipeline::build::{self, PipelineParams};
use crate::pipeline::depleter::{Depleter, DepleterSync};
use crate::pipeline::merger::HybridMergerStage;
use crate::pipeline::{LookupId, Pipeline, PipelineCtx};
use crate::plan::{AggregatePlan, RequestFlags, RequestOptions};

/// RRF rank constant from the original formulation.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Default per-upstream rank window for RRF fusion.
pub const DEFAULT_RRF_WINDOW: usize = 20;

/// How fused scores are computed from the sub-query streams.
#[derive(Debug, Clone)]
pub enum HybridScoringMode {
    /// `Σ w_i · s_i` over the upstreams holding the document.
    Linear { weights: Vec<f64> },
    /// `Σ 1 / (k + rank_i)` over upstreams ranking the document within
    /// `window`.
    Rrf { k: f64, window: usize },
}

impl HybridScoringMode {
    pub fn rrf() -> Self {
        HybridScoringMode::Rrf {
            k: DEFAULT_RRF_K,
            window: DEFAULT_RRF_WINDOW,
        }
    }
}

/// Normalise a raw vector distance into a similarity score. The mapping
/// depends on the field's distance metric.
pub fn normalize_distance(metric: DistanceMetric, distance: f64) -> f64 {
    match metric {
        DistanceMetric::L2 => 1.0 / (1.0 + distance),
        DistanceMetric::InnerProduct => (1.0 + distance) / 2.0,
        DistanceMetric::Cosine => (1.0 + (1.0 - distance)) / 2.0,
    }
}

/// Effective per-shard KNN window: a cluster spreads `k` nearest
/// neighbours over its shards, so each shard may scan a reduced window.
pub fn effective_shard_window(k: usize, ratio: f64) -> usize {
    if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
        return k.max(1);
    }
    ((k as f64 * ratio).ceil() as usize).clamp(1, k.max(1))
}

/// Rewrite position-dependent validation errors with the sub-query side
/// that violated the rule.
pub fn enhance_subquery_error(err: QueryError, flags: RequestFlags) -> QueryError {
    let vector_side = flags.contains(RequestFlags::HYBRID_VECTOR_SUBQUERY);
    let search_side = flags.contains(RequestFlags::HYBRID_SEARCH_SUBQUERY);
    match err.code() {
        ErrorCode::VectorNotAllowed if vector_side => QueryError::new(
            ErrorCode::VectorNotAllowed,
            "Vector expressions are not allowed in HYBRID VSIM FILTER",
        ),
        ErrorCode::VectorNotAllowed if search_side => QueryError::new(
            ErrorCode::VectorNotAllowed,
            "Vector expressions are not allowed in HYBRID SEARCH",
        ),
        ErrorCode::WeightNotAllowed if vector_side => QueryError::new(
            ErrorCode::WeightNotAllowed,
            "Weight attributes are not allowed in HYBRID VSIM FILTER",
        ),
        _ => err,
    }
}

/// One side of a hybrid request.
pub struct HybridSubQuery {
    pub iter: Option<Box<dyn IndexIterator>>,
    pub plan: AggregatePlan,
    pub options: RequestOptions,
}

impl HybridSubQuery {
    /// The text-search side.
    pub fn search(iter: Box<dyn IndexIterator>, options: RequestOptions) -> Self {
        let mut options = options;
        options.flags |= RequestFlags::HYBRID_SEARCH_SUBQUERY;
        Self {
            iter: Some(iter),
            plan: AggregatePlan::default(),
            options,
        }
    }

    /// The vector-similarity side: its iterator yields distances as the
    /// `distance_field` metric, which a normaliser step rewrites into a
    /// similarity under `score_alias`.
    pub fn vector(
        iter: Box<dyn IndexIterator>,
        distance_field: &str,
        score_alias: &str,
        metric: DistanceMetric,
        options: RequestOptions,
    ) -> Self {
        let mut options = options;
        options.flags |= RequestFlags::HYBRID_VECTOR_SUBQUERY;
        Self {
            iter: Some(iter),
            plan: AggregatePlan::new(vec![crate::plan::PlanStep::VectorNormalizer {
                distance_field: distance_field.to_owned(),
                alias: score_alias.to_owned(),
                metric,
            }]),
            options,
        }
    }

    pub fn with_plan(mut self, plan: AggregatePlan) -> Self {
        self.plan = plan;
        self
    }
}

/// Build the full hybrid pipeline: per-sub-query chains with depleters, a
/// merger, and the tail aggregation. Returns the tail pipeline and its
/// terminal lookup.
pub fn build_hybrid_pipeline(
    subqueries: Vec<HybridSubQuery>,
    scoring: HybridScoringMode,
    score_alias: Option<&str>,
    tail_plan: &AggregatePlan,
    tail_options: &RequestOptions,
    params: &PipelineParams,
) -> Result<(Pipeline, LookupId), QueryError> {
    let _span = tracing::info_span!("build_hybrid", subqueries = subqueries.len()).entered();

    if subqueries.is_empty() {
        return Err(QueryError::new(
            ErrorCode::Invalid,
            "hybrid request needs at least one sub-query",
        ));
    }
    if let HybridScoringMode::Linear { weights } = &scoring {
        if weights.len() != subqueries.len() {
            return Err(QueryError::new(
                ErrorCode::ParseArgs,
                format!(
                    "expected {} linear weights, got {}",
                    subqueries.len(),
                    weights.len()
                ),
            ));
        }
    }

    // Build each sub-pipeline and terminate it with a depleter. The sync
    // handle keeps depletion from starting before every sibling is wired.
    let sync = DepleterSync::new(subqueries.len());
    let mut depleters = Vec::with_capacity(subqueries.len());
    for sub in subqueries {
        let flags = sub.options.flags;
        let (mut pipeline, out_lookup) = build::build_query_pipeline(
            sub.iter,
            &sub.plan,
            &sub.options,
            params,
        )
        .map_err(|e| enhance_subquery_error(e, flags))?;

        pipeline.cx.result_limit = if flags.contains(RequestFlags::HYBRID_VECTOR_SUBQUERY) {
            params.config.max_aggregate_results
        } else {
            params.config.max_search_results
        };
        depleters.push(Depleter::new(pipeline, sync.clone(), flags, out_lookup));
    }

    // Tail context: a unified lookup seeded with every upstream's keys.
    // The first upstream wins name collisions; the per-upstream maps
    // translate carrier rows into the unified slots.
    let mut tail_cx = PipelineCtx::new(params.config.timeout_policy, None);
    let mut tail_lookup = Lookup::new(params.schema.clone());
    tail_lookup.set_option(crate::lookup::LookupOptions::UNRESOLVED_OK);

    let mut key_maps = Vec::with_capacity(depleters.len());
    for depleter in &depleters {
        let src = depleter.pipeline().cx.lookups.get(depleter.lookup());
        let mut map = Vec::new();
        for (_, key) in src.iter() {
            let tail_key = match tail_lookup.find(key.name()) {
                Some(existing) => existing,
                None => tail_lookup
                    .get_key_write(key.name(), KeyFlags::empty())
                    .expect("fresh name cannot conflict"),
            };
            map.push((key.dst_idx(), tail_lookup.key(tail_key).dst_idx()));
        }
        key_maps.push(map);
    }

    let score_key = match score_alias {
        Some(alias) => Some(tail_lookup.get_key_write(alias, KeyFlags::empty()).ok_or_else(
            || {
                QueryError::new(
                    ErrorCode::DupField,
                    format!(
                        "Could not create score alias, name already exists in query: {alias}"
                    ),
                )
            },
        )?),
        None => tail_lookup.get_key_read(build::SCORE_FIELD, KeyFlags::empty()),
    };

    let tail_lookup_id = tail_cx.lookups.add(tail_lookup);
    let mut tail = Pipeline::new(tail_cx);
    if tail_options.flags.contains(RequestFlags::PROFILE) {
        tail.enable_profiling();
    }
    tail.set_root(Box::new(HybridMergerStage::new(
        depleters,
        scoring,
        tail_lookup_id,
        score_key,
        key_maps,
    )));

    let out = build::apply_plan(&mut tail, tail_lookup_id, tail_plan, tail_options, params)?;
    Ok((tail, out))
}

/// Convenience: an expression filtering on the fused score, for tail
/// plans that trim low-quality fusions.
pub fn min_score_filter(score_alias: &str, min: f64) -> Expr {
    Expr::binary(
        crate::expr::BinOp::Ge,
        Expr::prop(score_alias),
        Expr::num(min),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_l2() {
        assert_eq!(normalize_distance(DistanceMetric::L2, 0.0), 1.0);
        assert_eq!(normalize_distance(DistanceMetric::L2, 3.0), 0.25);
    }

    #[test]
    fn test_normalize_inner_product() {
        assert_eq!(normalize_distance(DistanceMetric::InnerProduct, 1.0), 1.0);
        assert_eq!(normalize_distance(DistanceMetric::InnerProduct, -1.0), 0.0);
    }

    #[test]
    fn test_normalize_cosine() {
        // Identical vectors: distance 0 -> similarity 1.
        assert_eq!(normalize_distance(DistanceMetric::Cosine, 0.0), 1.0);
        // Opposite vectors: distance 2 -> similarity 0.
        assert_eq!(normalize_distance(DistanceMetric::Cosine, 2.0), 0.0);
    }

    #[test]
    fn test_effective_shard_window() {
        assert_eq!(effective_shard_window(10, 0.5), 5);
        assert_eq!(effective_shard_window(10, 0.55), 6);
        assert_eq!(effective_shard_window(10, 1.0), 10);
        // Degenerate ratios fall back to the full window.
        assert_eq!(effective_shard_window(10, 0.0), 10);
        assert_eq!(effective_shard_window(10, 2.0), 10);
        // Never below one candidate.
        assert_eq!(effective_shard_window(3, 0.01), 1);
    }

    #[test]
    fn test_enhance_error_names_the_side() {
        let base = QueryError::new(ErrorCode::VectorNotAllowed, "generic");
        let vector = enhance_subquery_error(base.clone(), RequestFlags::HYBRID_VECTOR_SUBQUERY);
        assert!(vector.message.contains("VSIM FILTER"));
        let search = enhance_subquery_error(base.clone(), RequestFlags::HYBRID_SEARCH_SUBQUERY);
        assert!(search.message.contains("HYBRID SEARCH"));
        // Weight errors are only rewritten for the vector side.
        let weight = QueryError::new(ErrorCode::WeightNotAllowed, "generic");
        let unchanged =
            enhance_subquery_error(weight.clone(), RequestFlags::HYBRID_SEARCH_SUBQUERY);
        assert_eq!(unchanged.message, "generic");
    }

    #[test]
    fn test_linear_weight_count_validated() {
        let err = build_hybrid_pipeline(
            vec![],
            HybridScoringMode::Linear { weights: vec![1.0] },
            None,
            &AggregatePlan::default(),
            &RequestOptions::aggregate(),
            &crate::pipeline::build::PipelineParams {
                store: &crate::document::DocumentStore::new(),
                schema: None,
                config: &crate::config::EngineConfig::default(),
                index_stats: Default::default(),
                metrics: Vec::new(),
                shard_range: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
    }
}
