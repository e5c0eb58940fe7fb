//! Hybrid request scenarios: depletion, rank fusion, tail aggregation.

mod common;

use common::{term_matches, TestWorld};
use quarry::hybrid::{build_hybrid_pipeline, HybridScoringMode, HybridSubQuery};
use quarry::index::{DistanceMetric, MetricIterator};
use quarry::pipeline::{SearchResult, StageStatus};
use quarry::plan::{AggregatePlan, PlanStep, RequestOptions, SortSpec};
use quarry::schema::FieldSpec;

fn doc_scored_search(ids: &[u64]) -> HybridSubQuery {
    let mut options = RequestOptions::default();
    options.scorer = Some("DOCSCORE".into());
    HybridSubQuery::search(term_matches(ids), options)
}

fn score_of(rows: &[SearchResult], doc_id: u64) -> Option<f64> {
    rows.iter().find(|r| r.doc_id == doc_id).map(|r| r.score)
}

#[test]
fn test_linear_fusion_partial_intersection() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let ids: Vec<u64> = (1..=5)
        .map(|i| {
            world
                .store
                .add_record(&world.schema, &format!("doc:{i}"), vec![], 1.0)
        })
        .collect();

    // Upstream 1 holds {1,2,3}; upstream 2 holds {2,3,4,5}; all score 1.
    let side_a = doc_scored_search(&ids[0..3]);
    let side_b = doc_scored_search(&ids[1..5]);

    let (mut tail, _) = build_hybrid_pipeline(
        vec![side_a, side_b],
        HybridScoringMode::Linear {
            weights: vec![0.5, 0.5],
        },
        None,
        &AggregatePlan::default(),
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, status) = tail.drain();
    assert_eq!(status, StageStatus::Eof);
    assert_eq!(rows.len(), 5);
    assert_eq!(score_of(&rows, ids[0]), Some(0.5));
    assert_eq!(score_of(&rows, ids[1]), Some(1.0));
    assert_eq!(score_of(&rows, ids[2]), Some(1.0));
    assert_eq!(score_of(&rows, ids[3]), Some(0.5));
    assert_eq!(score_of(&rows, ids[4]), Some(0.5));
}

#[test]
fn test_rrf_fusion_with_window() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let a_scores = [0.9, 0.5, 0.1, 0.05, 0.01];
    let b_scores = [0.8, 0.4, 0.2, 0.06, 0.02];
    let a_ids: Vec<u64> = a_scores
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            world
                .store
                .add_record(&world.schema, &format!("a:{i}"), vec![], s)
        })
        .collect();
    let b_ids: Vec<u64> = b_scores
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            world
                .store
                .add_record(&world.schema, &format!("b:{i}"), vec![], s)
        })
        .collect();

    let (mut tail, _) = build_hybrid_pipeline(
        vec![doc_scored_search(&a_ids), doc_scored_search(&b_ids)],
        HybridScoringMode::Rrf { k: 60.0, window: 2 },
        None,
        &AggregatePlan::default(),
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, _) = tail.drain();
    assert_eq!(rows.len(), 4, "only windowed documents are fused");
    let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
    assert!(close(score_of(&rows, a_ids[0]).unwrap(), 1.0 / 61.0));
    assert!(close(score_of(&rows, b_ids[0]).unwrap(), 1.0 / 61.0));
    assert!(close(score_of(&rows, a_ids[1]).unwrap(), 1.0 / 62.0));
    assert!(close(score_of(&rows, b_ids[1]).unwrap(), 1.0 / 62.0));
}

#[test]
fn test_vector_side_normalizes_distances() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let near = world
        .store
        .add_record(&world.schema, "doc:near", vec![], 1.0);
    let far = world.store.add_record(&world.schema, "doc:far", vec![], 1.0);

    let mut p = world.params();
    p.metrics = vec!["__vector_distance".into()];

    // L2 distances: near 0.0 -> similarity 1.0, far 3.0 -> 0.25.
    let vector_iter = Box::new(MetricIterator::new(
        "__vector_distance",
        vec![(near, 0.0), (far, 3.0)],
    ));
    let vector_side = HybridSubQuery::vector(
        vector_iter,
        "__vector_distance",
        "similarity",
        DistanceMetric::L2,
        RequestOptions::default(),
    );

    let (mut tail, out_lookup) = build_hybrid_pipeline(
        vec![vector_side],
        HybridScoringMode::Linear { weights: vec![1.0] },
        Some("fused"),
        &AggregatePlan::default(),
        &RequestOptions::aggregate(),
        &p,
    )
    .unwrap();

    let (rows, _) = tail.drain();
    assert_eq!(rows.len(), 2);
    assert_eq!(score_of(&rows, near), Some(1.0));
    assert_eq!(score_of(&rows, far), Some(0.25));

    // The fused score also lands in the row under the requested alias.
    let lookup = tail.cx.lookups.get(out_lookup);
    let fused = lookup.find("fused").unwrap();
    let near_row = rows.iter().find(|r| r.doc_id == near).unwrap();
    assert_eq!(
        lookup.get_item(fused, &near_row.row).unwrap().to_number(),
        Some(1.0)
    );
}

#[test]
fn test_tail_plan_sorts_fused_rows() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let ids: Vec<u64> = [0.2, 0.9, 0.5]
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            world
                .store
                .add_record(&world.schema, &format!("doc:{i}"), vec![], s)
        })
        .collect();

    let tail_plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 10,
        sort: Some(SortSpec::descending(vec!["fused".into()])),
    }]);
    let (mut tail, _) = build_hybrid_pipeline(
        vec![doc_scored_search(&ids)],
        HybridScoringMode::Linear { weights: vec![1.0] },
        Some("fused"),
        &tail_plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, _) = tail.drain();
    let ordered: Vec<u64> = rows.iter().map(|r| r.doc_id).collect();
    assert_eq!(ordered, vec![ids[1], ids[2], ids[0]]);
}

#[test]
fn test_duplicate_score_alias_fails() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let id = world
        .store
        .add_record(&world.schema, "doc:1", vec![], 1.0);

    let mut p = world.params();
    p.metrics = vec!["similarity".into()];
    let vector_iter = Box::new(MetricIterator::new("similarity", vec![(id, 0.5)]));
    let vector_side = HybridSubQuery::vector(
        vector_iter,
        "similarity",
        "similarity_norm",
        DistanceMetric::L2,
        RequestOptions::default(),
    );

    // "similarity" already exists as an upstream metric key in the tail.
    let err = build_hybrid_pipeline(
        vec![vector_side],
        HybridScoringMode::Linear { weights: vec![1.0] },
        Some("similarity"),
        &AggregatePlan::default(),
        &RequestOptions::aggregate(),
        &p,
    )
    .unwrap_err();
    assert_eq!(err.code(), quarry::error::ErrorCode::DupField);
}

#[test]
fn test_hybrid_profile_counts_tail_stages() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let id = world
        .store
        .add_record(&world.schema, "doc:1", vec![], 1.0);

    let mut tail_options = RequestOptions::aggregate();
    tail_options.flags |= quarry::plan::RequestFlags::PROFILE;

    let (mut tail, _) = build_hybrid_pipeline(
        vec![doc_scored_search(&[id])],
        HybridScoringMode::rrf(),
        None,
        &AggregatePlan::default(),
        &tail_options,
        &world.params(),
    )
    .unwrap();
    let (rows, _) = tail.drain();
    assert_eq!(rows.len(), 1);

    let report = quarry::pipeline::profile::collect_profile(tail.end_stage());
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].kind, quarry::pipeline::StageKind::HybridMerger);
}
