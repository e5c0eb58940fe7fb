//! End-to-end pipeline scenarios: built from a plan, driven to a terminal
//! status, checked row by row.

mod common;

use common::{term_matches, TestWorld};
use quarry::error::ErrorCode;
use quarry::expr::{BinOp, Expr};
use quarry::index::{IndexIterator, IndexResult, ReadOutcome};
use quarry::pipeline::build::build_query_pipeline;
use quarry::pipeline::StageStatus;
use quarry::plan::{
    AggregatePlan, LoadField, PlanStep, ReducerSpec, RequestFlags, RequestOptions, SortSpec,
};
use quarry::reply::{render_results, Reply};
use quarry::schema::FieldSpec;

fn doc_scored_options() -> RequestOptions {
    let mut options = RequestOptions::search();
    options.scorer = Some("DOCSCORE".into());
    options
}

#[test]
fn test_simple_top_k() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let scores = [0.5, 0.9, 0.1, 0.7, 0.3];
    let ids: Vec<u64> = scores
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            world
                .store
                .add_record(&world.schema, &format!("doc:{}", i + 1), vec![], s)
        })
        .collect();

    let plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 3,
        sort: None,
    }]);
    let (mut pipeline, _) = build_query_pipeline(
        Some(term_matches(&ids)),
        &plan,
        &doc_scored_options(),
        &world.params(),
    )
    .unwrap();

    let (rows, status) = pipeline.drain();
    assert_eq!(status, StageStatus::Eof);
    let got: Vec<(u64, f64)> = rows.iter().map(|r| (r.doc_id, r.score)).collect();
    assert_eq!(got, vec![(ids[1], 0.9), (ids[3], 0.7), (ids[0], 0.5)]);
    assert_eq!(pipeline.cx.total_results, 5);
}

#[test]
fn test_filter_then_project() {
    let world = TestWorld::new(vec![FieldSpec::new("n").numeric()]);
    let ids: Vec<u64> = (1..=5)
        .map(|i| world.add_doc(&format!("doc:{i}"), vec![("n", &i.to_string())]))
        .collect();

    let plan = AggregatePlan::new(vec![
        PlanStep::Load {
            fields: vec![LoadField::new("n")],
        },
        PlanStep::Filter {
            expr: Expr::binary(BinOp::Ge, Expr::prop("n"), Expr::num(3.0)),
        },
        PlanStep::Apply {
            expr: Expr::binary(BinOp::Mul, Expr::prop("n"), Expr::num(2.0)),
            alias: "m".into(),
        },
    ]);
    let (mut pipeline, out_lookup) = build_query_pipeline(
        Some(term_matches(&ids)),
        &plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, status) = pipeline.drain();
    assert_eq!(status, StageStatus::Eof);
    let lookup = pipeline.cx.lookups.get(out_lookup);
    let m_key = lookup.find("m").unwrap();
    let ms: Vec<f64> = rows
        .iter()
        .map(|r| lookup.get_item(m_key, &r.row).unwrap().to_number().unwrap())
        .collect();
    assert_eq!(ms, vec![6.0, 8.0, 10.0]);
}

#[test]
fn test_group_then_sort() {
    let world = TestWorld::new(vec![
        FieldSpec::new("category"),
        FieldSpec::new("v").numeric(),
    ]);
    let data = [("A", 1.0), ("B", 2.0), ("A", 3.0), ("B", 4.0), ("A", 5.0)];
    let ids: Vec<u64> = data
        .iter()
        .enumerate()
        .map(|(i, (cat, v))| {
            world.add_doc(
                &format!("doc:{i}"),
                vec![("category", cat), ("v", &v.to_string())],
            )
        })
        .collect();

    let plan = AggregatePlan::new(vec![
        PlanStep::Load {
            fields: vec![LoadField::new("category"), LoadField::new("v")],
        },
        PlanStep::Group {
            properties: vec!["category".into()],
            reducers: vec![ReducerSpec::new("SUM", vec!["@v".into()]).with_alias("s")],
        },
        PlanStep::Arrange {
            offset: 0,
            limit: 10,
            sort: Some(SortSpec::descending(vec!["s".into()])),
        },
    ]);
    let (mut pipeline, out_lookup) = build_query_pipeline(
        Some(term_matches(&ids)),
        &plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, status) = pipeline.drain();
    assert_eq!(status, StageStatus::Eof);
    assert_eq!(rows.len(), 2);

    let lookup = pipeline.cx.lookups.get(out_lookup);
    let cat = lookup.find("category").unwrap();
    let sum = lookup.find("s").unwrap();
    let got: Vec<(String, f64)> = rows
        .iter()
        .map(|r| {
            (
                lookup.get_item(cat, &r.row).unwrap().to_text(),
                lookup.get_item(sum, &r.row).unwrap().to_number().unwrap(),
            )
        })
        .collect();
    assert_eq!(got, vec![("A".to_owned(), 9.0), ("B".to_owned(), 6.0)]);
}

/// Two hits, then the reader reports its own timeout.
struct TwoThenTimeout {
    ids: Vec<u64>,
    emitted: usize,
}

impl IndexIterator for TwoThenTimeout {
    fn read(&mut self) -> ReadOutcome {
        if self.emitted < self.ids.len() {
            let id = self.ids[self.emitted];
            self.emitted += 1;
            ReadOutcome::Hit(IndexResult::term(id, "term", 1, 2))
        } else {
            ReadOutcome::TimedOut
        }
    }
}

#[test]
fn test_timeout_return_policy_emits_partial_results() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let a = world
        .store
        .add_record(&world.schema, "doc:a", vec![], 0.4);
    let b = world
        .store
        .add_record(&world.schema, "doc:b", vec![], 0.8);

    let plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 100,
        sort: None,
    }]);
    let iter = TwoThenTimeout {
        ids: vec![a, b],
        emitted: 0,
    };
    let (mut pipeline, _) = build_query_pipeline(
        Some(Box::new(iter)),
        &plan,
        &doc_scored_options(),
        &world.params(),
    )
    .unwrap();

    let (rows, status) = pipeline.drain();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].score, 0.8);
    assert_eq!(rows[1].score, 0.4);
    assert_eq!(status, StageStatus::TimedOut);
}

#[test]
fn test_timeout_fail_policy_emits_nothing() {
    let mut world = TestWorld::new(vec![FieldSpec::new("body")]);
    world.config.timeout_policy = quarry::config::TimeoutPolicy::Fail;
    let a = world
        .store
        .add_record(&world.schema, "doc:a", vec![], 0.4);

    let plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 100,
        sort: None,
    }]);
    let iter = TwoThenTimeout {
        ids: vec![a],
        emitted: 0,
    };
    let (mut pipeline, _) = build_query_pipeline(
        Some(Box::new(iter)),
        &plan,
        &doc_scored_options(),
        &world.params(),
    )
    .unwrap();

    let (rows, status) = pipeline.drain();
    assert!(rows.is_empty());
    assert_eq!(status, StageStatus::TimedOut);
}

#[test]
fn test_sort_by_schema_field_with_implicit_load() {
    let world = TestWorld::new(vec![FieldSpec::new("price").numeric()]);
    let prices = [30, 10, 20];
    let ids: Vec<u64> = prices
        .iter()
        .enumerate()
        .map(|(i, p)| world.add_doc(&format!("doc:{i}"), vec![("price", &p.to_string())]))
        .collect();

    let plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 10,
        sort: Some(SortSpec::ascending(vec!["price".into()])),
    }]);
    let (mut pipeline, out_lookup) = build_query_pipeline(
        Some(term_matches(&ids)),
        &plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, _) = pipeline.drain();
    let lookup = pipeline.cx.lookups.get(out_lookup);
    let price = lookup.find("price").unwrap();
    let got: Vec<f64> = rows
        .iter()
        .map(|r| {
            lookup
                .get_item(price, &r.row)
                .unwrap()
                .to_number()
                .unwrap()
        })
        .collect();
    assert_eq!(got, vec![10.0, 20.0, 30.0]);
}

#[test]
fn test_rows_missing_sort_key_order_last() {
    let world = TestWorld::new(vec![FieldSpec::new("price").numeric()]);
    let with_price = world.add_doc("doc:a", vec![("price", "10")]);
    let without = world.add_doc("doc:b", vec![]);

    let plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 10,
        sort: Some(SortSpec::ascending(vec!["price".into()])),
    }]);
    let (mut pipeline, _) = build_query_pipeline(
        Some(term_matches(&[without, with_price])),
        &plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, _) = pipeline.drain();
    let ids: Vec<u64> = rows.iter().map(|r| r.doc_id).collect();
    // The row with a price sorts before the one without, even ascending.
    assert_eq!(ids, vec![with_price, without]);
}

#[test]
fn test_counter_only_request() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let ids: Vec<u64> = (0..7)
        .map(|i| world.add_doc(&format!("doc:{i}"), vec![]))
        .collect();

    let mut options = RequestOptions::search();
    options.flags |= RequestFlags::NO_ROWS;
    let plan = AggregatePlan::new(vec![PlanStep::Arrange {
        offset: 0,
        limit: 0,
        sort: None,
    }]);
    let (mut pipeline, _) = build_query_pipeline(
        Some(term_matches(&ids)),
        &plan,
        &options,
        &world.params(),
    )
    .unwrap();

    let (rows, status) = pipeline.drain();
    assert!(rows.is_empty());
    assert_eq!(status, StageStatus::Eof);
    assert_eq!(pipeline.cx.total_results, 7);
}

#[test]
fn test_deleted_documents_never_surface() {
    let world = TestWorld::new(vec![FieldSpec::new("body")]);
    let ids: Vec<u64> = (0..3)
        .map(|i| world.add_doc(&format!("doc:{i}"), vec![]))
        .collect();
    world.store.delete("doc:1");

    let (mut pipeline, _) = build_query_pipeline(
        Some(term_matches(&ids)),
        &AggregatePlan::default(),
        &doc_scored_options(),
        &world.params(),
    )
    .unwrap();
    let (rows, _) = pipeline.drain();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.doc_id != ids[1]));
}

#[test]
fn test_render_search_reply() -> anyhow::Result<()> {
    let world = TestWorld::new(vec![FieldSpec::new("title")]);
    let id = world.add_doc("doc:1", vec![("title", "hello world")]);

    let mut options = doc_scored_options();
    options.flags |= RequestFlags::SEND_SCORES;
    options.return_fields = vec![LoadField::new("title")];

    let (mut pipeline, out_lookup) = build_query_pipeline(
        Some(term_matches(&[id])),
        &AggregatePlan::default(),
        &options,
        &world.params(),
    )
    .unwrap();

    let (rows, _) = pipeline.drain();
    let total = pipeline.cx.total_results;
    let reply = render_results(
        pipeline.cx.lookups.get(out_lookup),
        &rows,
        total,
        options.flags,
        None,
    );

    let Reply::Array(items) = reply else {
        panic!("expected array reply")
    };
    assert_eq!(items[0], Reply::Number(1.0));
    let Reply::Map(entry) = &items[1] else {
        panic!("expected map entry")
    };
    assert!(entry
        .iter()
        .any(|(k, v)| *k == Reply::string("id") && *v == Reply::string("doc:1")));
    assert!(entry.iter().any(|(k, _)| *k == Reply::string("score")));
    Ok(())
}

#[test]
fn test_unknown_group_property_fails_before_running() {
    let world = TestWorld::new(vec![FieldSpec::new("known")]);
    let plan = AggregatePlan::new(vec![PlanStep::Group {
        properties: vec!["unknown".into()],
        reducers: vec![ReducerSpec::new("COUNT", vec![])],
    }]);
    let err = build_query_pipeline(
        None,
        &plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoPropKey);
}

#[test]
fn test_value_refcounts_drain_after_teardown() {
    let world = TestWorld::new(vec![FieldSpec::new("n").numeric()]);
    let id = world.add_doc("doc:1", vec![("n", "5")]);

    let shared = quarry::Value::string("probe");
    let baseline = shared.ref_count();

    let plan = AggregatePlan::new(vec![
        PlanStep::Load {
            fields: vec![LoadField::new("n")],
        },
        PlanStep::Apply {
            expr: Expr::Literal(shared.clone()),
            alias: "p".into(),
        },
    ]);
    let (mut pipeline, _) = build_query_pipeline(
        Some(term_matches(&[id])),
        &plan,
        &RequestOptions::aggregate(),
        &world.params(),
    )
    .unwrap();

    let (rows, _) = pipeline.drain();
    assert!(shared.ref_count() > baseline + 1);
    drop(rows);
    drop(pipeline);
    drop(plan);
    // Every holder (plan literal, bound expression, row slots) released
    // its reference; only the local remains.
    assert_eq!(shared.ref_count(), baseline);
}
