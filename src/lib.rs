//! # quarry — hybrid search query execution
//!
//! The query execution core of a full-text and vector search engine
//! embedded in an in-memory key-value store. Given a parsed query (as a
//! source iterator over index matches) and an aggregation plan, quarry
//! builds a pull-based chain of result processors that scores, loads,
//! transforms, groups, sorts and pages rows — honouring request limits,
//! cooperative timeouts, and the store's locking discipline. Hybrid
//! requests fan out into per-sub-query chains whose ranked streams are
//! fused by reciprocal-rank or weighted-linear scoring.
//!
//! ## Quick start
//!
//! ```
//! use quarry::config::EngineConfig;
//! use quarry::document::DocumentStore;
//! use quarry::index::{IndexResult, IndexStats, VecIterator};
//! use quarry::pipeline::build::{build_query_pipeline, PipelineParams};
//! use quarry::plan::{AggregatePlan, RequestOptions};
//! use quarry::schema::{FieldSpec, SchemaCache};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), quarry::error::QueryError> {
//! let store = DocumentStore::new();
//! let schema = Arc::new(SchemaCache::new(vec![FieldSpec::new("title")]));
//! let doc = store.add_record(
//!     &schema,
//!     "doc:1",
//!     vec![("title".into(), "hello world".into())],
//!     1.0,
//! );
//!
//! let params = PipelineParams {
//!     store: &store,
//!     schema: Some(schema),
//!     config: &EngineConfig::default(),
//!     index_stats: IndexStats { num_docs: 1, num_terms: 2, avg_doc_len: 2.0 },
//!     metrics: Vec::new(),
//!     shard_range: None,
//! };
//! let matches = vec![IndexResult::term(doc, "hello", 1, 1)];
//! let (mut pipeline, _lookup) = build_query_pipeline(
//!     Some(Box::new(VecIterator::new(matches))),
//!     &AggregatePlan::default(),
//!     &RequestOptions::search(),
//!     &params,
//! )?;
//!
//! let (rows, _status) = pipeline.drain();
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod expr;
pub mod hybrid;
pub mod index;
pub mod lookup;
pub mod pipeline;
pub mod plan;
pub mod reply;
pub mod schema;
pub mod scorer;
pub mod util;
pub mod value;

pub use config::{EngineConfig, TimeoutPolicy};
pub use document::DocumentStore;
pub use error::{ErrorCode, QueryError};
pub use hybrid::{build_hybrid_pipeline, HybridScoringMode, HybridSubQuery};
pub use index::{DistanceMetric, IndexIterator, IndexResult, IndexStats, MetricIterator, VecIterator};
pub use lookup::{KeyFlags, Lookup, Row};
pub use pipeline::build::{build_query_pipeline, PipelineParams};
pub use pipeline::{Pipeline, SearchResult, Stage, StageStatus};
pub use plan::{AggregatePlan, PlanStep, ReducerSpec, RequestFlags, RequestOptions, SortSpec};
pub use reply::{render_results, Reply};
pub use schema::{DocMetadata, FieldSpec, SchemaCache};
pub use value::Value;
