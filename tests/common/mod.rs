//! Shared builders for integration tests: stores seeded with documents,
//! schemas, and index iterators over canned match lists.

use std::sync::Arc;

use quarry::config::EngineConfig;
use quarry::document::DocumentStore;
use quarry::index::{IndexIterator, IndexResult, IndexStats, VecIterator};
use quarry::pipeline::build::PipelineParams;
use quarry::schema::{FieldSpec, SchemaCache};

/// A store plus everything a pipeline build needs to reference it.
pub struct TestWorld {
    pub store: DocumentStore,
    pub schema: Arc<SchemaCache>,
    pub config: EngineConfig,
}

impl TestWorld {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        init_tracing();
        Self {
            store: DocumentStore::new(),
            schema: Arc::new(SchemaCache::new(fields)),
            config: EngineConfig::default(),
        }
    }

    pub fn params(&self) -> PipelineParams<'_> {
        PipelineParams {
            store: &self.store,
            schema: Some(self.schema.clone()),
            config: &self.config,
            index_stats: IndexStats {
                num_docs: 100,
                num_terms: 1000,
                avg_doc_len: 8.0,
            },
            metrics: Vec::new(),
            shard_range: None,
        }
    }

    /// Add a record document; returns its doc id.
    pub fn add_doc(&self, key: &str, fields: Vec<(&str, &str)>) -> u64 {
        self.store.add_record(
            &self.schema,
            key,
            fields
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            1.0,
        )
    }
}

/// Install a test subscriber once; `RUST_LOG=quarry=debug` shows the
/// pipeline build spans.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// An iterator over term matches for the given doc ids.
pub fn term_matches(ids: &[u64]) -> Box<dyn IndexIterator> {
    let results = ids
        .iter()
        .map(|&id| IndexResult::term(id, "term", 1, ids.len() as u64))
        .collect();
    Box::new(VecIterator::new(results))
}
