//! Source iterator contract
//!
//! The inverted-index, numeric-tree and vector-index readers live behind
//! this boundary: a pipeline's source stage sees only an [`IndexIterator`]
//! yielding `(docId, index result, metadata)` records. Implementations in
//! this crate cover the shapes the pipeline itself needs (preloaded result
//! lists, vector metric scans); real readers plug in the same trait.

use std::sync::Arc;

use crate::schema::DocMetadata;
use crate::value::Value;

/// Statistics about the index, consumed by scoring functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    /// Total number of live documents.
    pub num_docs: u64,
    /// Number of distinct terms.
    pub num_terms: u64,
    /// Average document length in tokens.
    pub avg_doc_len: f64,
}

/// One matched term inside an index result.
#[derive(Debug, Clone)]
pub struct TermHit {
    pub term: String,
    /// Occurrences of the term in this document.
    pub frequency: u32,
    /// Number of documents containing the term.
    pub doc_frequency: u64,
}

/// The raw match record an index reader yields for one document.
#[derive(Debug, Clone, Default)]
pub struct IndexResult {
    pub doc_id: u64,
    /// Total match frequency in this document.
    pub frequency: u32,
    /// Per-term hits backing term-aware scorers.
    pub terms: Vec<TermHit>,
    /// Per-match metrics (vector distances and the like) to surface into
    /// the row under their field name.
    pub metrics: Vec<(String, Value)>,
    /// Metadata, when the reader already holds it. The source stage looks
    /// it up by `doc_id` otherwise.
    pub dmd: Option<Arc<DocMetadata>>,
}

impl IndexResult {
    pub fn term(doc_id: u64, term: &str, frequency: u32, doc_frequency: u64) -> Self {
        Self {
            doc_id,
            frequency,
            terms: vec![TermHit {
                term: term.to_owned(),
                frequency,
                doc_frequency,
            }],
            ..Default::default()
        }
    }
}

/// Outcome of one read from an index iterator.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A matching record.
    Hit(IndexResult),
    /// The current candidate did not match; ask again.
    NotFound,
    Eof,
    TimedOut,
}

/// A reader over one index, pulled record by record.
///
/// Implementations must be `Send`: a pipeline may execute on a worker
/// thread, and every stage of it moves together.
pub trait IndexIterator: Send {
    fn read(&mut self) -> ReadOutcome;

    /// Rough upper bound on the number of results, for sizing buffers.
    fn num_estimated(&self) -> usize {
        0
    }
}

/// Iterator over a preloaded list of index results.
pub struct VecIterator {
    results: std::vec::IntoIter<IndexResult>,
    remaining: usize,
}

impl VecIterator {
    pub fn new(results: Vec<IndexResult>) -> Self {
        let remaining = results.len();
        Self {
            results: results.into_iter(),
            remaining,
        }
    }
}

impl IndexIterator for VecIterator {
    fn read(&mut self) -> ReadOutcome {
        match self.results.next() {
            Some(r) => {
                self.remaining -= 1;
                ReadOutcome::Hit(r)
            }
            None => ReadOutcome::Eof,
        }
    }

    fn num_estimated(&self) -> usize {
        self.remaining
    }
}

/// Distance metric of a vector field, deciding how raw distances normalise
/// into similarity scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    L2,
    InnerProduct,
    Cosine,
}

/// Iterator over a precomputed `(docId, distance)` list — the shape a
/// vector KNN scan produces. The distance is exposed as a yieldable metric
/// under `metric_name` so a metrics stage can surface it into rows.
pub struct MetricIterator {
    entries: std::vec::IntoIter<(u64, f64)>,
    remaining: usize,
    metric_name: String,
}

impl MetricIterator {
    pub fn new(metric_name: impl Into<String>, entries: Vec<(u64, f64)>) -> Self {
        let remaining = entries.len();
        Self {
            entries: entries.into_iter(),
            remaining,
            metric_name: metric_name.into(),
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }
}

impl IndexIterator for MetricIterator {
    fn read(&mut self) -> ReadOutcome {
        match self.entries.next() {
            Some((doc_id, distance)) => {
                self.remaining -= 1;
                ReadOutcome::Hit(IndexResult {
                    doc_id,
                    frequency: 1,
                    metrics: vec![(self.metric_name.clone(), Value::number(distance))],
                    ..Default::default()
                })
            }
            None => ReadOutcome::Eof,
        }
    }

    fn num_estimated(&self) -> usize {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_iterator_drains_in_order() {
        let mut it = VecIterator::new(vec![
            IndexResult::term(1, "a", 1, 10),
            IndexResult::term(2, "a", 2, 10),
        ]);
        assert_eq!(it.num_estimated(), 2);
        match it.read() {
            ReadOutcome::Hit(r) => assert_eq!(r.doc_id, 1),
            other => panic!("expected hit, got {:?}", other),
        }
        match it.read() {
            ReadOutcome::Hit(r) => assert_eq!(r.doc_id, 2),
            other => panic!("expected hit, got {:?}", other),
        }
        assert!(matches!(it.read(), ReadOutcome::Eof));
        assert!(matches!(it.read(), ReadOutcome::Eof));
    }

    #[test]
    fn test_metric_iterator_yields_distances() {
        let mut it = MetricIterator::new("__dist", vec![(7, 0.25)]);
        match it.read() {
            ReadOutcome::Hit(r) => {
                assert_eq!(r.doc_id, 7);
                assert_eq!(r.metrics.len(), 1);
                assert_eq!(r.metrics[0].0, "__dist");
                assert_eq!(r.metrics[0].1.to_number(), Some(0.25));
            }
            other => panic!("expected hit, got {:?}", other),
        }
        assert!(matches!(it.read(), ReadOutcome::Eof));
    }
}
