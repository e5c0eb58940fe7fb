//! Scoring functions and the extension registry
//!
//! Scorers are looked up by name in a process-wide registry initialised
//! once with the built-in set (TFIDF, BM25 variants, DOCSCORE, DISMAX,
//! HAMMING). Extensions register additional scorers and query expanders
//! before the first request; during request processing the registry is
//! read-only.
//!
//! A scoring function receives the index statistics, one match record, the
//! document metadata and the pipeline's current score floor, and returns a
//! score — or [`FILTER_OUT`] to drop the result entirely.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{ErrorCode, QueryError};
use crate::index::{IndexResult, IndexStats};
use crate::schema::DocMetadata;

/// Sentinel score: discard this result and do not count it.
pub const FILTER_OUT: f64 = f64::NEG_INFINITY;

/// Default scorer used when a request names none.
pub const DEFAULT_SCORER: &str = "BM25STD";

/// BM25 variant squashed through `tanh(score / factor)`.
pub const BM25_TANH_SCORER: &str = "BM25STD.TANH";

/// BM25 variant normalised by the maximum score of the result set. The
/// division happens in a dedicated pipeline stage; the scoring function is
/// plain BM25.
pub const BM25_MAX_NORMALIZED_SCORER: &str = "BM25STD.NORMMAX";

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Explanation tree for a computed score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Explanation {
    pub text: String,
    pub children: Vec<Explanation>,
}

impl Explanation {
    pub fn leaf(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            children: Vec::new(),
        }
    }

    pub fn node(text: impl Into<String>, children: Vec<Explanation>) -> Self {
        Self {
            text: text.into(),
            children,
        }
    }
}

/// Per-query arguments shared by every invocation of a scoring function.
#[derive(Debug, Clone, Default)]
pub struct ScoringArgs {
    pub index_stats: IndexStats,
    /// Opaque query payload, consumed by payload scorers.
    pub query_payload: Option<Vec<u8>>,
    /// Squash factor of the tanh-normalised BM25 variant.
    pub tanh_factor: f64,
    /// Whether to build score explanations.
    pub explain: bool,
}

/// Score plus optional explanation.
pub struct Scored {
    pub score: f64,
    pub explanation: Option<Explanation>,
}

impl Scored {
    pub fn plain(score: f64) -> Self {
        Self {
            score,
            explanation: None,
        }
    }
}

/// A scoring function. `min_score` is the pipeline's current floor; a
/// scorer may use it to shortcut documents that cannot compete.
pub type ScoringFunction =
    Arc<dyn Fn(&ScoringArgs, &IndexResult, &DocMetadata, f64) -> Scored + Send + Sync>;

/// A query expander: one token in, expanded token list out.
pub type QueryExpander = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

struct Registry {
    scorers: HashMap<String, ScoringFunction>,
    expanders: HashMap<String, QueryExpander>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    let mut scorers: HashMap<String, ScoringFunction> = HashMap::new();
    scorers.insert("TFIDF".into(), Arc::new(tfidf));
    scorers.insert(DEFAULT_SCORER.into(), Arc::new(bm25));
    scorers.insert(BM25_TANH_SCORER.into(), Arc::new(bm25_tanh));
    scorers.insert(BM25_MAX_NORMALIZED_SCORER.into(), Arc::new(bm25));
    scorers.insert("DOCSCORE".into(), Arc::new(docscore));
    scorers.insert("DISMAX".into(), Arc::new(dismax));
    scorers.insert("HAMMING".into(), Arc::new(hamming));
    RwLock::new(Registry {
        scorers,
        expanders: HashMap::new(),
    })
});

/// Look up a scorer by name, falling back to the default scorer for
/// unknown names.
pub fn get_scorer(name: &str) -> ScoringFunction {
    let registry = REGISTRY.read();
    registry
        .scorers
        .get(name)
        .or_else(|| {
            tracing::warn!(scorer = name, "unknown scorer, using default");
            registry.scorers.get(DEFAULT_SCORER)
        })
        .cloned()
        .expect("default scorer is always registered")
}

/// Register an extension scorer. Fails if the alias is taken.
pub fn register_scorer(alias: &str, function: ScoringFunction) -> Result<(), QueryError> {
    let mut registry = REGISTRY.write();
    if registry.scorers.contains_key(alias) {
        return Err(QueryError::new(
            ErrorCode::Generic,
            format!("scorer `{alias}` already registered"),
        ));
    }
    registry.scorers.insert(alias.to_owned(), function);
    Ok(())
}

/// Register an extension query expander. Fails if the alias is taken.
pub fn register_expander(alias: &str, expander: QueryExpander) -> Result<(), QueryError> {
    let mut registry = REGISTRY.write();
    if registry.expanders.contains_key(alias) {
        return Err(QueryError::new(
            ErrorCode::Generic,
            format!("expander `{alias}` already registered"),
        ));
    }
    registry.expanders.insert(alias.to_owned(), expander);
    Ok(())
}

pub fn get_expander(name: &str) -> Option<QueryExpander> {
    REGISTRY.read().expanders.get(name).cloned()
}

// ===== built-in scorers =====

fn idf(num_docs: u64, doc_frequency: u64) -> f64 {
    let n = num_docs.max(1) as f64;
    let df = doc_frequency as f64;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

fn tfidf(args: &ScoringArgs, res: &IndexResult, dmd: &DocMetadata, _min: f64) -> Scored {
    let dl = dmd.doc_len.max(1) as f64;
    let mut sum = 0.0;
    let mut children = Vec::new();
    for hit in &res.terms {
        let w = hit.frequency as f64 * idf(args.index_stats.num_docs, hit.doc_frequency);
        sum += w;
        if args.explain {
            children.push(Explanation::leaf(format!(
                "{}: tf {} * idf = {:.4}",
                hit.term, hit.frequency, w
            )));
        }
    }
    let score = sum / dl * dmd.score;
    Scored {
        score,
        explanation: args.explain.then(|| {
            Explanation::node(
                format!("TFIDF {:.4} = sum / doclen {} * docscore {}", score, dl, dmd.score),
                children,
            )
        }),
    }
}

fn bm25_raw(args: &ScoringArgs, res: &IndexResult, dmd: &DocMetadata) -> (f64, Vec<Explanation>) {
    let avg = if args.index_stats.avg_doc_len > 0.0 {
        args.index_stats.avg_doc_len
    } else {
        1.0
    };
    let dl = dmd.doc_len.max(1) as f64;
    let mut sum = 0.0;
    let mut children = Vec::new();
    for hit in &res.terms {
        let f = hit.frequency as f64;
        let norm = f * (BM25_K1 + 1.0) / (f + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg));
        let w = idf(args.index_stats.num_docs, hit.doc_frequency) * norm;
        sum += w;
        if args.explain {
            children.push(Explanation::leaf(format!(
                "{}: idf * tf-norm = {:.4}",
                hit.term, w
            )));
        }
    }
    (sum * dmd.score, children)
}

fn bm25(args: &ScoringArgs, res: &IndexResult, dmd: &DocMetadata, _min: f64) -> Scored {
    let (score, children) = bm25_raw(args, res, dmd);
    Scored {
        score,
        explanation: args
            .explain
            .then(|| Explanation::node(format!("BM25STD {:.4}", score), children)),
    }
}

fn bm25_tanh(args: &ScoringArgs, res: &IndexResult, dmd: &DocMetadata, _min: f64) -> Scored {
    let factor = if args.tanh_factor > 0.0 {
        args.tanh_factor
    } else {
        1.0
    };
    let (raw, children) = bm25_raw(args, res, dmd);
    let score = (raw / factor).tanh();
    Scored {
        score,
        explanation: args.explain.then(|| {
            Explanation::node(
                format!("tanh(BM25STD {:.4} / {})", raw, factor),
                children,
            )
        }),
    }
}

fn docscore(args: &ScoringArgs, _res: &IndexResult, dmd: &DocMetadata, _min: f64) -> Scored {
    Scored {
        score: dmd.score,
        explanation: args
            .explain
            .then(|| Explanation::leaf(format!("document score {}", dmd.score))),
    }
}

/// Disjunction-max: the strongest term dominates, the rest contribute at a
/// fixed tie-break factor.
fn dismax(args: &ScoringArgs, res: &IndexResult, dmd: &DocMetadata, _min: f64) -> Scored {
    const TIE: f64 = 0.5;
    let mut max = 0.0f64;
    let mut sum = 0.0f64;
    for hit in &res.terms {
        let w = hit.frequency as f64;
        max = max.max(w);
        sum += w;
    }
    let score = (max + TIE * (sum - max)) * dmd.score;
    Scored {
        score,
        explanation: args.explain.then(|| {
            Explanation::leaf(format!("DISMAX max {} + {} * rest = {:.4}", max, TIE, score))
        }),
    }
}

/// Payload distance scorer: popcount distance between the query payload and
/// the document payload. Mismatched or missing payloads score zero.
fn hamming(args: &ScoringArgs, _res: &IndexResult, dmd: &DocMetadata, _min: f64) -> Scored {
    let (Some(q), Some(d)) = (args.query_payload.as_deref(), dmd.payload.as_deref()) else {
        return Scored::plain(0.0);
    };
    if q.len() != d.len() {
        return Scored::plain(0.0);
    }
    let dist: u32 = q.iter().zip(d).map(|(a, b)| (a ^ b).count_ones()).sum();
    let score = 1.0 / (dist as f64 + 1.0);
    Scored {
        score,
        explanation: args
            .explain
            .then(|| Explanation::leaf(format!("hamming distance {} -> {:.4}", dist, score))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexResult;

    fn dmd(score: f64, doc_len: u32) -> DocMetadata {
        let mut m = DocMetadata::new(1, "doc:1");
        m.score = score;
        m.doc_len = doc_len;
        m
    }

    fn args(num_docs: u64, avg: f64) -> ScoringArgs {
        ScoringArgs {
            index_stats: IndexStats {
                num_docs,
                num_terms: 100,
                avg_doc_len: avg,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_rarer_terms_score_higher() {
        let a = args(1000, 10.0);
        let meta = dmd(1.0, 10);
        let rare = bm25(&a, &IndexResult::term(1, "rare", 2, 5), &meta, 0.0);
        let common = bm25(&a, &IndexResult::term(1, "common", 2, 900), &meta, 0.0);
        assert!(rare.score > common.score);
    }

    #[test]
    fn test_doc_score_multiplies() {
        let a = args(1000, 10.0);
        let res = IndexResult::term(1, "t", 2, 10);
        let low = bm25(&a, &res, &dmd(0.5, 10), 0.0);
        let high = bm25(&a, &res, &dmd(1.0, 10), 0.0);
        assert!((low.score * 2.0 - high.score).abs() < 1e-9);
    }

    #[test]
    fn test_tanh_bounds() {
        let mut a = args(1000, 10.0);
        a.tanh_factor = 4.0;
        let res = IndexResult::term(1, "t", 100, 1);
        let s = bm25_tanh(&a, &res, &dmd(1.0, 10), 0.0);
        assert!(s.score > 0.0 && s.score <= 1.0);
    }

    #[test]
    fn test_docscore_ignores_match() {
        let s = docscore(&args(10, 1.0), &IndexResult::default(), &dmd(0.7, 1), 0.0);
        assert_eq!(s.score, 0.7);
    }

    #[test]
    fn test_hamming_identical_payloads() {
        let mut a = args(10, 1.0);
        a.query_payload = Some(vec![0xAB, 0xCD]);
        let mut meta = dmd(1.0, 1);
        meta.payload = Some(vec![0xAB, 0xCD]);
        let s = hamming(&a, &IndexResult::default(), &meta, 0.0);
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn test_hamming_length_mismatch_is_zero() {
        let mut a = args(10, 1.0);
        a.query_payload = Some(vec![0xAB]);
        let mut meta = dmd(1.0, 1);
        meta.payload = Some(vec![0xAB, 0xCD]);
        assert_eq!(hamming(&a, &IndexResult::default(), &meta, 0.0).score, 0.0);
    }

    #[test]
    fn test_unknown_scorer_falls_back() {
        // Must not panic; resolves to the default scorer.
        let f = get_scorer("NO-SUCH-SCORER");
        let s = f(
            &args(10, 5.0),
            &IndexResult::term(1, "t", 1, 2),
            &dmd(1.0, 5),
            0.0,
        );
        assert!(s.score.is_finite());
    }

    #[test]
    fn test_register_scorer_conflict() {
        register_scorer("custom-once", Arc::new(docscore)).unwrap();
        assert!(register_scorer("custom-once", Arc::new(docscore)).is_err());
    }

    #[test]
    fn test_explanations_only_when_requested() {
        let mut a = args(100, 5.0);
        let res = IndexResult::term(1, "t", 1, 2);
        let meta = dmd(1.0, 5);
        assert!(bm25(&a, &res, &meta, 0.0).explanation.is_none());
        a.explain = true;
        let explained = bm25(&a, &res, &meta, 0.0).explanation.unwrap();
        assert!(!explained.text.is_empty());
        assert_eq!(explained.children.len(), 1);
    }

    #[test]
    fn test_expander_registry() {
        register_expander(
            "upper-once",
            Arc::new(|tok: &str| vec![tok.to_owned(), tok.to_uppercase()]),
        )
        .unwrap();
        let exp = get_expander("upper-once").unwrap();
        assert_eq!(exp("abc"), vec!["abc".to_owned(), "ABC".to_owned()]);
        assert!(get_expander("missing").is_none());
    }
}
