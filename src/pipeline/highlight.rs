//! Highlighter stage
//!
//! Wraps query-term occurrences in open/close tags over the requested
//! fields' string values. Matching is case-insensitive and byte-oriented;
//! overlapping term hits are merged left-to-right.

use std::any::Any;

use crate::lookup::KeyId;
use crate::value::Value;

use super::{LookupId, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

pub struct HighlightStage {
    upstream: Box<dyn Stage>,
    lookup: LookupId,
    keys: Vec<KeyId>,
    /// Lower-cased query terms.
    terms: Vec<String>,
    open_tag: String,
    close_tag: String,
}

impl HighlightStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        lookup: LookupId,
        keys: Vec<KeyId>,
        terms: Vec<String>,
        open_tag: impl Into<String>,
        close_tag: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            lookup,
            keys,
            terms: terms.into_iter().map(|t| t.to_lowercase()).collect(),
            open_tag: open_tag.into(),
            close_tag: close_tag.into(),
        }
    }
}

impl Stage for HighlightStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let rc = self.upstream.next(cx, res);
        if rc != StageStatus::Ok {
            return rc;
        }
        let lookup = cx.lookups.get(self.lookup);
        for &key_id in &self.keys {
            let Some(value) = lookup.get_item(key_id, &res.row) else {
                continue;
            };
            let Some(text) = value.as_str() else {
                continue;
            };
            if let Some(highlighted) =
                highlight(text, &self.terms, &self.open_tag, &self.close_tag)
            {
                let dst = lookup.key(key_id).dst_idx();
                res.row.set(dst, Value::string(highlighted));
            }
        }
        StageStatus::Ok
    }

    fn kind(&self) -> StageKind {
        StageKind::Highlighter
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tag every term occurrence in `text`. Returns `None` when nothing
/// matched.
fn highlight(text: &str, terms: &[String], open: &str, close: &str) -> Option<String> {
    let haystack = text.to_lowercase();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for term in terms {
        if term.is_empty() {
            continue;
        }
        let mut from = 0;
        while let Some(pos) = haystack[from..].find(term.as_str()) {
            let start = from + pos;
            ranges.push((start, start + term.len()));
            from = start + term.len();
        }
    }
    if ranges.is_empty() {
        return None;
    }
    ranges.sort_unstable();
    let mut out = String::with_capacity(text.len() + ranges.len() * (open.len() + close.len()));
    let mut cursor = 0;
    for (start, end) in ranges {
        if start < cursor {
            continue; // swallowed by the previous (overlapping) range
        }
        // Lowercasing can shift byte offsets for non-ASCII text; fall back
        // to the untagged original rather than split a character.
        if !text.is_char_boundary(start) || !text.is_char_boundary(end) || end > text.len() {
            return None;
        }
        out.push_str(&text[cursor..start]);
        out.push_str(open);
        out.push_str(&text[start..end]);
        out.push_str(close);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Some(out)
}
