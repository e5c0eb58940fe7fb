//! Reply model and encodings
//!
//! A drained pipeline is rendered into a [`Reply`] tree, then encoded for
//! the wire. The text encoding is length-prefixed: strings carry their
//! byte length, numbers print without a fraction when integral, null is a
//! distinguished sentinel. The typed encoding maps onto JSON for callers
//! that negotiate structured replies.

use crate::lookup::{KeyFlags, Lookup};
use crate::pipeline::SearchResult;
use crate::plan::RequestFlags;
use crate::value::{format_number, Value, ValueData};

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Null,
    Number(f64),
    String(Vec<u8>),
    Array(Vec<Reply>),
    Map(Vec<(Reply, Reply)>),
}

impl Reply {
    pub fn string(s: impl Into<String>) -> Reply {
        Reply::String(s.into().into_bytes())
    }

    /// Convert a row value. Duos serialise their display form, or the
    /// expanded form when the caller negotiated expanded replies.
    pub fn from_value(value: &Value, expand: bool) -> Reply {
        let v = value.follow();
        match v.data() {
            ValueData::Null => Reply::Null,
            ValueData::Number(n) => Reply::Number(*n),
            ValueData::String(s) => Reply::String(s.as_str().as_bytes().to_vec()),
            ValueData::Array(items) => {
                Reply::Array(items.iter().map(|i| Reply::from_value(i, expand)).collect())
            }
            ValueData::Map(pairs) => Reply::Map(
                pairs
                    .iter()
                    .map(|(k, val)| (Reply::from_value(k, expand), Reply::from_value(val, expand)))
                    .collect(),
            ),
            ValueData::Duo(duo) => {
                if expand {
                    if let Some(expanded) = &duo.expanded {
                        return Reply::from_value(expanded, expand);
                    }
                }
                Reply::from_value(&duo.display, expand)
            }
            ValueData::Reference(_) => unreachable!("follow() resolves references"),
        }
    }

    /// Length-prefixed text encoding.
    pub fn encode_text(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Null => out.extend_from_slice(b"_\r\n"),
            Reply::Number(n) => {
                out.push(b',');
                out.extend_from_slice(format_number(*n).as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::String(bytes) => {
                out.push(b'$');
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(bytes);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode_text(out);
                }
            }
            Reply::Map(pairs) => {
                out.push(b'%');
                out.extend_from_slice(pairs.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for (k, v) in pairs {
                    k.encode_text(out);
                    v.encode_text(out);
                }
            }
        }
    }

    /// Typed (structured) encoding.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Reply::Null => serde_json::Value::Null,
            Reply::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Reply::String(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            Reply::Array(items) => {
                serde_json::Value::Array(items.iter().map(|i| i.to_json()).collect())
            }
            Reply::Map(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    let key = match k {
                        Reply::String(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                        other => format!("{:?}", other),
                    };
                    map.insert(key, v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Render one result's visible fields as a field/value map.
///
/// Hidden keys are skipped unless explicitly requested in the return
/// list; empty slots do not appear at all.
pub fn render_row(lookup: &Lookup, result: &SearchResult, flags: RequestFlags) -> Reply {
    let expand = flags.contains(RequestFlags::FORMAT_EXPAND);
    let mut pairs = Vec::new();
    for (id, key) in lookup.iter() {
        let visible = !key.is_hidden() || key.flags().contains(KeyFlags::EXPLICIT_RETURN);
        if !visible {
            continue;
        }
        let Some(value) = lookup.get_item(id, &result.row) else {
            continue;
        };
        pairs.push((
            Reply::string(key.name()),
            Reply::from_value(&value, expand),
        ));
    }
    Reply::Map(pairs)
}

/// Render a full result set: total count first, then one entry per row
/// shaped by the request flags. `sort_key` is the primary sort key of the
/// request, emitted per row when sort keys were requested.
pub fn render_results(
    lookup: &Lookup,
    rows: &[SearchResult],
    total: u64,
    flags: RequestFlags,
    sort_key: Option<crate::lookup::KeyId>,
) -> Reply {
    let mut out = Vec::with_capacity(1 + rows.len());
    out.push(Reply::Number(total as f64));
    for row in rows {
        let mut entry = Vec::new();

        if flags.contains(RequestFlags::SEND_RAW_IDS) {
            entry.push((Reply::string("id"), Reply::Number(row.doc_id as f64)));
        } else if let Some(dmd) = &row.dmd {
            entry.push((Reply::string("id"), Reply::string(dmd.key.clone())));
        }

        if flags.contains(RequestFlags::SEND_SCORES) {
            entry.push((Reply::string("score"), Reply::Number(row.score)));
            if flags.contains(RequestFlags::SEND_SCORE_EXPLAIN) {
                if let Some(explain) = &row.score_explain {
                    entry.push((Reply::string("explain"), render_explanation(explain)));
                }
            }
        }

        if flags.contains(RequestFlags::SEND_SORTKEYS) {
            let value = sort_key
                .and_then(|k| lookup.get_item(k, &row.row))
                .map(|v| Reply::from_value(&v, false))
                .unwrap_or(Reply::Null);
            entry.push((Reply::string("sortkey"), value));
        }

        if flags.contains(RequestFlags::SEND_PAYLOADS) {
            let payload = row
                .dmd
                .as_ref()
                .and_then(|d| d.payload.clone())
                .map(Reply::String)
                .unwrap_or(Reply::Null);
            entry.push((Reply::string("payload"), payload));
        }

        if !flags.contains(RequestFlags::SEND_NOFIELDS) {
            entry.push((Reply::string("fields"), render_row(lookup, row, flags)));
        }

        out.push(Reply::Map(entry));
    }
    Reply::Array(out)
}

fn render_explanation(explain: &crate::scorer::Explanation) -> Reply {
    if explain.children.is_empty() {
        return Reply::string(explain.text.clone());
    }
    let mut items = vec![Reply::string(explain.text.clone())];
    items.extend(explain.children.iter().map(render_explanation));
    Reply::Array(items)
}
