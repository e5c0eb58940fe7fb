//! Grouper stage and reducers
//!
//! Buckets upstream rows by a composite key (the canonical encoding of the
//! grouping dimensions) and feeds each bucket's reducers. After upstream
//! EOF one row per bucket is emitted into a fresh output schema: the
//! dimensions plus one slot per reducer.
//!
//! Reducers form a closed set; unknown names fail pipeline construction.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::config::TimeoutPolicy;
use crate::error::{ErrorCode, QueryError};
use crate::lookup::{KeyFlags, KeyId, Lookup, Row};
use crate::plan::ReducerSpec;
use crate::value::Value;

use super::{Behavior, LookupId, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

/// Per-group accumulator. One instance per reducer per bucket.
pub trait Reducer: Send {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError>;
    fn finalize(self: Box<Self>) -> Result<Value, QueryError>;
}

/// Builds a fresh accumulator per bucket.
pub type ReducerFactory = Box<dyn Fn() -> Box<dyn Reducer> + Send>;

struct Group {
    dims: Vec<Value>,
    reducers: Vec<Box<dyn Reducer>>,
}

pub struct GrouperStage {
    upstream: Box<dyn Stage>,
    src_lookup: LookupId,
    dst_lookup: LookupId,
    src_keys: Vec<KeyId>,
    dst_keys: Vec<KeyId>,
    reducer_keys: Vec<KeyId>,
    factories: Vec<ReducerFactory>,
    groups: Vec<Group>,
    index: HashMap<Vec<u8>, usize>,
    yield_idx: usize,
    yielding: bool,
    exhaust: StageStatus,
}

impl GrouperStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Box<dyn Stage>,
        src_lookup: LookupId,
        dst_lookup: LookupId,
        src_keys: Vec<KeyId>,
        dst_keys: Vec<KeyId>,
        reducer_keys: Vec<KeyId>,
        factories: Vec<ReducerFactory>,
    ) -> Self {
        debug_assert_eq!(src_keys.len(), dst_keys.len());
        debug_assert_eq!(reducer_keys.len(), factories.len());
        Self {
            upstream,
            src_lookup,
            dst_lookup,
            src_keys,
            dst_keys,
            reducer_keys,
            factories,
            groups: Vec::new(),
            index: HashMap::new(),
            yield_idx: 0,
            yielding: false,
            exhaust: StageStatus::Eof,
        }
    }

    fn accumulate(&mut self, cx: &mut PipelineCtx) -> Option<StageStatus> {
        let mut item = SearchResult::new();
        loop {
            item.clear();
            match self.upstream.next(cx, &mut item) {
                StageStatus::Ok => {}
                StageStatus::Eof => {
                    self.yielding = true;
                    return None;
                }
                StageStatus::TimedOut if cx.timeout_policy == TimeoutPolicy::Return => {
                    self.yielding = true;
                    self.exhaust = StageStatus::TimedOut;
                    return None;
                }
                other => return Some(other),
            }

            let add_error = {
                let lookup = cx.lookups.get(self.src_lookup);
                let dims: Vec<Value> = self
                    .src_keys
                    .iter()
                    .map(|&k| lookup.get_item(k, &item.row).unwrap_or_else(Value::null))
                    .collect();

                let mut encoded = Vec::with_capacity(dims.len() * 12);
                for d in &dims {
                    d.canonical_encode(&mut encoded);
                }

                let group_idx = match self.index.get(&encoded) {
                    Some(&idx) => idx,
                    None => {
                        let reducers: Vec<Box<dyn Reducer>> =
                            self.factories.iter().map(|f| f()).collect();
                        self.groups.push(Group { dims, reducers });
                        self.index.insert(encoded, self.groups.len() - 1);
                        self.groups.len() - 1
                    }
                };

                let mut err = None;
                for reducer in &mut self.groups[group_idx].reducers {
                    if let Err(e) = reducer.add(lookup, &item.row) {
                        err = Some(e);
                        break;
                    }
                }
                err
            };
            if let Some(err) = add_error {
                return Some(cx.fail(err));
            }
        }
    }
}

impl Stage for GrouperStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        if !self.yielding {
            if let Some(status) = self.accumulate(cx) {
                return status;
            }
        }

        if self.yield_idx >= self.groups.len() {
            return self.exhaust;
        }
        let group = &mut self.groups[self.yield_idx];
        self.yield_idx += 1;
        let dims = std::mem::take(&mut group.dims);
        let reducers = std::mem::take(&mut group.reducers);

        res.clear();
        res.doc_id = 0;
        let finalize_error = {
            let lookup = cx.lookups.get(self.dst_lookup);
            for (dim, &key) in dims.into_iter().zip(&self.dst_keys) {
                lookup.write_key(key, &mut res.row, dim);
            }
            let mut err = None;
            for (reducer, &key) in reducers.into_iter().zip(&self.reducer_keys) {
                match reducer.finalize() {
                    Ok(value) => lookup.write_key(key, &mut res.row, value),
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
            }
            err
        };
        if let Some(err) = finalize_error {
            return cx.fail(err);
        }
        StageStatus::Ok
    }

    fn kind(&self) -> StageKind {
        StageKind::Grouper
    }

    fn behavior(&self) -> Behavior {
        Behavior::ACCUMULATOR
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ===== reducer construction =====

/// Resolve one reducer spec against the source lookup into a factory.
///
/// Property arguments (leading `@`) must already be resolvable; the
/// builder arranges implicit loads beforehand.
pub fn build_reducer_factory(
    spec: &ReducerSpec,
    lookup: &mut Lookup,
) -> Result<ReducerFactory, QueryError> {
    let name = spec.name.to_uppercase();
    let prop = |lookup: &mut Lookup, idx: usize| -> Result<KeyId, QueryError> {
        let arg = spec.args.get(idx).ok_or_else(|| {
            QueryError::new(
                ErrorCode::ParseArgs,
                format!("reducer {} misses property argument {}", spec.name, idx),
            )
        })?;
        let prop_name = arg.trim_start_matches('@');
        lookup
            .get_key_read(prop_name, KeyFlags::empty())
            .ok_or_else(|| QueryError::unknown_property(prop_name))
    };

    match name.as_str() {
        "COUNT" => Ok(Box::new(|| Box::new(CountReducer::default()))),
        "SUM" | "MIN" | "MAX" | "AVG" | "STDDEV" | "COUNT_DISTINCT" | "COUNT_DISTINCTISH"
        | "TOLIST" => {
            let key = prop(lookup, 0)?;
            Ok(match name.as_str() {
                "SUM" => Box::new(move || Box::new(SumReducer::new(key, SumKind::Sum))),
                "AVG" => Box::new(move || Box::new(SumReducer::new(key, SumKind::Avg))),
                "MIN" => Box::new(move || Box::new(ExtremumReducer::new(key, true))),
                "MAX" => Box::new(move || Box::new(ExtremumReducer::new(key, false))),
                "STDDEV" => Box::new(move || Box::new(StdDevReducer::new(key))),
                "COUNT_DISTINCT" => Box::new(move || Box::new(CountDistinctReducer::new(key))),
                "COUNT_DISTINCTISH" => {
                    Box::new(move || Box::new(CountDistinctishReducer::new(key)))
                }
                _ => Box::new(move || Box::new(ToListReducer::new(key))),
            })
        }
        "QUANTILE" => {
            let key = prop(lookup, 0)?;
            let q: f64 = spec
                .args
                .get(1)
                .and_then(|a| a.parse().ok())
                .ok_or_else(|| {
                    QueryError::new(ErrorCode::BadValue, "QUANTILE requires a number in [0, 1]")
                })?;
            if !(0.0..=1.0).contains(&q) {
                return Err(QueryError::new(
                    ErrorCode::BadValue,
                    "QUANTILE requires a number in [0, 1]",
                ));
            }
            Ok(Box::new(move || Box::new(QuantileReducer::new(key, q))))
        }
        "TOHASH" => {
            let key_key = prop(lookup, 0)?;
            let val_key = prop(lookup, 1)?;
            Ok(Box::new(move || {
                Box::new(ToHashReducer::new(key_key, val_key))
            }))
        }
        "FIRST_VALUE" => {
            let value_key = prop(lookup, 0)?;
            // Optional: BY @other [ASC|DESC]
            let mut by_key = None;
            let mut ascending = true;
            if let Some(by) = spec.args.get(1) {
                if !by.eq_ignore_ascii_case("BY") {
                    return Err(QueryError::new(
                        ErrorCode::ParseArgs,
                        "FIRST_VALUE expects BY before its sort property",
                    ));
                }
                by_key = Some(prop(lookup, 2)?);
                if let Some(dir) = spec.args.get(3) {
                    ascending = match dir.to_uppercase().as_str() {
                        "ASC" => true,
                        "DESC" => false,
                        other => {
                            return Err(QueryError::new(
                                ErrorCode::ParseArgs,
                                format!("FIRST_VALUE direction must be ASC or DESC, got {other}"),
                            ))
                        }
                    };
                }
            }
            Ok(Box::new(move || {
                Box::new(FirstValueReducer::new(value_key, by_key, ascending))
            }))
        }
        "RANDOM_SAMPLE" => {
            let key = prop(lookup, 0)?;
            let n: usize = spec
                .args
                .get(1)
                .and_then(|a| a.parse().ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    QueryError::new(
                        ErrorCode::BadValue,
                        "RANDOM_SAMPLE requires a positive sample size",
                    )
                })?;
            Ok(Box::new(move || Box::new(RandomSampleReducer::new(key, n))))
        }
        other => Err(QueryError::new(
            ErrorCode::NoReducer,
            format!("No such reducer: {other}"),
        )),
    }
}

/// Property names referenced by a reducer spec, for implicit loading.
pub fn reducer_source_properties(spec: &ReducerSpec) -> Vec<String> {
    spec.args
        .iter()
        .filter(|a| a.starts_with('@'))
        .map(|a| a.trim_start_matches('@').to_owned())
        .collect()
}

// ===== reducer implementations =====

#[derive(Default)]
struct CountReducer {
    n: u64,
}

impl Reducer for CountReducer {
    fn add(&mut self, _lookup: &Lookup, _row: &Row) -> Result<(), QueryError> {
        self.n += 1;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(Value::number(self.n as f64))
    }
}

fn numeric_item(lookup: &Lookup, key: KeyId, row: &Row) -> Result<Option<f64>, QueryError> {
    let Some(v) = lookup.get_item(key, row) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    match v.to_number() {
        Some(n) => Ok(Some(n)),
        None => Err(QueryError::new(
            ErrorCode::NotNumeric,
            format!("Could not convert `{}` to number", v.to_text()),
        )),
    }
}

enum SumKind {
    Sum,
    Avg,
}

struct SumReducer {
    key: KeyId,
    kind: SumKind,
    sum: f64,
    n: u64,
}

impl SumReducer {
    fn new(key: KeyId, kind: SumKind) -> Self {
        Self {
            key,
            kind,
            sum: 0.0,
            n: 0,
        }
    }
}

impl Reducer for SumReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        if let Some(n) = numeric_item(lookup, self.key, row)? {
            self.sum += n;
            self.n += 1;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(match self.kind {
            SumKind::Sum => Value::number(self.sum),
            SumKind::Avg => {
                if self.n == 0 {
                    Value::null()
                } else {
                    Value::number(self.sum / self.n as f64)
                }
            }
        })
    }
}

struct ExtremumReducer {
    key: KeyId,
    min: bool,
    best: Option<Value>,
}

impl ExtremumReducer {
    fn new(key: KeyId, min: bool) -> Self {
        Self {
            key,
            min,
            best: None,
        }
    }
}

impl Reducer for ExtremumReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        let Some(v) = lookup.get_item(self.key, row) else {
            return Ok(());
        };
        if v.is_null() {
            return Ok(());
        }
        let better = match &self.best {
            None => true,
            Some(b) => {
                let ord = v.total_compare(b);
                if self.min {
                    ord.is_lt()
                } else {
                    ord.is_gt()
                }
            }
        };
        if better {
            self.best = Some(v);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(self.best.unwrap_or_else(Value::null))
    }
}

/// Welford's running variance.
struct StdDevReducer {
    key: KeyId,
    n: u64,
    mean: f64,
    m2: f64,
}

impl StdDevReducer {
    fn new(key: KeyId) -> Self {
        Self {
            key,
            n: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl Reducer for StdDevReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        if let Some(x) = numeric_item(lookup, self.key, row)? {
            self.n += 1;
            let delta = x - self.mean;
            self.mean += delta / self.n as f64;
            self.m2 += delta * (x - self.mean);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        let stddev = if self.n < 2 {
            0.0
        } else {
            (self.m2 / (self.n - 1) as f64).sqrt()
        };
        Ok(Value::number(stddev))
    }
}

struct CountDistinctReducer {
    key: KeyId,
    seen: HashSet<Vec<u8>>,
}

impl CountDistinctReducer {
    fn new(key: KeyId) -> Self {
        Self {
            key,
            seen: HashSet::new(),
        }
    }
}

impl Reducer for CountDistinctReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        if let Some(v) = lookup.get_item(self.key, row) {
            let mut buf = Vec::with_capacity(12);
            v.canonical_encode(&mut buf);
            self.seen.insert(buf);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(Value::number(self.seen.len() as f64))
    }
}

/// Approximate distinct count: a small HyperLogLog over the canonical
/// value hash. 2^10 registers give ~3% standard error.
struct CountDistinctishReducer {
    key: KeyId,
    registers: Vec<u8>,
}

const HLL_BITS: u32 = 10;
const HLL_REGISTERS: usize = 1 << HLL_BITS;

impl CountDistinctishReducer {
    fn new(key: KeyId) -> Self {
        Self {
            key,
            registers: vec![0; HLL_REGISTERS],
        }
    }

    fn estimate(&self) -> f64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;
        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros > 0 {
                return m * (m / zeros as f64).ln();
            }
        }
        raw
    }
}

impl Reducer for CountDistinctishReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        let Some(v) = lookup.get_item(self.key, row) else {
            return Ok(());
        };
        let mut buf = Vec::with_capacity(12);
        v.canonical_encode(&mut buf);
        let mut hasher = DefaultHasher::new();
        hasher.write(&buf);
        let hash = hasher.finish();

        let register = (hash >> (64 - HLL_BITS)) as usize;
        let rest = hash << HLL_BITS;
        let rank = (rest.leading_zeros() + 1).min(64 - HLL_BITS) as u8;
        if rank > self.registers[register] {
            self.registers[register] = rank;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(Value::number(self.estimate().round()))
    }
}

struct QuantileReducer {
    key: KeyId,
    q: f64,
    samples: Vec<f64>,
}

impl QuantileReducer {
    fn new(key: KeyId, q: f64) -> Self {
        Self {
            key,
            q,
            samples: Vec::new(),
        }
    }
}

impl Reducer for QuantileReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        if let Some(x) = numeric_item(lookup, self.key, row)? {
            self.samples.push(x);
        }
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<Value, QueryError> {
        if self.samples.is_empty() {
            return Ok(Value::null());
        }
        self.samples.sort_by(f64::total_cmp);
        let pos = self.q * (self.samples.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let value = if lo == hi {
            self.samples[lo]
        } else {
            let frac = pos - lo as f64;
            self.samples[lo] * (1.0 - frac) + self.samples[hi] * frac
        };
        Ok(Value::number(value))
    }
}

/// Distinct values, first-seen order.
struct ToListReducer {
    key: KeyId,
    seen: HashSet<Vec<u8>>,
    items: Vec<Value>,
}

impl ToListReducer {
    fn new(key: KeyId) -> Self {
        Self {
            key,
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }
}

impl Reducer for ToListReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        let Some(v) = lookup.get_item(self.key, row) else {
            return Ok(());
        };
        let mut buf = Vec::with_capacity(12);
        v.canonical_encode(&mut buf);
        if self.seen.insert(buf) {
            self.items.push(v);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(Value::array(self.items))
    }
}

/// `(key, value)` pairs collected into a map; first write per key wins.
struct ToHashReducer {
    key_key: KeyId,
    val_key: KeyId,
    seen: HashSet<Vec<u8>>,
    pairs: Vec<(Value, Value)>,
}

impl ToHashReducer {
    fn new(key_key: KeyId, val_key: KeyId) -> Self {
        Self {
            key_key,
            val_key,
            seen: HashSet::new(),
            pairs: Vec::new(),
        }
    }
}

impl Reducer for ToHashReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        let Some(k) = lookup.get_item(self.key_key, row) else {
            return Ok(());
        };
        let v = lookup
            .get_item(self.val_key, row)
            .unwrap_or_else(Value::null);
        let mut buf = Vec::with_capacity(12);
        k.canonical_encode(&mut buf);
        if self.seen.insert(buf) {
            self.pairs.push((k, v));
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(Value::map(self.pairs))
    }
}

struct FirstValueReducer {
    value_key: KeyId,
    by_key: Option<KeyId>,
    ascending: bool,
    best_sort: Option<Value>,
    best: Option<Value>,
}

impl FirstValueReducer {
    fn new(value_key: KeyId, by_key: Option<KeyId>, ascending: bool) -> Self {
        Self {
            value_key,
            by_key,
            ascending,
            best_sort: None,
            best: None,
        }
    }
}

impl Reducer for FirstValueReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        let value = lookup
            .get_item(self.value_key, row)
            .unwrap_or_else(Value::null);
        let Some(by_key) = self.by_key else {
            // No ordering: keep the first row's value.
            if self.best.is_none() {
                self.best = Some(value);
            }
            return Ok(());
        };
        let sort_value = lookup.get_item(by_key, row).unwrap_or_else(Value::null);
        let better = match &self.best_sort {
            None => true,
            Some(current) => {
                let ord = sort_value.total_compare(current);
                if self.ascending {
                    ord.is_lt()
                } else {
                    ord.is_gt()
                }
            }
        };
        if better {
            self.best_sort = Some(sort_value);
            self.best = Some(value);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(self.best.unwrap_or_else(Value::null))
    }
}

/// Uniform reservoir sample of up to `n` values.
struct RandomSampleReducer {
    key: KeyId,
    n: usize,
    seen: u64,
    reservoir: Vec<Value>,
    rng: StdRng,
}

impl RandomSampleReducer {
    fn new(key: KeyId, n: usize) -> Self {
        Self {
            key,
            n,
            seen: 0,
            reservoir: Vec::with_capacity(n),
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }
}

impl Reducer for RandomSampleReducer {
    fn add(&mut self, lookup: &Lookup, row: &Row) -> Result<(), QueryError> {
        let Some(v) = lookup.get_item(self.key, row) else {
            return Ok(());
        };
        if self.reservoir.len() < self.n {
            self.reservoir.push(v);
        } else {
            let j = self.rng.random_range(0..=self.seen) as usize;
            if j < self.n {
                self.reservoir[j] = v;
            }
        }
        self.seen += 1;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Value, QueryError> {
        Ok(Value::array(self.reservoir))
    }
}
