//! Pipeline construction
//!
//! Translates a request (source iterator, flags, aggregation plan) into a
//! stage chain: source → metrics → scorer, then one stage group per plan
//! step, then the search output part (explicit returns, highlighting).
//! Loaders that touch the live store are preceded by a buffer-and-lock
//! stage and balanced by a trailing unlocker when the request asks for
//! store-safe access.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::document::DocumentStore;
use crate::error::{ErrorCode, QueryError};
use crate::expr::BoundExpr;
use crate::index::{IndexIterator, IndexStats};
use crate::lookup::{KeyFlags, KeyId, Lookup, LookupOptions};
use crate::plan::{AggregatePlan, LoadField, PlanStep, ReducerSpec, RequestFlags, RequestOptions, SortSpec};
use crate::schema::SchemaCache;
use crate::scorer::{self, ScoringArgs};
use crate::util::timeout::TimeoutChecker;

use super::buffer::{BufferLockStage, LockHandle, UnlockerStage};
use super::group::{build_reducer_factory, reducer_source_properties, GrouperStage};
use super::highlight::HighlightStage;
use super::loader::{LoadMode, LoaderStage};
use super::score::{MetricsStage, ScorerStage};
use super::sort::{CounterStage, MaxScoreNormalizerStage, PagerStage, SorterStage, SortFieldKey};
use super::source::SourceStage;
use super::transform::{FilterStage, ProjectorStage, VectorNormalizerStage};
use super::{LookupId, Pipeline, PipelineCtx};

/// Default result window of a search request without an explicit limit.
const DEFAULT_LIMIT: usize = 10;

/// Default squash factor of the tanh-normalised BM25 variant.
const DEFAULT_TANH_FACTOR: f64 = 4.0;

/// Field name scores are written under when no alias is given.
pub const SCORE_FIELD: &str = "_score";

/// Environment a pipeline is built against.
pub struct PipelineParams<'a> {
    pub store: &'a DocumentStore,
    pub schema: Option<Arc<SchemaCache>>,
    pub config: &'a EngineConfig,
    pub index_stats: IndexStats,
    /// Metric names the source iterator yields per match (vector
    /// distances and similar); each becomes a row field.
    pub metrics: Vec<String>,
    /// Slot range owned by this shard, for cluster deployments.
    pub shard_range: Option<(u16, u16)>,
}

struct Builder<'a> {
    options: &'a RequestOptions,
    params: &'a PipelineParams<'a>,
    version_at_start: u64,
    lock: Option<LockHandle>,
    sorter_pushed: bool,
}

/// Build a complete pipeline for one request. Returns the pipeline and the
/// lookup its terminal rows are written against.
pub fn build_query_pipeline(
    iter: Option<Box<dyn IndexIterator>>,
    plan: &AggregatePlan,
    options: &RequestOptions,
    params: &PipelineParams,
) -> Result<(Pipeline, LookupId), QueryError> {
    let _span = tracing::debug_span!(
        "build_pipeline",
        search = options.is_search(),
        steps = plan.steps.len()
    )
    .entered();

    let deadline = (params.config.query_timeout_ms > 0)
        .then(|| Instant::now() + Duration::from_millis(params.config.query_timeout_ms));

    let mut cx = PipelineCtx::new(params.config.timeout_policy, deadline);
    let mut lookup = Lookup::new(params.schema.clone());
    if !options.is_search() {
        // Aggregations may reference fields produced later in the plan.
        lookup.set_option(LookupOptions::UNRESOLVED_OK);
    }
    let root_lookup = cx.lookups.add(lookup);

    let mut pipeline = Pipeline::new(cx);
    if options.flags.contains(RequestFlags::PROFILE) {
        pipeline.enable_profiling();
    }

    let mut builder = Builder {
        options,
        params,
        version_at_start: params.store.version(),
        lock: None,
        sorter_pushed: false,
    };

    pipeline.set_root(Box::new(SourceStage::new(
        iter,
        params.store.clone(),
        TimeoutChecker::new(deadline),
        params.shard_range,
    )));

    builder.push_metrics(&mut pipeline, root_lookup)?;
    builder.push_scorer(&mut pipeline, root_lookup, plan)?;

    let mut current = root_lookup;
    for step in &plan.steps {
        current = builder.apply_step(&mut pipeline, current, step)?;
    }

    // A search request without an explicit ARRANGE still sorts by score
    // into the default window.
    if options.is_search()
        && !plan
            .steps
            .iter()
            .any(|s| matches!(s, PlanStep::Arrange { .. }))
    {
        builder.arrange(&mut pipeline, current, 0, DEFAULT_LIMIT, None)?;
    }

    builder.push_output(&mut pipeline, current)?;

    if let Some(handle) = builder.lock.take() {
        pipeline.push(|up| Box::new(UnlockerStage::new(up, handle)));
    }

    Ok((pipeline, current))
}

/// Apply aggregation-plan steps to an existing pipeline (the hybrid tail
/// runs this on top of its merger). Returns the terminal lookup.
pub fn apply_plan(
    pipeline: &mut Pipeline,
    start_lookup: LookupId,
    plan: &AggregatePlan,
    options: &RequestOptions,
    params: &PipelineParams,
) -> Result<LookupId, QueryError> {
    let mut builder = Builder {
        options,
        params,
        version_at_start: params.store.version(),
        lock: None,
        sorter_pushed: false,
    };
    let mut current = start_lookup;
    for step in &plan.steps {
        current = builder.apply_step(pipeline, current, step)?;
    }
    if let Some(handle) = builder.lock.take() {
        pipeline.push(|up| Box::new(UnlockerStage::new(up, handle)));
    }
    Ok(current)
}

impl<'a> Builder<'a> {
    fn push_metrics(
        &mut self,
        pipeline: &mut Pipeline,
        lookup_id: LookupId,
    ) -> Result<(), QueryError> {
        if self.params.metrics.is_empty() {
            return Ok(());
        }
        let mut bindings = Vec::with_capacity(self.params.metrics.len());
        {
            let schema = self.params.schema.clone();
            let lookup = pipeline.cx.lookups.get_mut(lookup_id);
            for name in &self.params.metrics {
                if schema.as_ref().is_some_and(|s| s.find(name).is_some()) {
                    return Err(QueryError::new(
                        ErrorCode::IndexExists,
                        format!("Property `{name}` already exists in schema"),
                    ));
                }
                let key = lookup
                    .get_key_write(name, KeyFlags::empty())
                    .ok_or_else(|| QueryError::duplicate_field(name))?;
                bindings.push((name.clone(), key));
            }
        }
        pipeline.push(|up| Box::new(MetricsStage::new(up, lookup_id, bindings)));
        Ok(())
    }

    fn push_scorer(
        &mut self,
        pipeline: &mut Pipeline,
        lookup_id: LookupId,
        plan: &AggregatePlan,
    ) -> Result<(), QueryError> {
        let flags = self.options.flags;
        let scores_requested = flags
            .intersects(RequestFlags::SEND_SCORES | RequestFlags::SEND_SCORES_AS_FIELD);
        let search_rows = flags
            .intersects(RequestFlags::IS_SEARCH | RequestFlags::HYBRID_SEARCH_SUBQUERY)
            && !flags.contains(RequestFlags::NO_ROWS);
        if !scores_requested && !(search_rows && !plan.has_sort_by()) {
            return Ok(());
        }

        let score_key = if flags.contains(RequestFlags::SEND_SCORES_AS_FIELD) {
            let lookup = pipeline.cx.lookups.get_mut(lookup_id);
            let key = match &self.options.score_alias {
                Some(alias) => {
                    lookup.get_key_write(alias, KeyFlags::empty()).ok_or_else(|| {
                        QueryError::new(
                            ErrorCode::DupField,
                            format!(
                                "Could not create score alias, name already exists in query: {alias}"
                            ),
                        )
                    })?
                }
                None => lookup
                    .get_key_write(SCORE_FIELD, KeyFlags::OVERRIDE)
                    .expect("override write cannot conflict"),
            };
            Some((lookup_id, key))
        } else {
            None
        };

        let scorer_name = self
            .options
            .scorer
            .as_deref()
            .unwrap_or(scorer::DEFAULT_SCORER)
            .to_owned();
        let function = scorer::get_scorer(&scorer_name);
        let args = ScoringArgs {
            index_stats: self.params.index_stats,
            query_payload: self.options.query_payload.clone(),
            tanh_factor: DEFAULT_TANH_FACTOR,
            explain: flags.contains(RequestFlags::SEND_SCORE_EXPLAIN),
        };
        pipeline.push(|up| Box::new(ScorerStage::new(up, function, args, score_key)));

        if scorer_name == scorer::BM25_MAX_NORMALIZED_SCORER {
            pipeline.push(|up| Box::new(MaxScoreNormalizerStage::new(up, score_key)));
        }
        Ok(())
    }

    fn apply_step(
        &mut self,
        pipeline: &mut Pipeline,
        current: LookupId,
        step: &PlanStep,
    ) -> Result<LookupId, QueryError> {
        match step {
            PlanStep::Root | PlanStep::Distribute => Ok(current),
            PlanStep::Arrange {
                offset,
                limit,
                sort,
            } => {
                self.arrange(pipeline, current, *offset, *limit, sort.as_ref())?;
                Ok(current)
            }
            PlanStep::Apply { expr, alias } => {
                let (bound, out_key) = {
                    let lookup = pipeline.cx.lookups.get_mut(current);
                    let bound = BoundExpr::bind(expr.clone(), lookup)?;
                    let out_key = lookup
                        .get_key_write(alias, KeyFlags::empty())
                        .ok_or_else(|| QueryError::duplicate_field(alias))?;
                    (bound, out_key)
                };
                pipeline.push(|up| Box::new(ProjectorStage::new(up, current, bound, out_key)));
                Ok(current)
            }
            PlanStep::Filter { expr } => {
                let bound = BoundExpr::bind(expr.clone(), pipeline.cx.lookups.get_mut(current))?;
                pipeline.push(|up| Box::new(FilterStage::new(up, current, bound)));
                Ok(current)
            }
            PlanStep::Load { fields } => {
                self.load(pipeline, current, fields, KeyFlags::empty())?;
                Ok(current)
            }
            PlanStep::VectorNormalizer {
                distance_field,
                alias,
                metric,
            } => {
                let (src, dst) = {
                    let lookup = pipeline.cx.lookups.get_mut(current);
                    let src = lookup
                        .get_key_read(distance_field, KeyFlags::empty())
                        .ok_or_else(|| QueryError::unknown_property(distance_field))?;
                    let dst = lookup
                        .get_key_write(alias, KeyFlags::empty())
                        .ok_or_else(|| QueryError::duplicate_field(alias))?;
                    (src, dst)
                };
                let metric = *metric;
                pipeline.push(|up| {
                    Box::new(VectorNormalizerStage::new(up, current, src, dst, metric))
                });
                Ok(current)
            }
            PlanStep::Group {
                properties,
                reducers,
            } => self.group(pipeline, current, properties, reducers),
        }
    }

    /// Resolve `name` for reading, falling back to an implicit schema
    /// load. Keys that needed a load are appended to `load_keys`.
    fn read_or_load(
        &self,
        lookup: &mut Lookup,
        name: &str,
        load_keys: &mut Vec<KeyId>,
    ) -> Result<KeyId, QueryError> {
        if let Some(id) = lookup.get_key_read(name, KeyFlags::empty()) {
            if !lookup.key(id).flags().contains(KeyFlags::UNRESOLVED) {
                return Ok(id);
            }
        }
        let id = lookup
            .get_key_load(name, name, KeyFlags::empty())
            .or_else(|| lookup.find(name))
            .ok_or_else(|| QueryError::unknown_property(name))?;
        // Implicit loads are only allowed for fields the schema knows.
        if !lookup.key(id).flags().contains(KeyFlags::SCHEMA_SRC) {
            return Err(QueryError::unknown_property(name));
        }
        if lookup.key(id).flags().contains(KeyFlags::IS_LOADED) {
            load_keys.push(id);
        }
        Ok(id)
    }

    fn ensure_locked(&mut self, pipeline: &mut Pipeline) {
        if !self.options.safe_store_access || self.lock.is_some() {
            return;
        }
        let handle = LockHandle::new();
        let store = self.params.store.clone();
        let block_size = self.params.config.buffer_block_size;
        let version = self.version_at_start;
        let h = handle.clone();
        pipeline.push(move |up| Box::new(BufferLockStage::new(up, store, h, block_size, version)));
        self.lock = Some(handle);
    }

    fn push_loader(&mut self, pipeline: &mut Pipeline, lookup_id: LookupId, keys: Vec<KeyId>, mode: LoadMode) {
        self.ensure_locked(pipeline);
        let store = self.params.store.clone();
        // Full loads bypass the availability shortcut and keep strings
        // as-is so the reply shows exactly what the document holds.
        let all = mode == LoadMode::All;
        pipeline.push(move |up| {
            Box::new(LoaderStage::new(up, store, lookup_id, keys, mode, all, all))
        });
    }

    fn load(
        &mut self,
        pipeline: &mut Pipeline,
        lookup_id: LookupId,
        fields: &[LoadField],
        extra_flags: KeyFlags,
    ) -> Result<(), QueryError> {
        if fields.is_empty() {
            let lookup = pipeline.cx.lookups.get_mut(lookup_id);
            lookup.set_option(LookupOptions::ALL_LOADED);
            self.push_loader(pipeline, lookup_id, Vec::new(), LoadMode::All);
            return Ok(());
        }
        let mut keys = Vec::with_capacity(fields.len());
        {
            let lookup = pipeline.cx.lookups.get_mut(lookup_id);
            for field in fields {
                // `None` means the value is already present; nothing to do.
                if let Some(id) = lookup.get_key_load(field.name(), &field.path, extra_flags) {
                    keys.push(id);
                }
            }
        }
        if !keys.is_empty() {
            self.push_loader(pipeline, lookup_id, keys, LoadMode::KeyList);
        }
        Ok(())
    }

    fn arrange(
        &mut self,
        pipeline: &mut Pipeline,
        lookup_id: LookupId,
        offset: usize,
        limit: usize,
        sort: Option<&SortSpec>,
    ) -> Result<(), QueryError> {
        let cap = if self.options.is_search() {
            self.params.config.max_search_results
        } else {
            self.params.config.max_aggregate_results
        };
        if offset + limit > cap {
            return Err(QueryError::new(
                ErrorCode::Limit,
                format!("LIMIT exceeds maximum of {cap}"),
            ));
        }

        if self.options.flags.contains(RequestFlags::NO_ROWS) {
            pipeline.push(|up| Box::new(CounterStage::new(up)));
            return Ok(());
        }

        let mut max_results = offset + limit;
        if max_results == 0 {
            max_results = DEFAULT_LIMIT;
        }
        max_results = max_results.min(cap);

        let quick_exit = self.options.flags.contains(RequestFlags::OPTIMIZE);

        if let Some(spec) = sort.filter(|s| !s.keys.is_empty()) {
            let mut load_keys = Vec::new();
            let mut sort_keys = Vec::with_capacity(spec.keys.len());
            {
                let lookup = pipeline.cx.lookups.get_mut(lookup_id);
                for (i, name) in spec.keys.iter().enumerate() {
                    let id = self.read_or_load(lookup, name, &mut load_keys)?;
                    let key = lookup.key(id);
                    sort_keys.push(SortFieldKey {
                        dst_idx: key.dst_idx(),
                        sv_idx: key.sv_idx(),
                        use_sv: key.flags().contains(KeyFlags::SV_SRC),
                        ascending: spec.is_ascending(i),
                    });
                }
            }
            if !load_keys.is_empty() {
                self.push_loader(pipeline, lookup_id, load_keys, LoadMode::KeyList);
            }
            pipeline.push(|up| {
                Box::new(SorterStage::by_fields(up, max_results, sort_keys, quick_exit))
            });
            self.sorter_pushed = true;
        } else if self
            .options
            .flags
            .intersects(RequestFlags::IS_SEARCH | RequestFlags::HYBRID_SEARCH_SUBQUERY)
            || self.options.scorer.is_some()
        {
            // No sort keys: sorting by score is the default.
            pipeline.push(|up| Box::new(SorterStage::by_score(up, max_results, quick_exit)));
            self.sorter_pushed = true;
        }

        if offset > 0 || (limit > 0 && !self.sorter_pushed) {
            pipeline.push(|up| Box::new(PagerStage::new(up, offset, limit)));
        }
        Ok(())
    }

    fn group(
        &mut self,
        pipeline: &mut Pipeline,
        src_lookup: LookupId,
        properties: &[String],
        reducers: &[ReducerSpec],
    ) -> Result<LookupId, QueryError> {
        let mut load_keys = Vec::new();
        let mut src_keys = Vec::with_capacity(properties.len());
        let mut factories = Vec::with_capacity(reducers.len());
        {
            let lookup = pipeline.cx.lookups.get_mut(src_lookup);
            for name in properties {
                src_keys.push(self.read_or_load(lookup, name, &mut load_keys)?);
            }
            for spec in reducers {
                for prop in reducer_source_properties(spec) {
                    self.read_or_load(lookup, &prop, &mut load_keys)?;
                }
                factories.push(build_reducer_factory(spec, lookup)?);
            }
        }

        // A reducer over an unloaded schema field pulls a loader in front
        // of the grouper.
        if !load_keys.is_empty() {
            self.push_loader(pipeline, src_lookup, load_keys, LoadMode::KeyList);
        }

        // The grouper opens a fresh schema: the dimensions plus one key
        // per reducer.
        let mut dst = Lookup::new(self.params.schema.clone());
        dst.set_option(LookupOptions::UNRESOLVED_OK);
        let mut dst_keys = Vec::with_capacity(properties.len());
        for name in properties {
            let id = dst
                .get_key_write(name, KeyFlags::empty())
                .ok_or_else(|| QueryError::duplicate_field(name))?;
            dst_keys.push(id);
        }
        let mut reducer_keys = Vec::with_capacity(reducers.len());
        for spec in reducers {
            let flags = if spec.hidden {
                KeyFlags::HIDDEN
            } else {
                KeyFlags::empty()
            };
            let name = spec.output_name();
            let id = dst
                .get_key_write(&name, flags)
                .ok_or_else(|| QueryError::duplicate_field(&name))?;
            reducer_keys.push(id);
        }
        let dst_lookup = pipeline.cx.lookups.add(dst);

        pipeline.push(|up| {
            Box::new(GrouperStage::new(
                up,
                src_lookup,
                dst_lookup,
                src_keys,
                dst_keys,
                reducer_keys,
                factories,
            ))
        });
        Ok(dst_lookup)
    }

    /// The search output part: explicit RETURN loads and highlighting.
    fn push_output(
        &mut self,
        pipeline: &mut Pipeline,
        lookup_id: LookupId,
    ) -> Result<(), QueryError> {
        if !self.options.is_search() {
            return Ok(());
        }
        if !self.options.flags.contains(RequestFlags::SEND_NOFIELDS)
            && !self.options.return_fields.is_empty()
        {
            let fields = self.options.return_fields.clone();
            self.load(pipeline, lookup_id, &fields, KeyFlags::EXPLICIT_RETURN)?;
        }

        if self.options.flags.contains(RequestFlags::SEND_HIGHLIGHT)
            && !self.options.highlight_terms.is_empty()
        {
            let mut keys = Vec::new();
            {
                let lookup = pipeline.cx.lookups.get_mut(lookup_id);
                if self.options.highlight_fields.is_empty() {
                    keys.extend(lookup.iter().map(|(id, _)| id));
                } else {
                    for name in &self.options.highlight_fields {
                        if let Some(id) = lookup.find(name) {
                            keys.push(id);
                        }
                    }
                }
            }
            if !keys.is_empty() {
                let terms = self.options.highlight_terms.clone();
                pipeline.push(|up| {
                    Box::new(HighlightStage::new(up, lookup_id, keys, terms, "<b>", "</b>"))
                });
            }
        }
        Ok(())
    }
}
