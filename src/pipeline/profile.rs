//! Profile wrapper stage
//!
//! Wraps another stage transparently, timing every `next` call with a
//! monotonic clock and counting invocations (the call that reports EOF
//! included, so the count matches what the wrapped stage conceptually
//! produced).

use std::any::Any;
use std::time::{Duration, Instant};

use super::{Behavior, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

pub struct ProfileStage {
    wrapped: Box<dyn Stage>,
    elapsed: Duration,
    calls: u64,
}

impl ProfileStage {
    pub fn new(wrapped: Box<dyn Stage>) -> Self {
        Self {
            wrapped,
            elapsed: Duration::ZERO,
            calls: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Kind of the stage being profiled.
    pub fn wrapped_kind(&self) -> StageKind {
        self.wrapped.kind()
    }
}

impl Stage for ProfileStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let t0 = Instant::now();
        let rc = self.wrapped.next(cx, res);
        self.elapsed += t0.elapsed();
        self.calls += 1;
        rc
    }

    fn kind(&self) -> StageKind {
        StageKind::Profile
    }

    fn behavior(&self) -> Behavior {
        self.wrapped.behavior()
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.wrapped.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One line of a profile report.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub kind: StageKind,
    pub elapsed: Duration,
    pub calls: u64,
}

/// Collect profile numbers from a chain built with profiling enabled.
pub fn collect_profile(end: Option<&dyn Stage>) -> Vec<ProfileEntry> {
    let mut entries = Vec::new();
    let mut cur = end;
    while let Some(stage) = cur {
        if let Some(profile) = stage.as_any().downcast_ref::<ProfileStage>() {
            entries.push(ProfileEntry {
                kind: profile.wrapped_kind(),
                elapsed: profile.elapsed(),
                calls: profile.calls(),
            });
        }
        cur = stage.upstream();
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutPolicy;
    use crate::pipeline::tests::FixtureStage;
    use crate::pipeline::Pipeline;

    #[test]
    fn test_profile_counts_calls_including_eof() {
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.enable_profiling();
        p.set_root(Box::new(FixtureStage::new(vec![(1, 0.1), (2, 0.2)])));
        let (rows, _) = p.drain();
        assert_eq!(rows.len(), 2);

        let report = collect_profile(p.end_stage());
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].kind, StageKind::Source);
        // Two producing calls plus the EOF call.
        assert_eq!(report[0].calls, 3);
    }

    #[test]
    fn test_profile_wraps_whole_chain() {
        use crate::pipeline::sort::PagerStage;

        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.enable_profiling();
        p.set_root(Box::new(FixtureStage::new(vec![(1, 0.1)])));
        p.push(|up| Box::new(PagerStage::new(up, 0, 10)));
        let (_, _) = p.drain();

        let report = collect_profile(p.end_stage());
        let kinds: Vec<StageKind> = report.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![StageKind::Pager, StageKind::Source]);
    }
}
