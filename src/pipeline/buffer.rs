//! Buffer-and-lock / unlocker stage pair
//!
//! When downstream stages must touch the live store, the buffer-and-lock
//! stage first drains its upstream into block-allocated memory, then
//! acquires the global store lock and replays the buffer. If the store
//! version moved since the request started, buffered results are
//! re-validated against deletions while replaying. The paired unlocker,
//! placed after the last store-accessing stage, releases the lock on any
//! terminal status — and on teardown, so every acquisition is balanced by
//! exactly one release on every exit path.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TimeoutPolicy;
use crate::document::{DocumentStore, StoreReadGuard};

use super::{Behavior, PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

/// Shared ownership of the store guard between the buffer-and-lock stage
/// (which acquires) and its paired unlocker (which releases).
#[derive(Clone, Default)]
pub struct LockHandle {
    guard: Arc<Mutex<Option<StoreReadGuard>>>,
}

impl LockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, guard: StoreReadGuard) {
        *self.guard.lock() = Some(guard);
    }

    /// Release the lock if held. Returns whether a guard was dropped.
    pub fn release(&self) -> bool {
        self.guard.lock().take().is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.guard.lock().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferPhase {
    Buffering,
    Yield,
    ValidateYield,
}

pub struct BufferLockStage {
    upstream: Box<dyn Stage>,
    store: DocumentStore,
    handle: LockHandle,
    blocks: Vec<Vec<SearchResult>>,
    block_size: usize,
    buffered: usize,
    cursor: usize,
    version_at_start: u64,
    phase: BufferPhase,
    exhaust: StageStatus,
}

impl BufferLockStage {
    pub fn new(
        upstream: Box<dyn Stage>,
        store: DocumentStore,
        handle: LockHandle,
        block_size: usize,
        version_at_start: u64,
    ) -> Self {
        Self {
            upstream,
            store,
            handle,
            blocks: Vec::new(),
            block_size: block_size.max(1),
            buffered: 0,
            cursor: 0,
            version_at_start,
            phase: BufferPhase::Buffering,
            exhaust: StageStatus::Eof,
        }
    }

    fn insert(&mut self, item: SearchResult) {
        if self.buffered % self.block_size == 0 {
            self.blocks.push(Vec::with_capacity(self.block_size));
        }
        self.blocks
            .last_mut()
            .expect("block pushed above")
            .push(item);
        self.buffered += 1;
    }

    fn take_next(&mut self) -> Option<SearchResult> {
        if self.cursor >= self.buffered {
            return None;
        }
        let block = self.cursor / self.block_size;
        let offset = self.cursor % self.block_size;
        self.cursor += 1;
        Some(std::mem::take(&mut self.blocks[block][offset]))
    }

    fn buffer_upstream(&mut self, cx: &mut PipelineCtx) -> Option<StageStatus> {
        loop {
            let mut item = SearchResult::new();
            match self.upstream.next(cx, &mut item) {
                StageStatus::Ok => self.insert(item),
                StageStatus::Eof => break,
                StageStatus::TimedOut if cx.timeout_policy == TimeoutPolicy::Return => {
                    self.exhaust = StageStatus::TimedOut;
                    break;
                }
                other => return Some(other),
            }
        }

        if self.buffered == 0 {
            // Nothing to replay; no reason to take the lock.
            return Some(self.exhaust);
        }

        // All filter-passing results are buffered; lock the store for the
        // downstream accessors.
        let guard = self.store.lock_shared();
        let version_now = guard.version();
        self.handle.store(guard);
        self.phase = if version_now != self.version_at_start {
            tracing::debug!(
                from = self.version_at_start,
                to = version_now,
                "store changed while buffering, validating results"
            );
            BufferPhase::ValidateYield
        } else {
            BufferPhase::Yield
        };
        None
    }
}

impl Stage for BufferLockStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        if self.phase == BufferPhase::Buffering {
            if let Some(status) = self.buffer_upstream(cx) {
                return status;
            }
        }

        while let Some(item) = self.take_next() {
            if self.phase == BufferPhase::ValidateYield {
                let deleted = item.dmd.as_ref().map(|d| d.is_deleted()).unwrap_or(false);
                if deleted {
                    cx.total_results = cx.total_results.saturating_sub(1);
                    continue;
                }
            }
            *res = item;
            return StageStatus::Ok;
        }
        self.exhaust
    }

    fn kind(&self) -> StageKind {
        StageKind::BufferLock
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

impl Drop for BufferLockStage {
    fn drop(&mut self) {
        self.handle.release();
    }
}

/// Releases the store lock once the stream is over. Must sit after the
/// last store-accessing stage of the chain.
pub struct UnlockerStage {
    upstream: Box<dyn Stage>,
    handle: LockHandle,
}

impl UnlockerStage {
    pub fn new(upstream: Box<dyn Stage>, handle: LockHandle) -> Self {
        Self { upstream, handle }
    }
}

impl Stage for UnlockerStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        let rc = self.upstream.next(cx, res);
        if rc != StageStatus::Ok {
            self.handle.release();
        }
        rc
    }

    fn kind(&self) -> StageKind {
        StageKind::Unlocker
    }

    fn upstream(&self) -> Option<&dyn Stage> {
        Some(self.upstream.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for UnlockerStage {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, PipelineCtx};
    use crate::schema::{DocMetadata, SchemaCache};

    /// Emits doc metadata borrowed from the store.
    struct MetaFixture {
        dmds: std::vec::IntoIter<Arc<DocMetadata>>,
    }

    impl Stage for MetaFixture {
        fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
            match self.dmds.next() {
                Some(dmd) => {
                    cx.total_results += 1;
                    res.doc_id = dmd.doc_id;
                    res.dmd = Some(dmd);
                    StageStatus::Ok
                }
                None => StageStatus::Eof,
            }
        }
        fn kind(&self) -> StageKind {
            StageKind::Source
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn seeded_store(n: usize) -> (DocumentStore, Vec<Arc<DocMetadata>>) {
        let store = DocumentStore::new();
        let schema = SchemaCache::new(vec![]);
        let mut dmds = Vec::new();
        for i in 0..n {
            let id = store.add_record(&schema, &format!("doc:{i}"), vec![], 1.0);
            dmds.push(store.lock_shared().metadata(id).unwrap());
        }
        (store, dmds)
    }

    fn locked_pipeline(
        store: &DocumentStore,
        dmds: Vec<Arc<DocMetadata>>,
        handle: LockHandle,
    ) -> Pipeline {
        let mut p = Pipeline::new(PipelineCtx::new(TimeoutPolicy::Return, None));
        p.set_root(Box::new(MetaFixture {
            dmds: dmds.into_iter(),
        }));
        let version = store.version();
        let store2 = store.clone();
        let h = handle.clone();
        p.push(move |up| Box::new(BufferLockStage::new(up, store2, h, 2, version)));
        let h = handle;
        p.push(move |up| Box::new(UnlockerStage::new(up, h)));
        p
    }

    #[test]
    fn test_buffer_then_replay_everything() {
        let (store, dmds) = seeded_store(5);
        let handle = LockHandle::new();
        let mut p = locked_pipeline(&store, dmds, handle.clone());
        let (rows, status) = p.drain();
        assert_eq!(rows.len(), 5);
        assert_eq!(status, StageStatus::Eof);
        // The unlocker released on EOF.
        assert!(!handle.is_locked());
    }

    #[test]
    fn test_lock_held_during_yield() {
        let (store, dmds) = seeded_store(2);
        let handle = LockHandle::new();
        let mut p = locked_pipeline(&store, dmds, handle.clone());
        let mut res = SearchResult::new();
        assert_eq!(p.next(&mut res), StageStatus::Ok);
        // Mid-stream: the lock is held.
        assert!(handle.is_locked());
        res.clear();
        assert_eq!(p.next(&mut res), StageStatus::Ok);
        res.clear();
        assert_eq!(p.next(&mut res), StageStatus::Eof);
        assert!(!handle.is_locked());
    }

    #[test]
    fn test_teardown_mid_stream_releases() {
        let (store, dmds) = seeded_store(3);
        let handle = LockHandle::new();
        let mut p = locked_pipeline(&store, dmds, handle.clone());
        let mut res = SearchResult::new();
        assert_eq!(p.next(&mut res), StageStatus::Ok);
        assert!(handle.is_locked());
        // Cancelled request: the chain is dropped with rows pending.
        drop(p);
        assert!(!handle.is_locked());
    }

    #[test]
    fn test_version_change_validates_deletions() {
        let (store, dmds) = seeded_store(3);
        let handle = LockHandle::new();
        // Capture the version, then delete a doc to force validation.
        let mut p = locked_pipeline(&store, dmds, handle.clone());
        store.delete("doc:1");
        let (rows, status) = p.drain();
        assert_eq!(status, StageStatus::Eof);
        assert_eq!(rows.len(), 2, "deleted doc dropped during replay");
        assert_eq!(p.cx.total_results, 2);
    }

    #[test]
    fn test_empty_buffer_never_locks() {
        let (store, _) = seeded_store(0);
        let handle = LockHandle::new();
        let mut p = locked_pipeline(&store, vec![], handle.clone());
        let (rows, status) = p.drain();
        assert!(rows.is_empty());
        assert_eq!(status, StageStatus::Eof);
        assert!(!handle.is_locked());
    }
}
