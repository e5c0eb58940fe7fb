//! Source stage
//!
//! The upstream-most link of every chain: wraps an index iterator and
//! emits one populated result per matching, live document. Holds the store
//! lock shared for the duration of the scan and releases it on any
//! terminal status. The only stage whose `next` may time out for reasons
//! not originating upstream.

use std::any::Any;

use crate::document::{DocumentStore, StoreReadGuard};
use crate::index::{IndexIterator, ReadOutcome};
use crate::util::timeout::TimeoutChecker;

use super::{PipelineCtx, SearchResult, Stage, StageKind, StageStatus};

/// Number of cluster hash slots keys map onto.
const NUM_SLOTS: u16 = 16384;

pub struct SourceStage {
    iter: Option<Box<dyn IndexIterator>>,
    store: DocumentStore,
    guard: Option<StoreReadGuard>,
    timeout: TimeoutChecker,
    /// Inclusive slot range owned by this shard; results outside it are
    /// skipped (cluster deployments during slot migration).
    shard_range: Option<(u16, u16)>,
}

impl SourceStage {
    pub fn new(
        iter: Option<Box<dyn IndexIterator>>,
        store: DocumentStore,
        timeout: TimeoutChecker,
        shard_range: Option<(u16, u16)>,
    ) -> Self {
        Self {
            iter,
            store,
            guard: None,
            timeout,
            shard_range,
        }
    }

    fn release_and(&mut self, status: StageStatus) -> StageStatus {
        self.guard = None;
        status
    }
}

impl Stage for SourceStage {
    fn next(&mut self, cx: &mut PipelineCtx, res: &mut SearchResult) -> StageStatus {
        if self.timeout.check() {
            return self.release_and(StageStatus::TimedOut);
        }

        // No root iterator: the query has zero results.
        if self.iter.is_none() {
            return self.release_and(StageStatus::Eof);
        }

        if self.guard.is_none() {
            self.guard = Some(self.store.lock_shared());
        }

        loop {
            let outcome = self.iter.as_mut().expect("checked above").read();
            let record = match outcome {
                ReadOutcome::Eof => return self.release_and(StageStatus::Eof),
                ReadOutcome::TimedOut => return self.release_and(StageStatus::TimedOut),
                ReadOutcome::NotFound => continue,
                ReadOutcome::Hit(r) => r,
            };

            let dmd = match record.dmd.clone() {
                Some(dmd) => dmd,
                None => {
                    let guard = self.guard.as_ref().expect("acquired above");
                    match guard.metadata(record.doc_id) {
                        Some(dmd) => dmd,
                        None => continue,
                    }
                }
            };
            if dmd.is_deleted() {
                continue;
            }

            if let Some((first, last)) = self.shard_range {
                let slot = key_slot(dmd.key.as_bytes());
                if slot < first || slot > last {
                    continue;
                }
            }

            cx.total_results += 1;

            res.doc_id = record.doc_id;
            res.score = 0.0;
            res.row.set_sort_vector(dmd.sort_vector.clone());
            res.dmd = Some(dmd);
            res.index_result = Some(record);
            return StageStatus::Ok;
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Cluster hash slot of a key: CRC16-CCITT over the hashtag (the `{...}`
/// substring when present, the whole key otherwise), modulo the slot count.
pub fn key_slot(key: &[u8]) -> u16 {
    let tagged = match key.iter().position(|&b| b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(0) | None => key,
            Some(close) => &key[open + 1..open + 1 + close],
        },
        None => key,
    };
    crc16(tagged) % NUM_SLOTS
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
