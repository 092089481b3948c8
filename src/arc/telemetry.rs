//! Telemetry collection primitives for chunk scheduling.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::FrameRange;

#[derive(Debug, Default)]
struct TelemetryState {
    stage_counts: HashMap<&'static str, u64>,
    chunks_dispatched: u64,
    chunks_succeeded: u64,
    chunks_failed: u64,
    retries: u64,
    frames_blended: u64,
    frames_composited: u64,
}

/// Snapshot of telemetry suitable for assertions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    pub stage_counts: Vec<(String, u64)>,
    pub chunks_dispatched: u64,
    pub chunks_succeeded: u64,
    pub chunks_failed: u64,
    pub retries: u64,
    pub frames_blended: u64,
    pub frames_composited: u64,
}

impl TelemetrySnapshot {
    pub fn stage_count(&self, stage: &str) -> u64 {
        self.stage_counts
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }
}

/// Shared sink capturing per-stage events.
#[derive(Clone, Default)]
pub struct TelemetrySink {
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetrySink {
    // Counters stay usable even if a panicking task poisoned the lock.
    fn lock(&self) -> MutexGuard<'_, TelemetryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a stage observation for a span of frames.
    pub fn record_stage(&self, stage: &'static str, _range: FrameRange) {
        *self.lock().stage_counts.entry(stage).or_insert(0) += 1;
    }

    pub fn record_dispatch(&self, _range: FrameRange) {
        self.lock().chunks_dispatched += 1;
    }

    pub fn record_chunk_outcome(&self, succeeded: bool) {
        let mut state = self.lock();
        if succeeded {
            state.chunks_succeeded += 1;
        } else {
            state.chunks_failed += 1;
        }
    }

    pub fn record_retry(&self, _range: FrameRange) {
        self.lock().retries += 1;
    }

    pub fn record_blended(&self, frames: usize) {
        self.lock().frames_blended += frames as u64;
    }

    pub fn record_composited(&self, frames: usize) {
        self.lock().frames_composited += frames as u64;
    }

    /// Exposes a snapshot for diagnostics and testing.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.lock();
        TelemetrySnapshot {
            stage_counts: state
                .stage_counts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            chunks_dispatched: state.chunks_dispatched,
            chunks_succeeded: state.chunks_succeeded,
            chunks_failed: state.chunks_failed,
            retries: state.retries,
            frames_blended: state.frames_blended,
            frames_composited: state.frames_composited,
        }
    }
}
