//! Visualization snapshot producer
//!
//! The plotting side is external and polls one JSON file. Every tick the
//! whole history is rewritten pretty-printed, so a half-written file is the
//! worst a reader can see, never a truncated history. Keys are numeric ticks
//! in a BTreeMap, which keeps the serialized object sorted.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use kinet_core::NodeId;

/// One per-tick snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    /// Vehicles served per node (load-balancing scenario)
    NodeLoads(BTreeMap<NodeId, usize>),
    /// Summed latency proxy over all misplaced vehicles (mobility scenarios)
    GlobalLatency { global_latency: u64 },
}

/// Append-only snapshot history with full-file rewrite
pub struct SnapshotLog {
    path: PathBuf,
    snapshots: BTreeMap<u64, Snapshot>,
}

impl SnapshotLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshots: BTreeMap::new(),
        }
    }

    /// Record a snapshot and rewrite the file. Write failures are logged;
    /// the run never stops over the visualization output.
    pub fn record(&mut self, tick: u64, snapshot: Snapshot) {
        self.snapshots.insert(tick, snapshot);

        let json = match serde_json::to_string_pretty(&self.snapshots) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize visualization snapshot: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.path, json) {
            warn!(path = %self.path.display(), "failed to write visualization snapshot: {e}");
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
