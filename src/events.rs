//! Progress events
//!
//! The orchestrator reports progress as typed events over a channel and never
//! renders anything itself. Events from concurrently analyzed repos interleave;
//! only per-repo ordering (started, stages, completed) is meaningful.

use crate::models::SourceStatus;
use std::collections::HashMap;
use std::sync::mpsc;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Discovery began with this many queries and a global candidate limit.
    Started { query_count: usize, limit: usize },
    /// One search query finished; `found` counts newly accepted repos.
    QueryCompleted { query: String, found: usize },
    /// Candidate collection finished.
    SearchCompleted {
        candidates: usize,
        skipped_quarantined: usize,
        skipped_low_stars: usize,
    },
    /// A repo entered analysis.
    AnalysisStarted { repo: String },
    /// A repo moved to a new analysis stage ("fetching runs", "dl 2.3 MB", ...).
    AnalysisProgress { repo: String, stage: String },
    /// A repo finished analysis.
    AnalysisCompleted {
        repo: String,
        status: SourceStatus,
        artifact: Option<String>,
        failure_count: Option<u32>,
        cache_hit: bool,
        elapsed_ms: u64,
        completed: usize,
        total: usize,
    },
    /// Discovery finished; `stats` counts results per status.
    Completed {
        total: usize,
        stats: HashMap<SourceStatus, usize>,
    },
}

/// Cheap handle for emitting events. A disabled sender drops everything, and a
/// hung-up receiver is ignored so display problems never abort discovery.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<mpsc::Sender<DiscoveryEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<DiscoveryEvent>) -> Self {
        EventSender { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        EventSender { tx: None }
    }

    pub fn emit(&self, event: DiscoveryEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
