//! The active-run table.
//!
//! One entry per in-flight run, keyed by run id. At most one run may be
//! active per thread: inserting a second entry for the same thread fails
//! `THREAD_BUSY` (callers use `run_or_append` to enqueue instead). Entries
//! carry the cancellation token, the pending-message queue drained by the
//! inject step, and the stop bookkeeping the state machine reads.

use agentry_graph::{EngineError, Message, Result, RunnableConfig, ToolCall, UsageSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Book-keeping for one active run
#[derive(Debug)]
pub struct RunEntry {
    /// Run id (also the table key)
    pub run_id: String,
    /// The run's config
    pub rc: RunnableConfig,
    /// Cancelled by `stop`/`stop_thread`
    pub cancel: CancellationToken,
    /// Messages appended mid-run, drained by the inject step
    pub pending: Mutex<Vec<Message>>,
    /// Set once a stop has claimed this run
    pub stopped: AtomicBool,
    /// Why the run was stopped
    pub stop_reason: Mutex<Option<String>>,
    /// Whether the finish tool has been called
    pub finish_called: AtomicBool,
    /// Finish-tool flag
    pub needs_more_info: AtomicBool,
    /// Shell tool call currently in flight, if any
    pub shell_call: Mutex<Option<ToolCall>>,
    /// Accumulated counters, kept current during the run
    pub usage: Mutex<UsageSnapshot>,
}

impl RunEntry {
    fn new(rc: RunnableConfig) -> Self {
        Self {
            run_id: rc.run_id.clone(),
            rc,
            cancel: CancellationToken::new(),
            pending: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
            finish_called: AtomicBool::new(false),
            needs_more_info: AtomicBool::new(false),
            shell_call: Mutex::new(None),
            usage: Mutex::new(UsageSnapshot::default()),
        }
    }

    /// Whether the finish tool has been called on this run
    pub fn is_finished(&self) -> bool {
        self.finish_called.load(Ordering::SeqCst)
    }

    /// Whether a stop has claimed this run
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Current usage snapshot
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        *self.usage.lock()
    }
}

/// Active runs of one agent
#[derive(Default)]
pub struct ActiveRuns {
    entries: Mutex<HashMap<String, Arc<RunEntry>>>,
}

impl ActiveRuns {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new run; fails `THREAD_BUSY` if the thread already has one
    pub fn insert(&self, rc: RunnableConfig) -> Result<Arc<RunEntry>> {
        let mut entries = self.entries.lock();
        if entries.values().any(|e| e.rc.thread_id == rc.thread_id) {
            return Err(EngineError::ThreadBusy(rc.thread_id));
        }
        let entry = Arc::new(RunEntry::new(rc));
        entries.insert(entry.run_id.clone(), entry.clone());
        Ok(entry)
    }

    /// The active run on a thread, if any
    pub fn by_thread(&self, thread_id: &str) -> Option<Arc<RunEntry>> {
        self.entries
            .lock()
            .values()
            .find(|e| e.rc.thread_id == thread_id)
            .cloned()
    }

    /// Remove an entry; idempotent
    pub fn remove(&self, run_id: &str) -> Option<Arc<RunEntry>> {
        self.entries.lock().remove(run_id)
    }

    /// Runs whose thread (or parent thread) matches; all runs when `None`
    pub fn matching(&self, thread_id: Option<&str>) -> Vec<Arc<RunEntry>> {
        self.entries
            .lock()
            .values()
            .filter(|e| match thread_id {
                Some(t) => e.rc.thread_id == t || e.rc.parent_thread_id.as_deref() == Some(t),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Number of active runs
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no run is active
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
