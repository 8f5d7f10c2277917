//! Per-session record store: registration, terminal states, progress and the
//! final payload.
//!
//! Enrichment tasks run on a multi-threaded runtime, so every mutation goes
//! through one mutex. Records are only ever appended and annotated.

use crate::record::{Bib, OutputRecord, PublicationRecord, RawRecord, RecordSnapshot, RecordState};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Reason attached when the citation filter sees no count.
pub const REASON_NO_CITATIONS: &str = "no citation count";
/// Reason attached when the count is under the threshold.
pub const REASON_BELOW_THRESHOLD: &str = "citation count below threshold";

#[derive(Debug, Default)]
struct LedgerInner {
    records: Vec<PublicationRecord>,
    warnings: Vec<String>,
}

/// Outcome tally, mostly for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub registered: usize,
    pub filtered: usize,
    pub success: usize,
    pub failed: usize,
}

impl LedgerCounts {
    pub fn resolved(&self) -> usize {
        self.filtered + self.success + self.failed
    }
}

/// Single source of truth for one query session.
#[derive(Debug)]
pub struct ResultLedger {
    pages: u32,
    records_per_page: usize,
    inner: Mutex<LedgerInner>,
}

impl ResultLedger {
    pub fn new(pages: u32, records_per_page: usize) -> Self {
        Self {
            pages,
            records_per_page,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upper bound on records this session can register.
    pub fn capacity(&self) -> usize {
        self.pages as usize * self.records_per_page
    }

    /// Append a record and return its `task_id`.
    pub fn register(&self, raw: RawRecord) -> usize {
        let mut inner = self.lock();
        let task_id = inner.records.len();
        debug!(task_id, title = %raw.title, "Registered record");
        inner.records.push(PublicationRecord::from_raw(task_id, raw));
        task_id
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of what an enrichment task needs.
    pub fn snapshot(&self, task_id: usize) -> Option<RecordSnapshot> {
        self.lock().records.get(task_id).map(|r| r.snapshot())
    }

    /// Citation count as registered, for the filter.
    pub fn num_citations(&self, task_id: usize) -> Option<u32> {
        self.lock().records.get(task_id).and_then(|r| r.num_citations)
    }

    pub fn state(&self, task_id: usize) -> Option<RecordState> {
        self.lock().records.get(task_id).map(|r| r.state)
    }

    /// Registered → Enriching. Any other state is left alone.
    pub fn begin_enrichment(&self, task_id: usize) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(task_id) {
            if record.state == RecordState::Registered {
                record.state = RecordState::Enriching;
            }
        }
    }

    /// Append a failure reason without touching the state.
    pub fn annotate(&self, task_id: usize, reason: impl Into<String>) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(task_id) {
            record.error.push(reason.into());
        }
    }

    pub fn set_abstract(&self, task_id: usize, text: String) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(task_id) {
            record.abstract_text = Some(text);
        }
    }

    pub fn set_bib(&self, task_id: usize, bib: Bib) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(task_id) {
            record.bib = Some(bib);
        }
    }

    pub fn mark_filtered(&self, task_id: usize, reason: &str) {
        self.mark_terminal(task_id, RecordState::Filtered, Some(reason));
    }

    pub fn mark_failed(&self, task_id: usize, reason: &str) {
        self.mark_terminal(task_id, RecordState::Failed, Some(reason));
    }

    pub fn mark_success(&self, task_id: usize) {
        self.mark_terminal(task_id, RecordState::Success, None);
    }

    /// The first terminal class sticks. Repeating it appends the reason;
    /// a different class is logged and dropped.
    fn mark_terminal(&self, task_id: usize, target: RecordState, reason: Option<&str>) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(task_id) else {
            warn!(task_id, "Terminal mark for unknown record");
            return;
        };

        if record.state.is_terminal() && record.state != target {
            warn!(
                task_id,
                current = ?record.state,
                requested = ?target,
                "Ignoring conflicting terminal state"
            );
            return;
        }

        record.state = target;
        if let Some(reason) = reason {
            record.error.push(reason.to_string());
        }
    }

    /// Soft, session-level problem delivered next to the data.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "Session warning");
        self.lock().warnings.push(message);
    }

    pub fn warnings(&self) -> Vec<String> {
        self.lock().warnings.clone()
    }

    pub fn counts(&self) -> LedgerCounts {
        let inner = self.lock();
        let mut counts = LedgerCounts {
            registered: inner.records.len(),
            ..Default::default()
        };
        for record in &inner.records {
            match record.state {
                RecordState::Filtered => counts.filtered += 1,
                RecordState::Success => counts.success += 1,
                RecordState::Failed => counts.failed += 1,
                RecordState::Registered | RecordState::Enriching => {}
            }
        }
        counts
    }

    /// Resolved records over `pages × records_per_page`, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        let resolved = self.counts().resolved();
        (resolved as f64 / capacity as f64).clamp(0.0, 1.0)
    }

    /// Every registered record in registration order.
    pub fn deliver(&self, include_bib: bool) -> Vec<OutputRecord> {
        self.lock()
            .records
            .iter()
            .map(|r| OutputRecord::from_record(r, include_bib))
            .collect()
    }
}
