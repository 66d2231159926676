// Bounded in-memory trace of recovery activity.
//
// Every trigger, admission decision, dismissal, and terminal outcome is
// recorded with a timestamp so field problems can be reconstructed after the
// fact. The ring keeps the newest records and drops the oldest.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceEvent {
    /// An external caller requested recovery.
    Trigger,
    /// The request was escalated to a stronger action.
    Escalated,
    /// An action was appended to the ready queue.
    Admitted,
    /// The request was dropped (compatible action already in flight).
    Dropped,
    /// Admission refused: the target has permanently failed.
    Refused,
    /// An action was cancelled by a stronger one.
    Dismissed,
    /// An action reached a terminal outcome.
    Finalized,
    /// A follow-up action was generated.
    FollowUp,
    /// A target was marked permanently failed.
    MarkedFailed,
    /// Both queues drained; recovery quiesced.
    Quiesced,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceEvent::Trigger => "trigger",
            TraceEvent::Escalated => "escalated",
            TraceEvent::Admitted => "admitted",
            TraceEvent::Dropped => "dropped",
            TraceEvent::Refused => "refused",
            TraceEvent::Dismissed => "dismissed",
            TraceEvent::Finalized => "finalized",
            TraceEvent::FollowUp => "follow-up",
            TraceEvent::MarkedFailed => "marked-failed",
            TraceEvent::Quiesced => "quiesced",
        };
        f.pad(name)
    }
}

/// One trace record.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub at: DateTime<Utc>,
    pub adapter: String,
    pub target: String,
    pub event: TraceEvent,
    pub detail: String,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<13} {:<28} {}",
            self.at.format("%H:%M:%S%.3f"),
            self.event,
            self.target,
            self.detail
        )
    }
}

/// Ring buffer of recovery activity, shared by all adapters of one engine.
pub struct RecoveryTrace {
    run_id: Uuid,
    capacity: usize,
    records: Mutex<VecDeque<TraceRecord>>,
}

impl RecoveryTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn record(
        &self,
        adapter: &str,
        target: impl fmt::Display,
        event: TraceEvent,
        detail: impl Into<String>,
    ) {
        let mut records = self.records.lock().unwrap();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(TraceRecord {
            at: Utc::now(),
            adapter: adapter.to_string(),
            target: target.to_string(),
            event,
            detail: detail.into(),
        });
    }

    /// The newest `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<TraceRecord> {
        let records = self.records.lock().unwrap();
        records.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn all(&self) -> Vec<TraceRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }

    /// Records matching one event kind, oldest first.
    pub fn by_event(&self, event: TraceEvent) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.event == event)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl Default for RecoveryTrace {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_keeps_newest_records() {
        let trace = RecoveryTrace::new(3);
        for i in 0..5 {
            trace.record("fc0", "port 0x1", TraceEvent::Trigger, format!("t{}", i));
        }

        let records = trace.all();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].detail, "t2");
        assert_eq!(records[2].detail, "t4");
    }

    #[test]
    fn test_recent_returns_oldest_first() {
        let trace = RecoveryTrace::new(10);
        trace.record("fc0", "a", TraceEvent::Trigger, "first");
        trace.record("fc0", "a", TraceEvent::Admitted, "second");

        let recent = trace.recent(2);
        assert_eq!(recent[0].detail, "first");
        assert_eq!(recent[1].detail, "second");
    }

    #[test]
    fn test_by_event_filters() {
        let trace = RecoveryTrace::new(10);
        trace.record("fc0", "a", TraceEvent::Trigger, "");
        trace.record("fc0", "a", TraceEvent::Admitted, "");
        trace.record("fc0", "b", TraceEvent::Trigger, "");

        assert_eq!(trace.by_event(TraceEvent::Trigger).len(), 2);
        assert_eq!(trace.by_event(TraceEvent::Dismissed).len(), 0);
    }
}
