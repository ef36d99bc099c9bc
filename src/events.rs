//! In-process event bus with bounded history.
//!
//! `publish` is non-blocking: every subscriber owns a bounded queue and a
//! subscriber that falls behind is dropped after overflow, with the loss
//! recorded as a `subscriber_dropped` event. A ring of the last
//! [`DEFAULT_RING_CAPACITY`] events is retained for late joiners and
//! reconnect replay. Events from one `(project, entity)` reach every
//! subscriber in publication order; duplicates are harmless because events
//! are idempotent by their `(kind, entity id, version)` payload fields.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const DEFAULT_RING_CAPACITY: usize = 1000;
const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

// ── Event kinds ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProjectCreated,
    ProjectUpdated,
    ProjectDeleted,
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    TaskDeleted,
    TaskVersionCreated,
    ChangeRequestCreated,
    ChangeRequestSubmitted,
    ChangeRequestApproved,
    ChangeRequestRejected,
    ChangeRequestApplied,
    ApprovalRecorded,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    GateExecuted,
    GatePassed,
    GateFailed,
    ArtifactCreated,
    RunStarted,
    RunLog,
    RunEnded,
    VcsCommitted,
    Security,
    ExecutionPaused,
    ExecutionResumed,
    SubscriberDropped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::ProjectUpdated => "project_updated",
            Self::ProjectDeleted => "project_deleted",
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskStatusChanged => "task_status_changed",
            Self::TaskDeleted => "task_deleted",
            Self::TaskVersionCreated => "task_version_created",
            Self::ChangeRequestCreated => "change_request_created",
            Self::ChangeRequestSubmitted => "change_request_submitted",
            Self::ChangeRequestApproved => "change_request_approved",
            Self::ChangeRequestRejected => "change_request_rejected",
            Self::ChangeRequestApplied => "change_request_applied",
            Self::ApprovalRecorded => "approval_recorded",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseFailed => "phase_failed",
            Self::GateExecuted => "gate_executed",
            Self::GatePassed => "gate_passed",
            Self::GateFailed => "gate_failed",
            Self::ArtifactCreated => "artifact_created",
            Self::RunStarted => "run_started",
            Self::RunLog => "run_log",
            Self::RunEnded => "run_ended",
            Self::VcsCommitted => "vcs_committed",
            Self::Security => "security",
            Self::ExecutionPaused => "execution_paused",
            Self::ExecutionResumed => "execution_resumed",
            Self::SubscriberDropped => "subscriber_dropped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Invalid event kind: {}", s))
    }
}

// ── Event ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Global, bus-wide monotonic sequence number.
    pub seq: u64,
    /// Monotonic sequence within the owning project, when project-scoped.
    pub project_seq: Option<u64>,
    pub kind: EventKind,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

// ── Filters ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_project(project_id: i64) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind
            && event.kind != kind
        {
            return false;
        }
        if let Some(project_id) = self.project_id
            && event.project_id != Some(project_id)
        {
            return false;
        }
        if let Some(task_id) = self.task_id
            && event.task_id != Some(task_id)
        {
            return false;
        }
        true
    }
}

// ── Bus ───────────────────────────────────────────────────────────────

struct SubscriberEntry {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    ring: Mutex<VecDeque<Event>>,
    ring_capacity: usize,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    project_seqs: Mutex<HashMap<i64, u64>>,
    global_seq: AtomicU64,
    next_subscriber_id: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl EventBus {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
                ring_capacity,
                subscribers: Mutex::new(Vec::new()),
                project_seqs: Mutex::new(HashMap::new()),
                global_seq: AtomicU64::new(0),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Seed a project's sequence counter from persisted audit rows so
    /// numbering keeps rising across restarts.
    pub fn seed_project_seq(&self, project_id: i64, last_seq: u64) {
        let mut seqs = self.inner.project_seqs.lock().unwrap();
        let entry = seqs.entry(project_id).or_insert(0);
        if *entry < last_seq {
            *entry = last_seq;
        }
    }

    pub fn publish(
        &self,
        kind: EventKind,
        project_id: Option<i64>,
        payload: serde_json::Value,
    ) -> Event {
        self.emit(kind, project_id, None, None, payload)
    }

    pub fn publish_task(
        &self,
        kind: EventKind,
        project_id: i64,
        task_id: i64,
        payload: serde_json::Value,
    ) -> Event {
        self.emit(kind, Some(project_id), Some(task_id), None, payload)
    }

    pub fn publish_correlated(
        &self,
        kind: EventKind,
        project_id: Option<i64>,
        task_id: Option<i64>,
        correlation_id: &str,
        payload: serde_json::Value,
    ) -> Event {
        self.emit(
            kind,
            project_id,
            task_id,
            Some(correlation_id.to_string()),
            payload,
        )
    }

    fn emit(
        &self,
        kind: EventKind,
        project_id: Option<i64>,
        task_id: Option<i64>,
        correlation_id: Option<String>,
        payload: serde_json::Value,
    ) -> Event {
        let seq = self.inner.global_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let project_seq = project_id.map(|pid| {
            let mut seqs = self.inner.project_seqs.lock().unwrap();
            let entry = seqs.entry(pid).or_insert(0);
            *entry += 1;
            *entry
        });

        let event = Event {
            seq,
            project_seq,
            kind,
            project_id,
            task_id,
            correlation_id,
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        {
            let mut ring = self.inner.ring.lock().unwrap();
            if ring.len() >= self.inner.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let mut dropped: Vec<u64> = Vec::new();
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap();
            subscribers.retain(|entry| {
                if !entry.filter.matches(&event) {
                    return true;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.push(entry.id);
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        // Record the loss visibly; guard against recursing on the loss
        // event itself.
        if kind != EventKind::SubscriberDropped {
            for id in dropped {
                tracing::warn!(subscriber = id, "dropping slow event subscriber");
                self.emit(
                    EventKind::SubscriberDropped,
                    project_id,
                    None,
                    None,
                    serde_json::json!({"subscriber_id": id, "at_seq": seq}),
                );
            }
        }

        event
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, DEFAULT_SUBSCRIBER_QUEUE)
    }

    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push(SubscriberEntry { id, filter, tx });
        Subscription { id, rx }
    }

    /// Retained events with a global sequence number greater than `since`,
    /// in publication order. `since = 0` replays the entire ring.
    pub fn replay(&self, since: u64, filter: &EventFilter) -> Vec<Event> {
        let ring = self.inner.ring.lock().unwrap();
        ring.iter()
            .filter(|e| e.seq > since && filter.matches(e))
            .cloned()
            .collect()
    }

    /// Filtered view over the retained ring, newest last, optionally capped
    /// to the trailing `limit` entries.
    pub fn history(&self, filter: &EventFilter, limit: Option<usize>) -> Vec<Event> {
        let mut events = self.replay(0, filter);
        if let Some(limit) = limit
            && events.len() > limit
        {
            events.drain(..events.len() - limit);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_events_in_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(EventFilter::for_project(1));

        bus.publish(EventKind::ProjectCreated, Some(1), serde_json::json!({}));
        bus.publish(EventKind::ProjectCreated, Some(2), serde_json::json!({}));
        bus.publish_task(EventKind::TaskCreated, 1, 10, serde_json::json!({}));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::ProjectCreated);
        assert_eq!(first.project_id, Some(1));

        let second = sub.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::TaskCreated);
        assert_eq!(second.task_id, Some(10));
        assert!(second.seq > first.seq);
    }

    #[test]
    fn replay_since_zero_returns_full_ring_in_order() {
        let bus = EventBus::default();
        bus.publish(EventKind::TaskCreated, Some(1), serde_json::json!({"n": 1}));
        bus.publish(EventKind::TaskUpdated, Some(1), serde_json::json!({"n": 2}));
        bus.publish(
            EventKind::TaskStatusChanged,
            Some(1),
            serde_json::json!({"n": 3}),
        );

        let events = bus.replay(0, &EventFilter::all());
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload["n"], 1);
        assert_eq!(events[1].payload["n"], 2);
        assert_eq!(events[2].payload["n"], 3);
        assert!(events[0].seq < events[1].seq && events[1].seq < events[2].seq);
    }

    #[test]
    fn replay_since_skips_already_seen() {
        let bus = EventBus::default();
        let e1 = bus.publish(EventKind::TaskCreated, Some(1), serde_json::json!({}));
        bus.publish(EventKind::TaskUpdated, Some(1), serde_json::json!({}));

        let events = bus.replay(e1.seq, &EventFilter::all());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TaskUpdated);
    }

    #[test]
    fn ring_is_bounded() {
        let bus = EventBus::new(5);
        for i in 0..10 {
            bus.publish(EventKind::RunLog, Some(1), serde_json::json!({"i": i}));
        }
        let events = bus.replay(0, &EventFilter::all());
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].payload["i"], 5);
        assert_eq!(events[4].payload["i"], 9);
    }

    #[test]
    fn per_project_sequences_are_independent() {
        let bus = EventBus::default();
        let a1 = bus.publish(EventKind::TaskCreated, Some(1), serde_json::json!({}));
        let b1 = bus.publish(EventKind::TaskCreated, Some(2), serde_json::json!({}));
        let a2 = bus.publish(EventKind::TaskUpdated, Some(1), serde_json::json!({}));

        assert_eq!(a1.project_seq, Some(1));
        assert_eq!(b1.project_seq, Some(1));
        assert_eq!(a2.project_seq, Some(2));
    }

    #[test]
    fn seeded_project_seq_continues_from_persisted_value() {
        let bus = EventBus::default();
        bus.seed_project_seq(7, 41);
        let event = bus.publish(EventKind::TaskCreated, Some(7), serde_json::json!({}));
        assert_eq!(event.project_seq, Some(42));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_with_loss_event() {
        let bus = EventBus::default();
        // Queue of one: the second undelivered event overflows it.
        let _slow = bus.subscribe_with_capacity(EventFilter::all(), 1);
        let mut watcher = bus.subscribe(EventFilter {
            kind: Some(EventKind::SubscriberDropped),
            ..EventFilter::default()
        });

        bus.publish(EventKind::RunLog, Some(1), serde_json::json!({"n": 1}));
        bus.publish(EventKind::RunLog, Some(1), serde_json::json!({"n": 2}));

        let loss = watcher.recv().await.unwrap();
        assert_eq!(loss.kind, EventKind::SubscriberDropped);
        assert!(loss.payload["subscriber_id"].is_number());

        // Publishers keep working after the drop.
        bus.publish(EventKind::RunLog, Some(1), serde_json::json!({"n": 3}));
    }

    #[test]
    fn history_filter_by_kind_and_limit() {
        let bus = EventBus::default();
        for i in 0..4 {
            bus.publish(EventKind::RunLog, Some(1), serde_json::json!({"i": i}));
        }
        bus.publish(EventKind::RunEnded, Some(1), serde_json::json!({}));

        let filter = EventFilter {
            kind: Some(EventKind::RunLog),
            ..EventFilter::default()
        };
        let logs = bus.history(&filter, Some(2));
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].payload["i"], 2);
        assert_eq!(logs[1].payload["i"], 3);
    }

    #[test]
    fn event_kind_round_trips() {
        for kind in [
            EventKind::ProjectCreated,
            EventKind::TaskVersionCreated,
            EventKind::ChangeRequestApplied,
            EventKind::GateFailed,
            EventKind::VcsCommitted,
            EventKind::Security,
        ] {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
