use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event::{EventKind, ProgressEvent, SessionId};

const DEFAULT_CAPACITY: usize = 256;

struct SessionLog {
    history: Vec<ProgressEvent>,
    sender: broadcast::Sender<ProgressEvent>,
    closed_at: Option<Instant>,
}

struct BusInner {
    sessions: Mutex<HashMap<SessionId, SessionLog>>,
    capacity: usize,
    retention: Duration,
}

/// Per-session event log with live fan-out.
///
/// `emit` appends to history under the lock and then hands the event to a
/// broadcast channel, which never waits for readers. A session closes only
/// when a terminal event is emitted; consumers coming and going do not
/// affect it. Closed sessions are dropped by `evict_expired` once the
/// retention window has passed.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    pub fn new(retention: Duration) -> Self {
        Self::with_capacity(retention, DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a live consumer may fall behind before it
    /// has to catch up from history.
    pub fn with_capacity(retention: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sessions: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                retention,
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionLog>> {
        // a panicked writer cannot leave a log half-appended
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a log for `session_id`. No-op if it already exists.
    pub fn open(&self, session_id: SessionId) {
        let capacity = self.inner.capacity;
        self.sessions().entry(session_id).or_insert_with(|| SessionLog {
            history: Vec::new(),
            sender: broadcast::channel(capacity).0,
            closed_at: None,
        });
    }

    /// Append and publish. Returns the event's `seq`, or `None` when the
    /// session is unknown or already closed.
    pub fn emit(&self, session_id: SessionId, kind: EventKind, payload: Value) -> Option<u64> {
        let mut sessions = self.sessions();
        let log = sessions.get_mut(&session_id)?;
        if log.closed_at.is_some() {
            debug!("Dropping {} for closed session {}", kind, session_id);
            return None;
        }

        let event = ProgressEvent {
            seq: log.history.len() as u64,
            session_id,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        log.history.push(event.clone());
        if kind.is_terminal() {
            log.closed_at = Some(Instant::now());
        }
        let seq = event.seq;
        // no receivers is fine; history has it
        let _ = log.sender.send(event);
        Some(seq)
    }

    /// Replay of everything so far, then live events until a terminal one.
    pub fn subscribe(&self, session_id: SessionId) -> Option<Subscription> {
        let sessions = self.sessions();
        let log = sessions.get(&session_id)?;
        // snapshot and subscribe under one lock so nothing falls in between
        let backlog: VecDeque<ProgressEvent> = log.history.iter().cloned().collect();
        let rx = log.sender.subscribe();
        Some(Subscription {
            bus: self.clone(),
            session_id,
            backlog,
            rx,
            last_seq: None,
            done: false,
        })
    }

    pub fn history(&self, session_id: SessionId) -> Option<Vec<ProgressEvent>> {
        self.sessions().get(&session_id).map(|l| l.history.clone())
    }

    fn history_after(&self, session_id: SessionId, last_seq: Option<u64>) -> Vec<ProgressEvent> {
        let start = last_seq.map_or(0, |s| s as usize + 1);
        self.sessions()
            .get(&session_id)
            .map(|l| l.history.get(start..).unwrap_or_default().to_vec())
            .unwrap_or_default()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions().contains_key(&session_id)
    }

    pub fn is_closed(&self, session_id: SessionId) -> bool {
        self.sessions()
            .get(&session_id)
            .is_some_and(|l| l.closed_at.is_some())
    }

    /// Drop closed sessions older than the retention window.
    pub fn evict_expired(&self) -> usize {
        let retention = self.inner.retention;
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, l| match l.closed_at {
            Some(t) => t.elapsed() < retention,
            None => true,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!("Evicted {} closed session(s)", evicted);
        }
        evicted
    }
}

/// One consumer's view of a session. Dropping it does not touch the session.
pub struct Subscription {
    bus: ProgressBus,
    session_id: SessionId,
    backlog: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
    last_seq: Option<u64>,
    done: bool,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn is_new(&self, event: &ProgressEvent) -> bool {
        self.last_seq.map_or(true, |last| event.seq > last)
    }

    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.last_seq = Some(event.seq);
        if event.is_terminal() {
            self.done = true;
        }
        event
    }

    /// Next event in `seq` order, each exactly once. `None` after the
    /// terminal event, or if the session was evicted.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.done {
                return None;
            }
            if let Some(event) = self.backlog.pop_front() {
                if self.is_new(&event) {
                    return Some(self.deliver(event));
                }
                continue;
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if self.is_new(&event) {
                        return Some(self.deliver(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber of {} lagged by {} events; catching up from history",
                        self.session_id, skipped
                    );
                    self.backlog = self.bus.history_after(self.session_id, self.last_seq).into();
                }
                Err(RecvError::Closed) => {
                    self.backlog = self.bus.history_after(self.session_id, self.last_seq).into();
                    if self.backlog.is_empty() {
                        self.done = true;
                    }
                }
            }
        }
    }
}

/// Emit a heartbeat every `period` until the session closes or disappears.
pub fn spawn_heartbeat(bus: ProgressBus, session_id: SessionId, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !bus.contains(session_id) || bus.is_closed(session_id) {
                break;
            }
            let payload = json!({ "elapsed_secs": started.elapsed().as_secs() });
            if bus.emit(session_id, EventKind::Heartbeat, payload).is_none() {
                break;
            }
        }
        debug!("Heartbeat for {} stopped", session_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn bus() -> (ProgressBus, SessionId) {
        let bus = ProgressBus::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        bus.open(id);
        (bus, id)
    }

    async fn drain(sub: &mut Subscription) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Some(ev) = sub.next().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live_events() {
        let (bus, id) = bus();
        for i in 0..5 {
            bus.emit(id, EventKind::PhaseStart, json!({ "i": i }));
        }
        let mut sub = bus.subscribe(id).unwrap();

        let producer = bus.clone();
        let task = tokio::spawn(async move {
            for i in 5..9 {
                producer.emit(id, EventKind::Iteration, json!({ "i": i }));
                tokio::task::yield_now().await;
            }
            producer.emit(id, EventKind::Complete, json!({}));
        });

        let events = drain(&mut sub).await;
        task.await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_without_gaps() {
        let bus = ProgressBus::with_capacity(Duration::from_secs(60), 2);
        let id = Uuid::new_v4();
        bus.open(id);
        let mut sub = bus.subscribe(id).unwrap();
        for i in 0..20 {
            bus.emit(id, EventKind::Iteration, json!({ "i": i }));
        }
        bus.emit(id, EventKind::Error, json!({ "reason": "x" }));

        let seqs: Vec<u64> = drain(&mut sub).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..21).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn disconnect_does_not_close_the_session() {
        let (bus, id) = bus();
        bus.emit(id, EventKind::PhaseStart, json!({}));
        drop(bus.subscribe(id).unwrap());
        assert!(!bus.is_closed(id));
        assert!(bus.emit(id, EventKind::PhaseComplete, json!({})).is_some());

        let mut again = bus.subscribe(id).unwrap();
        assert_eq!(again.next().await.unwrap().seq, 0);
        assert_eq!(again.next().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn terminal_event_closes_and_later_emits_are_dropped() {
        let (bus, id) = bus();
        bus.emit(id, EventKind::Complete, json!({}));
        assert!(bus.is_closed(id));
        assert_eq!(bus.emit(id, EventKind::Heartbeat, json!({})), None);
        let mut sub = bus.subscribe(id).unwrap();
        assert_eq!(drain(&mut sub).await.len(), 1);
    }

    #[tokio::test]
    async fn eviction_only_removes_expired_closed_sessions() {
        let bus = ProgressBus::new(Duration::ZERO);
        let open = Uuid::new_v4();
        let closed = Uuid::new_v4();
        bus.open(open);
        bus.open(closed);
        bus.emit(closed, EventKind::Complete, json!({}));
        assert_eq!(bus.evict_expired(), 1);
        assert!(bus.contains(open));
        assert!(!bus.contains(closed));
    }

    #[tokio::test]
    async fn heartbeat_runs_until_session_closes() {
        let (bus, id) = bus();
        let handle = spawn_heartbeat(bus.clone(), id, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(90)).await;
        bus.emit(id, EventKind::Complete, json!({}));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let history = bus.history(id).unwrap();
        let beats = history.iter().filter(|e| e.kind == EventKind::Heartbeat).count();
        assert!(beats >= 2, "only {} heartbeats", beats);
        assert!(history.last().unwrap().is_terminal());
    }

    #[test]
    fn unknown_session_has_no_subscription() {
        let bus = ProgressBus::new(Duration::from_secs(1));
        assert!(bus.subscribe(Uuid::new_v4()).is_none());
        assert_eq!(bus.emit(Uuid::new_v4(), EventKind::Heartbeat, json!({})), None);
    }
}
