//! Sessions tie one refinement run to its progress log and final result.

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::SessionError;
use crate::progress::{spawn_heartbeat, EventKind, ProgressBus, SessionId, Subscription};
use crate::refinement::{
    CancelFlag, CodeGenerator, Orchestrator, RefinementOutcome, RefinementRequest,
    RefinementSettings,
};
use crate::sandbox::Executor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    /// Already started earlier; nothing new was launched.
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Finished,
    /// The run task died without producing an outcome.
    Aborted,
}

enum RunState {
    Created,
    Running,
    Finished(Arc<RefinementOutcome>),
    Aborted(String),
}

struct SessionEntry {
    state: RunState,
    cancel: CancelFlag,
    finished_at: Option<Instant>,
}

struct ManagerInner {
    bus: ProgressBus,
    generator: Arc<dyn CodeGenerator>,
    executor: Arc<dyn Executor>,
    settings: RefinementSettings,
    heartbeat: Duration,
    retention: Duration,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

/// Cloneable handle. Each started session runs on its own task; sessions
/// only contend for the executor's concurrency cap.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        executor: Arc<dyn Executor>,
        settings: RefinementSettings,
        heartbeat: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus: ProgressBus::new(retention),
                generator,
                executor,
                settings,
                heartbeat,
                retention,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.inner.bus
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_session(&self) -> SessionId {
        let id = Uuid::new_v4();
        self.inner.bus.open(id);
        self.sessions().insert(
            id,
            SessionEntry {
                state: RunState::Created,
                cancel: CancelFlag::default(),
                finished_at: None,
            },
        );
        info!("Created session {}", id);
        id
    }

    /// Launch the run. Starting a session twice is a no-op.
    pub fn start(&self, id: SessionId, request: RefinementRequest) -> Result<StartStatus, SessionError> {
        let cancel = {
            let mut sessions = self.sessions();
            let entry = sessions.get_mut(&id).ok_or_else(|| not_found(id))?;
            if !matches!(entry.state, RunState::Created) {
                return Ok(StartStatus::AlreadyStarted);
            }
            entry.state = RunState::Running;
            entry.cancel.clone()
        };

        info!("Starting session {}", id);
        let manager = self.clone();
        tokio::spawn(async move { manager.drive(id, request, cancel).await });
        Ok(StartStatus::Started)
    }

    async fn drive(self, id: SessionId, request: RefinementRequest, cancel: CancelFlag) {
        let bus = self.inner.bus.clone();
        let heartbeat = spawn_heartbeat(bus.clone(), id, self.inner.heartbeat);

        let orchestrator = Orchestrator::new(
            self.inner.generator.clone(),
            self.inner.executor.clone(),
            self.inner.settings.clone(),
        )
        .with_progress(bus.clone(), id)
        .with_cancel(cancel);

        // run on its own task so a panic still ends the session properly
        let run = tokio::spawn(async move { orchestrator.run(request).await });
        match run.await {
            Ok(outcome) => {
                let outcome = Arc::new(outcome);
                let kind = if outcome.is_error() {
                    EventKind::Error
                } else {
                    EventKind::Complete
                };
                info!("Session {} finished: {:?}", id, outcome.status);
                // result first, so a consumer that sees the terminal event can fetch it
                self.finish(id, RunState::Finished(outcome.clone()));
                bus.emit(id, kind, outcome.summary());
            }
            Err(e) => {
                error!("Session {} aborted: {}", id, e);
                let reason = e.to_string();
                self.finish(id, RunState::Aborted(reason.clone()));
                bus.emit(id, EventKind::Error, json!({ "error": reason }));
            }
        }
        heartbeat.abort();
    }

    fn finish(&self, id: SessionId, state: RunState) {
        if let Some(entry) = self.sessions().get_mut(&id) {
            entry.state = state;
            entry.finished_at = Some(Instant::now());
        }
    }

    /// History first, then live events until the terminal one.
    pub fn subscribe(&self, id: SessionId) -> Result<Subscription, SessionError> {
        self.inner.bus.subscribe(id).ok_or_else(|| not_found(id))
    }

    pub fn state(&self, id: SessionId) -> Result<SessionState, SessionError> {
        let sessions = self.sessions();
        let entry = sessions.get(&id).ok_or_else(|| not_found(id))?;
        Ok(match entry.state {
            RunState::Created => SessionState::Created,
            RunState::Running => SessionState::Running,
            RunState::Finished(_) => SessionState::Finished,
            RunState::Aborted(_) => SessionState::Aborted,
        })
    }

    /// Final outcome with its iteration history. Available until the
    /// session is evicted.
    pub fn get_result(&self, id: SessionId) -> Result<Arc<RefinementOutcome>, SessionError> {
        let sessions = self.sessions();
        let entry = sessions.get(&id).ok_or_else(|| not_found(id))?;
        match &entry.state {
            RunState::Finished(outcome) => Ok(outcome.clone()),
            RunState::Created => Err(SessionError::NotStarted { id: id.to_string() }),
            RunState::Running => Err(SessionError::Running { id: id.to_string() }),
            RunState::Aborted(reason) => Err(SessionError::Aborted {
                id: id.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Takes effect between iterations.
    pub fn cancel(&self, id: SessionId) -> Result<(), SessionError> {
        let sessions = self.sessions();
        let entry = sessions.get(&id).ok_or_else(|| not_found(id))?;
        entry.cancel.cancel();
        info!("Cancellation requested for session {}", id);
        Ok(())
    }

    /// Forget sessions that finished longer ago than the retention window.
    pub fn evict_expired(&self) -> usize {
        let retention = self.inner.retention;
        self.inner.bus.evict_expired();
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, e| e.finished_at.map_or(true, |t| t.elapsed() < retention));
        before - sessions.len()
    }
}

fn not_found(id: SessionId) -> SessionError {
    SessionError::NotFound { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{HistoricalData, MarketData};
    use crate::models::{DateRange, Interval};
    use crate::refinement::TemplateGenerator;
    use crate::sandbox::InProcessExecutor;
    use crate::test_helpers::{calm_closes, day, make_daily_bars, rsi_config};

    fn manager(retention: Duration) -> SessionManager {
        let mut data = HistoricalData::new(Interval::D1);
        data.load("AAPL", make_daily_bars(&calm_closes(200)).into_vec());
        let market: Arc<dyn MarketData> = Arc::new(data);
        SessionManager::new(
            Arc::new(TemplateGenerator::new(rsi_config())),
            Arc::new(InProcessExecutor::new().with_market_data(market)),
            RefinementSettings {
                max_iterations: 2,
                ..Default::default()
            },
            Duration::from_secs(30),
            retention,
        )
    }

    fn request() -> RefinementRequest {
        RefinementRequest {
            description: "rsi reversion".into(),
            protected_parameters: rsi_config().protected_parameters(),
            range: DateRange::new(day(0), day(180)),
            initial_capital: 10_000.0,
            interval: Interval::D1,
        }
    }

    async fn wait_for_terminal(m: &SessionManager, id: SessionId) {
        let mut sub = m.subscribe(id).unwrap();
        while sub.next().await.is_some() {}
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let m = manager(Duration::from_secs(60));
        let id = m.create_session();
        assert_eq!(m.start(id, request()).unwrap(), StartStatus::Started);
        assert_eq!(m.start(id, request()).unwrap(), StartStatus::AlreadyStarted);
        wait_for_terminal(&m, id).await;
        assert_eq!(m.start(id, request()).unwrap(), StartStatus::AlreadyStarted);

        let outcome = m.get_result(id).unwrap();
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn result_is_not_available_before_start() {
        let m = manager(Duration::from_secs(60));
        let id = m.create_session();
        assert!(matches!(m.get_result(id), Err(SessionError::NotStarted { .. })));
        assert!(matches!(
            m.get_result(Uuid::new_v4()),
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn result_outlives_the_stream() {
        let m = manager(Duration::from_secs(60));
        let id = m.create_session();
        m.start(id, request()).unwrap();
        wait_for_terminal(&m, id).await;
        assert!(m.bus().is_closed(id));
        assert_eq!(m.state(id).unwrap(), SessionState::Finished);
        assert!(m.get_result(id).unwrap().final_result.is_some());
        assert_eq!(m.evict_expired(), 0);
    }

    #[tokio::test]
    async fn expired_sessions_are_evicted() {
        let m = manager(Duration::ZERO);
        let id = m.create_session();
        m.start(id, request()).unwrap();
        wait_for_terminal(&m, id).await;
        assert_eq!(m.evict_expired(), 1);
        assert!(matches!(m.get_result(id), Err(SessionError::NotFound { .. })));
        assert!(m.subscribe(id).is_err());
    }

    #[tokio::test]
    async fn cancel_before_start_ends_immediately() {
        let m = manager(Duration::from_secs(60));
        let id = m.create_session();
        m.cancel(id).unwrap();
        m.start(id, request()).unwrap();
        wait_for_terminal(&m, id).await;
        let outcome = m.get_result(id).unwrap();
        assert_eq!(outcome.status, crate::refinement::RunStatus::Cancelled);
        assert!(outcome.history.is_empty());
    }
}
