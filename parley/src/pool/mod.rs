//! Bounded pool of conversation sessions.
//!
//! Each slot pairs a [`Session`] with its [`InvocationRunner`] and, when
//! enabled, a [`LogTailMonitor`]. Sessions share nothing with each other;
//! the pool only holds the slot map and the active pointer.

mod health;

pub use health::{HealthReport, SessionHealth};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::events::{EventBus, PoolEvent, Source};
use crate::monitor::LogTailMonitor;
use crate::names::generate_name;
use crate::runner::{InvocationOutcome, InvocationRunner, RunnerHandle};
use crate::timeline::{Session, SessionStatus, TimelineProjector, Update};

const EVENT_CAPACITY: usize = 1024;

struct Slot {
    session: Mutex<Session>,
    runner: Mutex<InvocationRunner>,
    handle: RunnerHandle,
    monitor: StdMutex<Option<LogTailMonitor>>,
    closed: AtomicBool,
}

impl Slot {
    fn monitor(&self) -> MutexGuard<'_, Option<LogTailMonitor>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<String, Arc<Slot>>,
    /// Ids in creation order.
    order: Vec<String>,
    active: Option<String>,
}

/// Owns up to `max_sessions` sessions and fans out their events.
pub struct SessionPool {
    settings: Settings,
    projector: TimelineProjector,
    bus: EventBus,
    diagnostics: Diagnostics,
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(settings: Settings) -> Self {
        let diagnostics = Diagnostics::new(settings.diagnostics_capacity);
        Self::with_diagnostics(settings, diagnostics)
    }

    /// Pool reporting into an existing diagnostics sink.
    pub fn with_diagnostics(settings: Settings, diagnostics: Diagnostics) -> Self {
        Self {
            projector: TimelineProjector::new(&settings),
            bus: EventBus::new(EVENT_CAPACITY),
            diagnostics,
            settings,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Receive every event the pool emits from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.bus.subscribe()
    }

    /// Create a session. An empty name gets a generated one.
    ///
    /// The first session created while none is active becomes active.
    pub async fn create(&self, name: &str) -> Result<Session> {
        let name = match name.trim() {
            "" => generate_name(),
            given => given.to_string(),
        };
        let id = Uuid::now_v7().to_string();
        let session = Session::new(id.clone(), name.clone(), self.settings.working_dir.clone());
        let runner = InvocationRunner::new(session.short_id(), &self.settings, self.diagnostics.clone());

        let slot = Arc::new(Slot {
            handle: runner.handle(),
            session: Mutex::new(session),
            runner: Mutex::new(runner),
            monitor: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });

        {
            let mut state = self.state.lock().await;
            if state.slots.len() >= self.settings.max_sessions {
                return Err(Error::Capacity {
                    max: self.settings.max_sessions,
                });
            }
            state.slots.insert(id.clone(), Arc::clone(&slot));
            state.order.push(id.clone());
        }

        info!(session = %id, %name, "session created");
        self.diagnostics.record(short(&id), format!("created \"{name}\""));
        self.bus.emit(PoolEvent::SessionCreated {
            session_id: id.clone(),
            name,
        });

        self.set_status(&id, &slot, SessionStatus::Starting).await;
        if self.settings.monitor_logs {
            match LogTailMonitor::start(id.clone(), &self.settings, self.bus.clone(), self.diagnostics.clone()) {
                Ok(monitor) => *slot.monitor() = Some(monitor),
                Err(err) => {
                    warn!(session = %id, %err, "log monitor unavailable");
                    self.diagnostics.record(short(&id), format!("log monitor unavailable: {err}"));
                }
            }
        }
        self.set_status(&id, &slot, SessionStatus::Ready).await;

        let became_active = {
            let mut state = self.state.lock().await;
            if state.active.is_none() && state.slots.contains_key(&id) {
                state.active = Some(id.clone());
                true
            } else {
                false
            }
        };
        if became_active {
            self.bus.emit(PoolEvent::SessionSwitched {
                session_id: id.clone(),
            });
        }

        let snapshot = slot.session.lock().await.clone();
        Ok(snapshot)
    }

    /// Make `id` the active session.
    pub async fn switch(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.slots.contains_key(id) {
                return Err(Error::NotFound(id.to_string()));
            }
            state.active = Some(id.to_string());
        }
        debug!(session = %id, "switched");
        self.bus.emit(PoolEvent::SessionSwitched {
            session_id: id.to_string(),
        });
        Ok(())
    }

    /// Close a session, killing any in-flight invocation and stopping its
    /// monitor.
    ///
    /// If it was active, the most recently created remaining session
    /// becomes active.
    pub async fn close(&self, id: &str) -> Result<()> {
        let (slot, reassigned) = {
            let mut state = self.state.lock().await;
            let slot = state
                .slots
                .remove(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            state.order.retain(|other| other != id);

            let mut reassigned = None;
            if state.active.as_deref() == Some(id) {
                state.active = state.order.last().cloned();
                reassigned = state.active.clone();
            }
            (slot, reassigned)
        };

        slot.closed.store(true, Ordering::SeqCst);
        slot.handle.terminate();
        if let Some(monitor) = slot.monitor().take() {
            monitor.dispose();
        }
        slot.session.lock().await.status = SessionStatus::Closed;

        info!(session = %id, "session closed");
        self.diagnostics.record(short(id), "closed");
        self.bus.emit(PoolEvent::SessionClosed {
            session_id: id.to_string(),
        });
        if let Some(next) = reassigned {
            self.bus.emit(PoolEvent::SessionSwitched { session_id: next });
        }
        Ok(())
    }

    /// Send a message and wait for the invocation to finish.
    ///
    /// Timeline updates are delivered as events while it runs. The session
    /// must be `ready`, or `error` to retry after a failure. Only one send
    /// per session may be in flight; an overlapping call fails with
    /// [`Error::Busy`].
    pub async fn send(&self, id: &str, text: &str) -> Result<InvocationOutcome> {
        let slot = self.slot(id).await?;
        let mut runner = slot.runner.try_lock().map_err(|_| Error::Busy)?;

        {
            let mut session = slot.session.lock().await;
            if !session.status.accepts_messages() {
                return Err(Error::NotReady {
                    id: id.to_string(),
                    status: session.status,
                });
            }
            let message = self.projector.record_user(&mut session, text);
            self.projector.begin_invocation(&mut session);
            self.publish(&slot, id, Source::Stream, vec![Update::Message(message)]);
        }
        if let Some(monitor) = slot.monitor().as_ref() {
            monitor.prime();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consume = async {
            while let Some(event) = rx.recv().await {
                let updates = {
                    let mut session = slot.session.lock().await;
                    self.projector.apply(&mut session, &event)
                };
                self.publish(&slot, id, Source::Stream, updates);
            }
        };
        let (outcome, ()) = tokio::join!(runner.invoke(text, tx), consume);
        drop(runner);

        if slot.is_closed() {
            debug!(session = %id, "invocation ended after close");
            return outcome;
        }

        let mut session = slot.session.lock().await;
        let terminal = outcome.as_ref().ok().and_then(|done| done.result.as_ref());
        let failed = matches!(&outcome, Err(err) if !matches!(err, Error::ContextLimit(_)));
        let updates = self.projector.finish_invocation(&mut session, terminal, failed);
        self.publish(&slot, id, Source::Stream, updates);

        let next_status = match &outcome {
            Ok(_) => {
                session.last_error = None;
                SessionStatus::Ready
            }
            Err(Error::ContextLimit(detail)) => {
                let notice = format!("Context limit reached: {detail}");
                let message = self.projector.record_assistant(&mut session, &notice);
                self.publish(&slot, id, Source::Stream, vec![Update::Message(message)]);
                SessionStatus::Ready
            }
            Err(err) if err.is_process_level() => {
                warn!(session = %id, %err, "invocation failed");
                session.last_error = Some(err.to_string());
                SessionStatus::Error
            }
            Err(_) => session.status,
        };
        if session.status != next_status {
            session.status = next_status;
            drop(session);
            self.bus.emit(PoolEvent::SessionStatusChanged {
                session_id: id.to_string(),
                status: next_status,
            });
        }

        outcome
    }

    /// Snapshot of one session.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let slot = self.slot(id).await?;
        let session = slot.session.lock().await.clone();
        Ok(session)
    }

    /// Snapshots of every session, oldest first.
    pub async fn list(&self) -> Vec<Session> {
        let slots = self.ordered_slots().await;
        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            sessions.push(slot.session.lock().await.clone());
        }
        sessions
    }

    /// Id of the active session.
    pub async fn active(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolve a full id or a unique id prefix.
    pub async fn resolve(&self, prefix: &str) -> Result<String> {
        let state = self.state.lock().await;
        if state.slots.contains_key(prefix) {
            return Ok(prefix.to_string());
        }
        let mut matches = state.order.iter().filter(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) if !prefix.is_empty() => Ok(id.clone()),
            _ => Err(Error::NotFound(prefix.to_string())),
        }
    }

    /// Per-session liveness plus the diagnostics dump.
    pub async fn health(&self) -> HealthReport {
        let active = self.active().await;
        let mut sessions = Vec::new();
        for slot in self.ordered_slots().await {
            let monitoring = slot.monitor().as_ref().is_some_and(LogTailMonitor::is_running);
            let session = slot.session.lock().await;
            sessions.push(SessionHealth {
                id: session.id.clone(),
                name: session.name.clone(),
                status: session.status,
                turn: session.turn,
                invoking: slot.handle.is_running(),
                monitoring,
                invocations: session.invocations,
                last_error: session.last_error.clone(),
            });
        }
        HealthReport {
            active,
            capacity: self.settings.max_sessions,
            sessions,
            diagnostics: self.diagnostics.dump(),
        }
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let ids = self.state.lock().await.order.clone();
        for id in ids {
            if let Err(err) = self.close(&id).await {
                debug!(session = %id, %err, "already closed during shutdown");
            }
        }
    }

    async fn slot(&self, id: &str) -> Result<Arc<Slot>> {
        self.state
            .lock()
            .await
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn ordered_slots(&self) -> Vec<Arc<Slot>> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.slots.get(id).cloned())
            .collect()
    }

    async fn set_status(&self, id: &str, slot: &Slot, status: SessionStatus) {
        slot.session.lock().await.status = status;
        self.bus.emit(PoolEvent::SessionStatusChanged {
            session_id: id.to_string(),
            status,
        });
    }

    /// Emit updates unless the session has been closed.
    fn publish(&self, slot: &Slot, id: &str, source: Source, updates: Vec<Update>) {
        if slot.is_closed() {
            return;
        }
        for update in updates {
            self.bus.emit(match update {
                Update::Message(message) => PoolEvent::MessageReceived {
                    session_id: id.to_string(),
                    source,
                    message,
                },
                Update::Service(info) => PoolEvent::ServiceInfoReceived {
                    session_id: id.to_string(),
                    source,
                    info,
                },
            });
        }
    }
}

fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::timeline::{Message, ToolStatus, TurnStatus, FORCED_COMPLETION_MARKER};
    use std::path::Path;
    use std::time::Duration;

    /// Pool whose "assistant" is `sh <script>` run inside `dir`.
    fn pool(dir: &Path, script: &str) -> SessionPool {
        let path = dir.join("fake-cli.sh");
        std::fs::write(&path, script).unwrap();
        SessionPool::new(
            Settings::new(dir)
                .program("sh")
                .arg(path.to_string_lossy())
                .without_monitor(),
        )
    }

    const HELLO: &str = r#"echo "$@" >> args.txt
cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"abc"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
"#;

    fn assistant_texts(session: &Session) -> Vec<&str> {
        session
            .timeline
            .iter()
            .filter_map(|message| match message {
                Message::AssistantText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn hello_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), HELLO);
        let session = pool.create("greeter").await.unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(pool.active().await.as_deref(), Some(session.id.as_str()));

        let mut events = pool.subscribe();
        pool.send(&session.id, "hello").await.unwrap();

        let session = pool.get(&session.id).await.unwrap();
        assert_eq!(assistant_texts(&session), vec!["hi"]);
        assert_eq!(session.resume_token.as_deref(), Some("abc"));
        assert!(matches!(&session.timeline[0], Message::User { text, .. } if text == "hello"));
        assert!(matches!(session.timeline.last(), Some(Message::Service { .. })));

        let mut saw_hi = false;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::MessageReceived {
                source: Source::Stream,
                message: Message::AssistantText { text, .. },
                ..
            } = event
            {
                saw_hi |= text == "hi";
            }
        }
        assert!(saw_hi);
    }

    #[tokio::test]
    async fn second_send_resumes_the_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), HELLO);
        let id = pool.create("").await.unwrap().id;
        pool.send(&id, "one").await.unwrap();
        pool.send(&id, "two").await.unwrap();

        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        let lines: Vec<&str> = args.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].contains("--resume"));
        assert!(lines[1].ends_with("--resume abc"));
    }

    #[tokio::test]
    async fn unanswered_tool_is_forced_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"search","input":{"q":"x"}}]}}'
"#,
        );
        let id = pool.create("tools").await.unwrap().id;
        pool.send(&id, "look it up").await.unwrap();

        let session = pool.get(&id).await.unwrap();
        assert!(session.pending_tools.is_empty());
        let tool = session
            .timeline
            .iter()
            .find_map(|message| match message {
                Message::ToolCall(tool) if tool.id == "t1" => Some(tool),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.result.as_deref(), Some(FORCED_COMPLETION_MARKER));
        assert_eq!(session.turn, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn rejects_beyond_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.sh");
        std::fs::write(&path, "cat > /dev/null\n").unwrap();
        let pool = SessionPool::new(
            Settings::new(dir.path())
                .program("sh")
                .arg(path.to_string_lossy())
                .max_sessions(1)
                .without_monitor(),
        );

        pool.create("one").await.unwrap();
        assert!(matches!(pool.create("two").await, Err(Error::Capacity { max: 1 })));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_and_unready_sessions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), HELLO);
        assert!(matches!(pool.switch("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(pool.send("nope", "x").await, Err(Error::NotFound(_))));

        let id = pool.create("s").await.unwrap().id;
        pool.slot(&id).await.unwrap().session.lock().await.status = SessionStatus::Starting;
        assert!(matches!(
            pool.send(&id, "x").await,
            Err(Error::NotReady { status: SessionStatus::Starting, .. })
        ));
    }

    #[tokio::test]
    async fn close_reassigns_active_to_newest_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), HELLO);
        let first = pool.create("first").await.unwrap().id;
        let second = pool.create("second").await.unwrap().id;
        let third = pool.create("third").await.unwrap().id;
        assert_eq!(pool.active().await.as_deref(), Some(first.as_str()));

        pool.switch(&second).await.unwrap();
        let mut events = pool.subscribe();
        pool.close(&second).await.unwrap();

        assert_eq!(pool.active().await.as_deref(), Some(third.as_str()));
        assert!(matches!(pool.get(&second).await, Err(Error::NotFound(_))));
        assert!(matches!(
            events.try_recv(),
            Ok(PoolEvent::SessionClosed { session_id }) if session_id == second
        ));

        pool.close(&first).await.unwrap();
        pool.close(&third).await.unwrap();
        assert_eq!(pool.active().await, None);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn context_limit_returns_session_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"result","subtype":"error","is_error":true,"result":"Prompt is too long"}'
exit 1
"#,
        );
        let id = pool.create("long").await.unwrap().id;
        let outcome = pool.send(&id, "a very long message").await;
        assert!(matches!(outcome, Err(Error::ContextLimit(_))));

        let session = pool.get(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert!(assistant_texts(&session)
            .iter()
            .any(|text| text.contains("Prompt is too long")));
    }

    #[tokio::test]
    async fn process_failure_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(
            dir.path(),
            r#"cat > /dev/null
if [ ! -f attempted ]; then
  touch attempted
  echo 'rate limited' >&2
  exit 2
fi
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"second time lucky"}]}}'
"#,
        );
        let id = pool.create("flaky").await.unwrap().id;

        assert!(matches!(pool.send(&id, "try").await, Err(Error::Process { code: Some(2), .. })));
        let session = pool.get(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.last_error.unwrap().contains("rate limited"));

        pool.send(&id, "try again").await.unwrap();
        let session = pool.get(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert!(session.last_error.is_none());
        assert_eq!(assistant_texts(&session), vec!["second time lucky"]);
    }

    #[tokio::test]
    async fn close_terminates_in_flight_send() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(pool(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'
sleep 30
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"never seen"}]}}'
"#,
        ));
        let id = pool.create("slow").await.unwrap().id;
        let mut events = pool.subscribe();

        let sender = {
            let (pool, id) = (Arc::clone(&pool), id.clone());
            tokio::spawn(async move { pool.send(&id, "go").await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PoolEvent::MessageReceived {
                    message: Message::AssistantText { text, .. },
                    ..
                }) = events.recv().await
                {
                    if text == "working" {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(pool.send(&id, "overlap").await, Err(Error::Busy)));

        pool.close(&id).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), sender)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_err());

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, PoolEvent::MessageReceived { .. }),
                "no messages after close"
            );
        }
    }

    #[tokio::test]
    async fn health_reports_sessions_and_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), HELLO);
        let id = pool.create("probe").await.unwrap().id;
        pool.send(&id, "hello").await.unwrap();

        let report = pool.health().await;
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].invocations, 1);
        assert!(!report.sessions[0].invoking);
        assert!(!report.sessions[0].monitoring);
        assert!(report.diagnostics.contains("created \"probe\""));
        assert!(report.to_string().contains("sessions: 1/5"));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), HELLO);
        pool.create("a").await.unwrap();
        pool.create("b").await.unwrap();
        pool.shutdown().await;
        assert!(pool.is_empty().await);
        assert_eq!(pool.active().await, None);
    }
}
