use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use rewind_agent_connection::{AgentConnection, AgentConnector, ConnectOptions};
use rewind_agent_error::SessionError;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::interrupt::{InterruptChannel, InterruptOwner, InterruptSignal};
use crate::relay::connection_error;
use crate::session::{SessionBinding, SessionState};

/// Maps agent session ids to live connections for the lifetime of the
/// process.
///
/// At most one connection is registered per id. Creation for a given id runs
/// under that id's creation lock, so racing requests for the same id share
/// one connection, while other ids proceed independently. Turns on one
/// session are serialised by the session's state lock, which a
/// [`SessionLease`] holds.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    connector: Arc<dyn AgentConnector>,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Debug)]
struct SessionEntry {
    connection: Arc<dyn AgentConnection>,
    state: Arc<Mutex<SessionState>>,
    interrupt: StdMutex<Option<InterruptSignal>>,
    turns: AtomicUsize,
    created_at_ms: i64,
}

impl SessionEntry {
    fn new(connection: Arc<dyn AgentConnection>, state: SessionState) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state: Arc::new(Mutex::new(state)),
            interrupt: StdMutex::new(None),
            turns: AtomicUsize::new(0),
            created_at_ms: now_ms(),
        })
    }

    fn interrupt_slot(&self) -> std::sync::MutexGuard<'_, Option<InterruptSignal>> {
        self.interrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub turns: usize,
    pub busy: bool,
    pub created_at_ms: i64,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                sessions: RwLock::new(HashMap::new()),
                creation_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connection and exclusive turn slot for a request.
    ///
    /// With a session id the registered connection is reused, or created by
    /// resuming that session. Without one a fresh connection is opened; it is
    /// registered once its `init` event reports an id (see
    /// [`SessionLease::publish`]).
    pub async fn acquire(
        &self,
        last_session_id: Option<&str>,
    ) -> Result<SessionLease, SessionError> {
        let (entry, published) = match last_session_id {
            Some(session_id) => (
                self.get_or_create(session_id).await?,
                Some(session_id.to_string()),
            ),
            None => {
                let connection = self
                    .inner
                    .connector
                    .connect(ConnectOptions::new_session())
                    .await
                    .map_err(connection_error)?;
                tracing::info!("registry: opened connection for new session");
                (SessionEntry::new(connection, SessionState::new()), None)
            }
        };

        let state = entry.state.clone().lock_owned().await;
        Ok(SessionLease {
            registry: self.inner.clone(),
            entry,
            state,
            published,
            duplicate: false,
            released: false,
        })
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(session_id, entry)| SessionInfo {
                session_id: session_id.clone(),
                turns: entry.turns.load(Ordering::SeqCst),
                busy: entry.state.try_lock().is_err(),
                created_at_ms: entry.created_at_ms,
            })
            .collect::<Vec<_>>();
        infos.sort_by(|left, right| left.session_id.cmp(&right.session_id));
        infos
    }

    /// Trips the interrupt channel of the session's running turn.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        let entry = self.get(session_id).await?;
        let signal = entry.interrupt_slot().clone();
        match signal {
            Some(signal) if signal.trip() => {
                tracing::info!(session_id, "registry: interrupt requested");
                Ok(())
            }
            _ => Err(SessionError::Conflict {
                message: format!("session '{session_id}' has no turn in progress"),
            }),
        }
    }

    pub async fn shutdown(&self) {
        let entries = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().collect::<Vec<_>>()
        };
        for (session_id, entry) in entries {
            if let Some(signal) = entry.interrupt_slot().take() {
                signal.trip();
            }
            entry.connection.close().await;
            tracing::info!(session_id = %session_id, "registry: connection closed");
        }
    }

    async fn get(&self, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn get_or_create(&self, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        if let Some(existing) = self.inner.sessions.read().await.get(session_id).cloned() {
            return Ok(existing);
        }

        let lock = self.inner.creation_lock(session_id).await;
        let created = {
            let _guard = lock.lock().await;
            self.create_locked(session_id).await
        };
        self.inner.forget_creation_lock(session_id, lock).await;
        created
    }

    /// Connects a resumed session. Caller holds the id's creation lock.
    async fn create_locked(&self, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        if let Some(existing) = self.inner.sessions.read().await.get(session_id).cloned() {
            return Ok(existing);
        }

        let start = std::time::Instant::now();
        let connection = self
            .inner
            .connector
            .connect(ConnectOptions::resume(session_id))
            .await
            .map_err(connection_error)?;
        let entry = SessionEntry::new(connection, SessionState::resumed(session_id));
        self.inner
            .sessions
            .write()
            .await
            .insert(session_id.to_string(), entry.clone());
        tracing::info!(
            session_id,
            connect_ms = start.elapsed().as_millis() as u64,
            "registry: resumed session"
        );
        Ok(entry)
    }
}

impl RegistryInner {
    async fn creation_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the id's creation lock once no other request is waiting on it.
    /// Clones are only handed out under the map lock, so the count is stable
    /// while it is held.
    async fn forget_creation_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.creation_locks.lock().await;
        let idle = locks
            .get(session_id)
            .is_some_and(|stored| Arc::ptr_eq(stored, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    async fn creation_lock_count(&self) -> usize {
        self.creation_locks.lock().await.len()
    }
}

/// Exclusive use of one session's connection for a single turn.
///
/// Release it with [`SessionLease::release`]. A lease whose connection never
/// got registered (no id reported, or another connection won the id) closes
/// that connection on release.
#[derive(Debug)]
pub struct SessionLease {
    registry: Arc<RegistryInner>,
    entry: Arc<SessionEntry>,
    state: OwnedMutexGuard<SessionState>,
    published: Option<String>,
    duplicate: bool,
    released: bool,
}

impl SessionLease {
    pub fn connection(&self) -> Arc<dyn AgentConnection> {
        self.entry.connection.clone()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.published.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.published.is_some() && !self.duplicate
    }

    /// Arms an interrupt channel reachable through
    /// [`SessionRegistry::interrupt`] while this lease's turn runs.
    pub fn arm_interrupt(&self) -> InterruptOwner {
        let (owner, signal) = InterruptChannel::arm();
        *self.entry.interrupt_slot() = Some(signal);
        owner
    }

    /// Registers this lease's connection under the id its agent reported.
    /// The first connection to claim an id keeps it; a later one is marked
    /// duplicate and closed when released.
    pub async fn publish(&mut self, session_id: &str) -> Result<(), SessionError> {
        if self.published.is_some() {
            return Ok(());
        }

        let lock = self.registry.creation_lock(session_id).await;
        {
            let _guard = lock.lock().await;
            let mut sessions = self.registry.sessions.write().await;
            if sessions.contains_key(session_id) {
                tracing::warn!(
                    session_id,
                    "registry: session already has a connection, duplicate will be closed"
                );
                self.duplicate = true;
            } else {
                sessions.insert(session_id.to_string(), self.entry.clone());
                tracing::info!(session_id, "registry: session published");
            }
        }
        self.registry.forget_creation_lock(session_id, lock).await;
        self.published = Some(session_id.to_string());
        Ok(())
    }

    pub async fn release(mut self) {
        if let Some(connection) = self.finish() {
            connection.close().await;
            tracing::info!(
                session_id = ?self.published,
                "registry: closed unregistered connection"
            );
        }
    }

    /// Ends the turn. Returns the connection when it must be closed.
    fn finish(&mut self) -> Option<Arc<dyn AgentConnection>> {
        if std::mem::replace(&mut self.released, true) {
            return None;
        }
        self.entry
            .turns
            .store(self.state.history.len(), Ordering::SeqCst);
        self.entry.interrupt_slot().take();
        (!self.is_registered()).then(|| self.entry.connection.clone())
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(connection) = self.finish() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { connection.close().await });
            }
        }
    }
}

impl SessionBinding for SessionLease {
    fn state(&mut self) -> &mut SessionState {
        &mut self.state
    }

    fn bind_session_id<'a>(
        &'a mut self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        async move {
            if self.state.observe_session_id(session_id)? {
                self.publish(session_id).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_agent_connection::mock::MockConnector;
    use std::time::Duration;

    fn registry(connector: &MockConnector) -> SessionRegistry {
        SessionRegistry::new(Arc::new(connector.clone()))
    }

    #[tokio::test]
    async fn concurrent_requests_for_known_id_share_one_connection() {
        let connector = MockConnector::echo().with_connect_delay(Duration::from_millis(30));
        let registry = registry(&connector);

        let tasks = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let lease = registry.acquire(Some("sess-1")).await.expect("acquire");
                    lease.release().await;
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.expect("join");
        }

        let connects = connector.log().connects();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].resume.as_deref(), Some("sess-1"));
        assert_eq!(connector.log().close_count(), 0);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_always_gets_a_fresh_connection() {
        let connector = MockConnector::echo();
        let registry = registry(&connector);

        let first = registry.acquire(None).await.expect("first");
        let second = registry.acquire(None).await.expect("second");

        assert!(!Arc::ptr_eq(&first.entry, &second.entry));
        assert_eq!(connector.log().connects().len(), 2);
        first.release().await;
        second.release().await;
        // Never published, so both are closed and nothing is registered.
        assert_eq!(connector.log().close_count(), 2);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn first_publisher_keeps_the_id() {
        let connector = MockConnector::echo();
        let registry = registry(&connector);
        let mut first = registry.acquire(None).await.expect("first");
        let mut second = registry.acquire(None).await.expect("second");

        first.bind_session_id("shared").await.expect("bind");
        second.bind_session_id("shared").await.expect("bind");

        assert!(first.is_registered());
        assert!(!second.is_registered());
        second.release().await;
        first.release().await;

        assert_eq!(connector.log().close_count(), 1);
        let sessions = registry.list().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "shared");
    }

    #[tokio::test]
    async fn published_session_is_reused_by_id() {
        let connector = MockConnector::echo();
        let registry = registry(&connector);
        let mut lease = registry.acquire(None).await.expect("acquire");
        lease.bind_session_id("sess-7").await.expect("bind");
        lease.state().history.record("u0", "a0", "hi");
        let connection = lease.connection();
        lease.release().await;

        let again = registry.acquire(Some("sess-7")).await.expect("reuse");
        assert!(Arc::ptr_eq(&again.connection(), &connection));
        assert_eq!(connector.log().connects().len(), 1);
        assert_eq!(registry.list().await[0].turns, 1);
        again.release().await;
    }

    #[tokio::test]
    async fn connect_failure_is_connection_unavailable() {
        let connector = MockConnector::echo().failing("no agent");
        let registry = registry(&connector);

        let err = registry.acquire(Some("sess-1")).await.expect_err("fails");
        assert!(matches!(err, SessionError::ConnectionUnavailable { .. }));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn creation_locks_do_not_outlive_their_requests() {
        let failing = MockConnector::echo().failing("no agent");
        let failing_registry = registry(&failing);
        for index in 0..5 {
            let session_id = format!("missing-{index}");
            assert!(failing_registry.acquire(Some(&session_id)).await.is_err());
        }
        assert_eq!(failing_registry.inner.creation_lock_count().await, 0);

        let connector = MockConnector::echo().with_connect_delay(Duration::from_millis(20));
        let registry = registry(&connector);
        let tasks = (0..3)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.acquire(Some("sess-1")).await.expect("acquire").release().await;
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.expect("join");
        }
        let mut lease = registry.acquire(None).await.expect("fresh");
        lease.bind_session_id("sess-2").await.expect("bind");
        lease.release().await;

        assert_eq!(registry.inner.creation_lock_count().await, 0);
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn slow_connects_for_different_ids_run_in_parallel() {
        let delay = Duration::from_millis(300);
        let connector = MockConnector::echo().with_connect_delay(delay);
        let registry = registry(&connector);

        let start = std::time::Instant::now();
        let (a, b) = tokio::join!(registry.acquire(Some("a")), registry.acquire(Some("b")));
        let elapsed = start.elapsed();

        assert!(elapsed < delay * 2 - Duration::from_millis(50), "took {elapsed:?}");
        a.expect("a").release().await;
        b.expect("b").release().await;
        assert_eq!(connector.log().connects().len(), 2);
    }

    #[tokio::test]
    async fn fresh_session_does_not_wait_behind_a_resume() {
        let delay = Duration::from_millis(300);
        let connector = MockConnector::echo().with_connect_delay(delay);
        let registry = registry(&connector);

        let start = std::time::Instant::now();
        let (resumed, fresh) = tokio::join!(registry.acquire(Some("a")), registry.acquire(None));
        let elapsed = start.elapsed();

        assert!(elapsed < delay * 2 - Duration::from_millis(50), "took {elapsed:?}");
        resumed.expect("resumed").release().await;
        fresh.expect("fresh").release().await;
    }

    #[tokio::test]
    async fn busy_session_does_not_block_another_session() {
        let connector = MockConnector::echo();
        let registry = registry(&connector);
        let held = registry.acquire(Some("a")).await.expect("a");

        let other = tokio::time::timeout(Duration::from_secs(1), registry.acquire(Some("b")))
            .await
            .expect("b is not queued behind a")
            .expect("b");

        let queued = tokio::time::timeout(Duration::from_millis(50), registry.acquire(Some("a"))).await;
        assert!(queued.is_err(), "second turn on a waits for the first");

        other.release().await;
        held.release().await;
    }

    #[tokio::test]
    async fn interrupt_requires_a_running_turn() {
        let connector = MockConnector::echo();
        let registry = registry(&connector);

        assert!(matches!(
            registry.interrupt("nope").await,
            Err(SessionError::SessionNotFound { .. })
        ));

        let lease = registry.acquire(Some("sess-1")).await.expect("acquire");
        assert!(matches!(
            registry.interrupt("sess-1").await,
            Err(SessionError::Conflict { .. })
        ));

        let owner = lease.arm_interrupt();
        registry.interrupt("sess-1").await.expect("interrupt");
        assert!(owner.is_tripped());
        assert!(registry.interrupt("sess-1").await.is_err());
        lease.release().await;
    }

    #[tokio::test]
    async fn shutdown_closes_registered_connections() {
        let connector = MockConnector::echo();
        let registry = registry(&connector);
        registry
            .acquire(Some("a"))
            .await
            .expect("a")
            .release()
            .await;
        registry
            .acquire(Some("b"))
            .await
            .expect("b")
            .release()
            .await;

        registry.shutdown().await;
        assert_eq!(connector.log().close_count(), 2);
        assert!(registry.list().await.is_empty());
    }
}
