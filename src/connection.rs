//! Process-wide warehouse connection with a bounded reconnect.
//!
//! The session is held behind a `tokio::sync::Mutex` and replaced wholesale
//! when it goes stale. Every statement goes through the same explicit
//! sequence:
//!
//! 1. ensure a session exists (first connect is not a reconnect)
//! 2. probe liveness, reconnect if the probe fails
//! 3. execute; on a stale failure with budget left, reconnect and retry once
//!
//! At most [`MAX_RECONNECTS`] reconnects happen per statement.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DashboardError, Result};
use crate::warehouse::{ResultSet, SessionFactory, SqlSession, Statement};

/// Reconnect budget for a single statement.
pub const MAX_RECONNECTS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

pub struct ConnectionManager {
    factory: Arc<dyn SessionFactory>,
    session: Mutex<Option<Arc<dyn SqlSession>>>,
    state: AtomicU8,
    reconnects: AtomicUsize,
}

impl ConnectionManager {
    /// Lazy manager: the first statement opens the session.
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            session: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// Connect eagerly. Bad credentials fail here, at startup.
    pub async fn init(factory: Arc<dyn SessionFactory>) -> Result<Self> {
        let manager = Self::new(factory);
        {
            let mut slot = manager.session.lock().await;
            manager.open(&mut slot).await?;
        }
        Ok(manager)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Total reconnects performed over the manager's lifetime.
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn describe(&self) -> String {
        self.factory.describe()
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(state.as_u8(), Ordering::SeqCst));
        if prev != state {
            debug!("Warehouse connection {} → {}", prev, state);
        }
    }

    /// Drop whatever is in the slot and build a brand-new session.
    async fn open(&self, slot: &mut Option<Arc<dyn SqlSession>>) -> Result<Arc<dyn SqlSession>> {
        *slot = None;
        self.set_state(ConnectionState::Connecting);
        match self.factory.connect().await {
            Ok(session) => {
                *slot = Some(Arc::clone(&session));
                self.set_state(ConnectionState::Connected);
                Ok(session)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn reconnect(&self, slot: &mut Option<Arc<dyn SqlSession>>) -> Result<Arc<dyn SqlSession>> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!("Reconnecting to {}", self.factory.describe());
        self.open(slot).await
    }

    pub async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        let mut slot = self.session.lock().await;
        let mut reconnects = 0;

        let mut session = match slot.as_ref() {
            Some(s) => Arc::clone(s),
            None => self.open(&mut slot).await?,
        };

        if !session.is_alive().await {
            warn!("Warehouse session is stale, rebuilding");
            self.set_state(ConnectionState::Disconnected);
            reconnects += 1;
            session = self.reconnect(&mut slot).await.map_err(exhausted)?;
        }

        match session.execute(statement).await {
            Ok(rs) => Ok(rs),
            Err(e) if e.is_stale_connection() && reconnects < MAX_RECONNECTS => {
                warn!("Statement failed on a stale session ({}), reconnecting once", e);
                self.set_state(ConnectionState::Disconnected);
                session = self.reconnect(&mut slot).await.map_err(exhausted)?;
                session.execute(statement).await.map_err(exhausted)
            }
            Err(e) if reconnects > 0 => Err(exhausted(e)),
            Err(e) => Err(e),
        }
    }
}

/// Failure after the reconnect budget is spent. Permission errors pass through.
fn exhausted(e: DashboardError) -> DashboardError {
    match e {
        DashboardError::Permission(_) | DashboardError::Query(_) => e,
        other => DashboardError::Query(format!("failed after {} reconnect attempt(s): {}", MAX_RECONNECTS, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FlakySession {
        alive: AtomicBool,
        fail_with: Option<fn() -> DashboardError>,
    }

    #[async_trait]
    impl SqlSession for FlakySession {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn execute(&self, _statement: &Statement) -> Result<ResultSet> {
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(ResultSet::new(vec!["one".into()], vec![vec![Some("1".into())]])),
            }
        }
    }

    /// Hands out sessions in order; the last one repeats.
    struct ScriptedFactory {
        sessions: Vec<(bool, Option<fn() -> DashboardError>)>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn connect(&self) -> Result<Arc<dyn SqlSession>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let (alive, fail_with) = self.sessions[n.min(self.sessions.len() - 1)];
            Ok(Arc::new(FlakySession { alive: AtomicBool::new(alive), fail_with }))
        }
    }

    fn factory(sessions: Vec<(bool, Option<fn() -> DashboardError>)>) -> Arc<ScriptedFactory> {
        Arc::new(ScriptedFactory { sessions, connects: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn healthy_session_is_reused() {
        let f = factory(vec![(true, None)]);
        let mgr = ConnectionManager::init(f.clone()).await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Connected);
        mgr.execute(&Statement::new("SELECT 1")).await.unwrap();
        mgr.execute(&Statement::new("SELECT 1")).await.unwrap();
        assert_eq!(f.connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn dead_session_reconnects_exactly_once() {
        let f = factory(vec![(false, None), (true, None)]);
        let mgr = ConnectionManager::init(f.clone()).await.unwrap();
        let rs = mgr.execute(&Statement::new("SELECT 1")).await.unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(mgr.reconnect_count(), 1);
        assert_eq!(f.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_becomes_query_error() {
        let conn_err: fn() -> DashboardError = || DashboardError::Connection("reset".into());
        let f = factory(vec![(false, Some(conn_err))]);
        let mgr = ConnectionManager::init(f.clone()).await.unwrap();
        let err = mgr.execute(&Statement::new("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, DashboardError::Query(_)));
        assert_eq!(mgr.reconnect_count(), MAX_RECONNECTS);
    }

    #[tokio::test]
    async fn permission_is_never_retried() {
        let denied: fn() -> DashboardError = || DashboardError::Permission("no grant".into());
        let f = factory(vec![(true, Some(denied))]);
        let mgr = ConnectionManager::init(f.clone()).await.unwrap();
        let err = mgr.execute(&Statement::new("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, DashboardError::Permission(_)));
        assert_eq!(mgr.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn lazy_manager_starts_disconnected() {
        let f = factory(vec![(true, None)]);
        let mgr = ConnectionManager::new(f.clone());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        mgr.execute(&Statement::new("SELECT 1")).await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.reconnect_count(), 0);
    }
}
