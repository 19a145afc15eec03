//! Connection session: one physical connection and its lifecycle.
//!
//! A session owns at most one [`Driver`] at a time. While connected it runs a
//! periodic health check that pings the backend and rebuilds the connection
//! when the ping fails. All schema and row state hangs off the session's
//! database registry and is discarded on every disconnect.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::{connector_for, Connector, Driver};
use crate::error::{Error, Result};
use crate::models::{BackendVersion, SessionConfig};
use crate::schema::{validate_identifier, Database, Registry};
use crate::task::Deferred;

/// The active connection and what was learned when it opened.
struct Link {
    driver: Arc<dyn Driver>,
    version: BackendVersion,
    connected_at: DateTime<Utc>,
    health: CancellationToken,
}

pub(crate) struct SessionInner {
    id: Uuid,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    link: RwLock<Option<Link>>,
    databases: Registry<String, Database>,
    last_failure: Mutex<Option<String>>,
    /// Serializes connect, disconnect and reconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

/// A connection session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a disconnected session for `config` on the current tokio runtime.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::config("Session must be created within a tokio runtime"))?;
        let connector = connector_for(&config);
        Ok(Self::with_connector(config, connector, runtime))
    }

    /// Create a disconnected session with an explicit connector and runtime.
    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                config,
                connector,
                runtime,
                link: RwLock::new(None),
                databases: Registry::new("database"),
                last_failure: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Get the session's unique identifier.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Check if a physical connection is open.
    pub fn is_connected(&self) -> bool {
        self.inner.link.read().is_some()
    }

    /// Backend version detected at the last connect.
    pub fn version(&self) -> Option<BackendVersion> {
        self.inner.link.read().as_ref().map(|l| l.version.clone())
    }

    /// When the current connection was established.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.link.read().as_ref().map(|l| l.connected_at)
    }

    /// Message of the last failed reconnect, cleared by the next successful connect.
    pub fn last_failure(&self) -> Option<String> {
        self.inner.last_failure.lock().clone()
    }

    /// Loaded databases.
    pub fn databases(&self) -> Vec<Database> {
        self.inner.databases.values()
    }

    /// Get the loaded database called `name`, or a new unloaded handle.
    pub fn database(&self, name: &str) -> Result<Database> {
        if let Some(database) = self.inner.databases.get(name) {
            return Ok(database);
        }
        validate_identifier(name)?;
        Ok(Database::new(self, name))
    }

    pub(crate) fn register_database(&self, database: &Database) -> Result<()> {
        self.inner.databases.insert(database.name().to_string(), database.clone())
    }

    pub(crate) fn unregister_database(&self, database: &Database) {
        self.inner.databases.remove(database.name(), database);
    }

    /// The open driver, or why there is none.
    pub(crate) fn driver(&self) -> Result<Arc<dyn Driver>> {
        if let Some(link) = self.inner.link.read().as_ref() {
            return Ok(Arc::clone(&link.driver));
        }
        match self.last_failure() {
            Some(failure) => Err(Error::connection(failure)),
            None => Err(Error::state("session is not connected")),
        }
    }

    // ========== Lifecycle ==========

    /// Open the connection, discover databases and start the health check.
    pub fn connect(&self) -> Deferred<()> {
        let this = self.clone();
        Deferred::spawn(&self.inner.runtime, "session.connect", async move {
            let _guard = this.inner.lifecycle.lock().await;
            this.connect_locked().await
        })
    }

    /// Stop every loaded database, then close the connection.
    pub fn disconnect(&self) -> Deferred<()> {
        let this = self.clone();
        Deferred::spawn(&self.inner.runtime, "session.disconnect", async move {
            let _guard = this.inner.lifecycle.lock().await;
            this.disconnect_locked().await
        })
    }

    /// Tear down (if connected) and connect again, each half bounded by the
    /// reconnect timeout.
    pub fn reconnect(&self) -> Deferred<()> {
        let this = self.clone();
        Deferred::spawn(&self.inner.runtime, "session.reconnect", async move {
            this.reconnect_inner().await
        })
    }

    async fn connect_locked(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::state("session is already connected"));
        }

        let options = &self.inner.config.options;
        let timeout = options.connect_timeout();
        tracing::debug!(
            session_id = %self.inner.id,
            url = %self.inner.config.display_url(),
            "Connecting"
        );

        let driver = tokio::time::timeout(timeout, self.inner.connector.connect(&self.inner.config))
            .await
            .map_err(|_| Error::timeout("session.connect", timeout))??;

        let discovered = async {
            let version = driver.version().await?;
            let names = driver.databases().await?;
            Ok::<_, Error>((version, names))
        }
        .await;
        let (version, names) = match discovered {
            Ok(found) => found,
            Err(e) => {
                let _ = driver.close().await;
                return Err(e);
            }
        };

        let health = CancellationToken::new();
        let raced = {
            let mut link = self.inner.link.write();
            if link.is_some() {
                true
            } else {
                *link = Some(Link {
                    driver: Arc::clone(&driver),
                    version: version.clone(),
                    connected_at: Utc::now(),
                    health: health.clone(),
                });
                false
            }
        };
        if raced {
            let _ = driver.close().await;
            return Err(Error::state("session is already connected"));
        }

        self.inner.last_failure.lock().take();
        for name in &names {
            let database = Database::new(self, name);
            database.mark_discovered();
            if let Err(e) = self.register_database(&database) {
                tracing::warn!(session_id = %self.inner.id, database = %name, error = %e, "Skipping discovered database");
            }
        }

        self.inner.runtime.spawn(health_loop(
            self.downgrade(),
            health,
            options.health_check_interval(),
            options.validity_timeout(),
        ));

        tracing::info!(
            session_id = %self.inner.id,
            backend = driver.name(),
            version = %version,
            databases = names.len(),
            "Session connected"
        );
        Ok(())
    }

    async fn disconnect_locked(&self) -> Result<()> {
        let health = match self.inner.link.read().as_ref() {
            Some(link) => link.health.clone(),
            None => return Err(Error::state("session is not connected")),
        };
        health.cancel();

        let mut first_error = None;
        for database in self.inner.databases.values() {
            if !database.is_loaded() {
                continue;
            }
            if let Err(e) = database.stop_inner().await {
                tracing::warn!(
                    session_id = %self.inner.id,
                    database = database.name(),
                    error = %e,
                    "Database did not stop cleanly"
                );
                database.discard();
                first_error.get_or_insert(e);
            }
        }
        for database in self.inner.databases.drain() {
            database.discard();
        }

        let link = self.inner.link.write().take();
        if let Some(link) = link {
            if let Err(e) = link.driver.close().await {
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(session_id = %self.inner.id, "Session disconnected");
        first_error.map_or(Ok(()), Err)
    }

    /// Drop all state and the connection without talking to the backend.
    fn discard(&self) {
        for database in self.inner.databases.drain() {
            database.discard();
        }
        let link = self.inner.link.write().take();
        if let Some(link) = link {
            link.health.cancel();
            let driver = link.driver;
            self.inner.runtime.spawn(async move {
                let _ = driver.close().await;
            });
        }
    }

    async fn reconnect_inner(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let timeout = self.inner.config.options.reconnect_timeout();

        if self.is_connected() {
            match tokio::time::timeout(timeout, self.disconnect_locked()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %self.inner.id, error = %e, "Disconnect failed during reconnect");
                    self.discard();
                }
                Err(_) => {
                    tracing::warn!(session_id = %self.inner.id, ?timeout, "Disconnect timed out during reconnect");
                    self.discard();
                }
            }
        }

        let result = match tokio::time::timeout(timeout, self.connect_locked()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("session.reconnect", timeout)),
        };
        if let Err(e) = &result {
            tracing::error!(session_id = %self.inner.id, error = %e, "Reconnect failed");
            *self.inner.last_failure.lock() = Some(format!("reconnect failed: {e}"));
        }
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("url", &self.inner.config.display_url())
            .field("connected", &self.is_connected())
            .field("databases", &self.inner.databases.len())
            .finish()
    }
}

/// Periodic liveness check. Ends after triggering a reconnect; a successful
/// reconnect starts a fresh loop.
fn health_loop(
    weak: Weak<SessionInner>,
    token: CancellationToken,
    interval: Duration,
    validity_timeout: Duration,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = weak.upgrade() else { break };
            let session = Session::from_inner(inner);
            let Ok(driver) = session.driver() else { break };

            if driver.is_valid(validity_timeout).await {
                tracing::trace!(session_id = %session.id(), "Health check passed");
                continue;
            }
            if token.is_cancelled() {
                break;
            }

            tracing::warn!(session_id = %session.id(), "Health check failed, reconnecting");
            drop(driver);
            if session.reconnect_inner().await.is_ok() {
                tracing::info!(session_id = %session.id(), "Reconnected after failed health check");
            }
            break;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::driver::faults::{Faults, FaultyConnector};
    use crate::models::SessionOptions;

    fn memory_session() -> Session {
        Session::new(SessionConfig::sqlite_in_memory()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let session = memory_session();
        assert!(!session.is_connected());
        assert!(session.driver().err().unwrap().is_state());

        session.connect().await.unwrap();
        assert!(session.is_connected());
        assert!(session.connected_at().is_some());
        assert_eq!(session.version().unwrap().product, "SQLite");

        let again = session.connect().await.unwrap_err();
        assert!(again.is_state());

        session.disconnect().await.unwrap();
        assert!(!session.is_connected());
        assert!(session.disconnect().await.unwrap_err().is_state());
    }

    #[tokio::test]
    async fn test_reconnect_discards_state() {
        let session = memory_session();
        session.connect().await.unwrap();

        let db = session.database("scratch").unwrap();
        db.start().await.unwrap();
        assert_eq!(session.databases().len(), 1);

        session.reconnect().await.unwrap();
        assert!(session.is_connected());
        assert!(!db.is_loaded());
        // In-memory databases do not survive the old connection.
        assert!(session.databases().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_when_disconnected_connects() {
        let session = memory_session();
        session.reconnect().await.unwrap();
        assert!(session.is_connected());
        assert!(session.last_failure().is_none());
    }

    #[tokio::test]
    async fn test_database_names_are_validated() {
        let session = memory_session();
        assert!(session.database("bad name").is_err());
        assert!(session.database("good_name").is_ok());
    }

    #[test]
    fn test_new_requires_runtime() {
        let err = Session::new(SessionConfig::sqlite_in_memory()).unwrap_err();
        assert_eq!(err.category(), "Config");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SessionConfig::sqlite_in_memory().with_options(SessionOptions {
            validity_timeout_secs: 0,
            ..SessionOptions::default()
        });
        assert!(Session::new(config).is_err());
    }

    fn flaky_session() -> (Session, Arc<Faults>) {
        let (connector, faults) = FaultyConnector::new();
        let config = SessionConfig::sqlite_in_memory().with_options(SessionOptions {
            health_check_interval_secs: 1,
            validity_timeout_secs: 1,
            reconnect_timeout_secs: 2,
            ..SessionOptions::default()
        });
        (Session::with_connector(config, connector, Handle::current()), faults)
    }

    /// Poll `check` for up to five seconds.
    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_failed_ping_triggers_reconnect() {
        let (session, faults) = flaky_session();
        session.connect().await.unwrap();
        let db = session.database("scratch").unwrap();
        db.start().await.unwrap();
        let first = session.connected_at().unwrap();
        assert_eq!(faults.connects(), 1);

        faults.healthy.store(false, Ordering::SeqCst);
        assert!(eventually(|| faults.connects() >= 2).await);
        faults.healthy.store(true, Ordering::SeqCst);

        assert!(eventually(|| session.is_connected()).await);
        assert!(session.connected_at().unwrap() > first);
        assert!(!db.is_loaded());
        assert!(session.last_failure().is_none());
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_surfaced() {
        let (session, faults) = flaky_session();
        session.connect().await.unwrap();

        faults.refuse_connect.store(true, Ordering::SeqCst);
        faults.healthy.store(false, Ordering::SeqCst);
        assert!(eventually(|| session.last_failure().is_some()).await);

        assert!(!session.is_connected());
        assert!(session.last_failure().unwrap().starts_with("reconnect failed"));
        let err = session.driver().err().unwrap();
        assert_eq!(err.category(), "Connection");

        let db = session.database("scratch").unwrap();
        assert_eq!(db.start().await.unwrap_err().category(), "Connection");

        // One reconnect attempt only; the health check does not keep retrying.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(faults.connects(), 2);

        faults.refuse_connect.store(false, Ordering::SeqCst);
        faults.healthy.store(true, Ordering::SeqCst);
        session.connect().await.unwrap();
        assert!(session.last_failure().is_none());
        assert!(session.driver().is_ok());
    }

    #[tokio::test]
    async fn test_explicit_reconnect_failure_leaves_session_disconnected() {
        let (session, faults) = flaky_session();
        session.connect().await.unwrap();

        faults.refuse_connect.store(true, Ordering::SeqCst);
        let err = session.reconnect().await.unwrap_err();
        assert_eq!(err.category(), "Connection");
        assert!(!session.is_connected());
        assert!(session.last_failure().is_some());
    }
}
