//! Cache of outbound connections, one per address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

use crate::Dialer;
use crate::config::HttpClientConfig;
use crate::http_client::ProxyClient;

/// Error returned by [`ConnectionManager::get_connection`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The dialer refused to create a connection. Nothing was cached.
    #[error("failed to create connection to {0}: {1}")]
    ConnectionFailed(String, #[source] Box<dyn std::error::Error + Send + Sync>),
    /// [`ConnectionManager::close`] has been called.
    #[error("connection manager is closed")]
    Closed,
}

/// Keeps one connection per address, plus the shared proxy client.
///
/// Lookups of an already cached address only take a shared lock. Creation
/// is serialized by a separate lock and re-checks the cache once it holds
/// it, so concurrent first use of an address dials once.
pub struct ConnectionManager<D: Dialer> {
    dialer: D,
    pool: RwLock<HashMap<String, D::Connection>>,
    create: Mutex<()>,
    closed: AtomicBool,
    http: ProxyClient,
}

impl<D: Dialer> ConnectionManager<D> {
    /// Create an empty manager. The proxy client is built immediately.
    pub fn new(dialer: D, http: HttpClientConfig) -> Self {
        Self {
            dialer,
            pool: RwLock::new(HashMap::new()),
            create: Mutex::new(()),
            closed: AtomicBool::new(false),
            http: ProxyClient::new(http),
        }
    }

    fn cached(&self, address: &str) -> Option<D::Connection> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// Return the cached connection for `address`, dialing one if there is
    /// none. With `recreate_if_exists` a new connection is always dialed and
    /// replaces the cached one.
    pub fn get_connection(
        &self,
        address: &str,
        recreate_if_exists: bool,
    ) -> Result<D::Connection, ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        if !recreate_if_exists {
            if let Some(conn) = self.cached(address) {
                return Ok(conn);
            }
        }

        let _creating = self.create.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        if !recreate_if_exists {
            if let Some(conn) = self.cached(address) {
                return Ok(conn);
            }
        }

        let conn = self.dialer.dial(address).map_err(|e| {
            log::error!("{}: failed to create connection: {}", address, e);
            ConnectionError::ConnectionFailed(address.to_owned(), Box::new(e))
        })?;
        log::debug!("{}: connection created", address);
        #[cfg(feature = "metrics")]
        crate::metrics::connection_dialed();

        let old = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_owned(), conn.clone());
        if let Some(old) = old {
            if let Err(e) = self.dialer.close(address, old) {
                log::warn!("{}: failed to close replaced connection: {}", address, e);
            }
        }
        Ok(conn)
    }

    /// The shared client for proxying service requests.
    pub fn http_client(&self) -> &ProxyClient {
        &self.http
    }

    /// Number of cached connections.
    pub fn connection_count(&self) -> usize {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Close every cached connection and refuse further lookups. Failures
    /// are logged and do not stop the remaining connections from closing.
    ///
    /// Calls already holding a connection keep it; whatever happens to them
    /// surfaces as an ordinary call failure.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _creating = self.create.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = std::mem::take(&mut *self.pool.write().unwrap_or_else(PoisonError::into_inner));
        for (address, conn) in pool {
            if let Err(e) = self.dialer.close(&address, conn) {
                log::warn!("{}: failed to close connection: {}", address, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;
    use crate::testutil::MockDialer;

    fn manager() -> (ConnectionManager<MockDialer>, MockDialer) {
        let dialer = MockDialer::default();
        (
            ConnectionManager::new(dialer.clone(), HttpClientConfig::default()),
            dialer,
        )
    }

    #[tokio::test]
    async fn caches_per_address() {
        let (m, dialer) = manager();
        let a = m.get_connection("a:1", false).unwrap();
        let a2 = m.get_connection("a:1", false).unwrap();
        let b = m.get_connection("b:1", false).unwrap();
        assert_eq!(a.id, a2.id);
        assert_ne!(a.id, b.id);
        assert_eq!(b.address, "b:1");
        assert_eq!(dialer.dials(), vec!["a:1", "b:1"]);
        assert_eq!(m.connection_count(), 2);
    }

    #[tokio::test]
    async fn recreate_replaces_entry() {
        let (m, dialer) = manager();
        let first = m.get_connection("a:1", false).unwrap();
        let second = m.get_connection("a:1", true).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(dialer.closed(), vec!["a:1"]);
        assert_eq!(m.get_connection("a:1", false).unwrap().id, second.id);
        assert_eq!(dialer.dials().len(), 2);
        assert_eq!(m.connection_count(), 1);
    }

    #[tokio::test]
    async fn dial_failures_are_not_cached() {
        let (m, dialer) = manager();
        dialer.fail_dial("down:1");
        assert_matches!(
            m.get_connection("down:1", false),
            Err(ConnectionError::ConnectionFailed(a, _)) if a == "down:1"
        );
        assert_matches!(
            m.get_connection("down:1", false),
            Err(ConnectionError::ConnectionFailed(..))
        );
        assert_eq!(dialer.dials().len(), 2);
        assert_eq!(m.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_first_use_dials_once() {
        const THREADS: usize = 16;
        let (m, dialer) = manager();
        dialer.set_dial_delay(Duration::from_millis(20));
        let barrier = Barrier::new(THREADS);
        let ids = std::thread::scope(|s| {
            let handles = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        m.get_connection("a:1", false).unwrap().id
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(dialer.dials(), vec!["a:1"]);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[tokio::test]
    async fn close_is_best_effort() {
        testing_logger::setup();
        let (m, dialer) = manager();
        dialer.fail_close("a:1");
        m.get_connection("a:1", false).unwrap();
        m.get_connection("b:1", false).unwrap();
        m.close();
        let mut closed = dialer.closed();
        closed.sort();
        assert_eq!(closed, vec!["a:1", "b:1"]);
        assert_eq!(m.connection_count(), 0);
        assert_matches!(m.get_connection("a:1", false), Err(ConnectionError::Closed));
        assert_matches!(m.get_connection("c:1", true), Err(ConnectionError::Closed));
        testing_logger::validate(|captured_logs| {
            assert!(captured_logs.iter().any(|l| l.level == log::Level::Warn
                && l.body.contains("a:1")
                && l.body.contains("failed to close")));
            assert!(!captured_logs.iter().any(|l| l.level == log::Level::Warn
                && l.body.contains("b:1")));
        });
    }
}
