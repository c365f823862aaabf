//! Session and connection pool
//!
//! One authenticated session is kept per managed host, keyed by the host's
//! durable identity. Sessions are created lazily and re-established when the
//! remote side reports them invalid. Credentials live in a short queue so a
//! password rotation never pulls the old secret out from under an in-flight
//! operation.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SessionSettings;
use crate::error::SESSION_AUTHENTICATION_FAILED;
use crate::mgmt::{ManagementApi, OpaqueRef, SessionRef};
use crate::{Error, Result};

/// Durable key for a managed host: UUID, pool and management address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    pub uuid: String,
    pub pool_uuid: Option<String>,
    pub address: String,
}

impl HostIdentity {
    pub fn new(uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            pool_uuid: None,
            address: address.into(),
        }
    }

    pub fn with_pool(mut self, pool_uuid: impl Into<String>) -> Self {
        self.pool_uuid = Some(pool_uuid.into());
        self
    }

    /// Resolve this host to a reference valid for the current session.
    pub fn resolve(&self, conn: &Connection) -> Result<OpaqueRef> {
        conn.call("host.get_by_uuid", |api, s| api.host_get_by_uuid(s, &self.uuid))
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uuid, self.address)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens a management endpoint for a host address.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn ManagementApi>>;
}

/// A live endpoint plus the session used to talk to it.
pub struct Connection {
    identity: HostIdentity,
    api: Arc<dyn ManagementApi>,
    session: RwLock<Option<SessionRef>>,
    credentials: Arc<RwLock<VecDeque<Credentials>>>,
    max_reauth: u32,
}

impl Connection {
    fn new(
        identity: HostIdentity,
        api: Arc<dyn ManagementApi>,
        credentials: Arc<RwLock<VecDeque<Credentials>>>,
        max_reauth: u32,
    ) -> Self {
        Self {
            identity,
            api,
            session: RwLock::new(None),
            credentials,
            max_reauth,
        }
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Run one API call inside a valid session.
    ///
    /// An expired session or a transport failure triggers a fresh login and a
    /// retry, at most `max_reauth_attempts` times.
    pub fn call<T>(
        &self,
        name: &str,
        f: impl Fn(&dyn ManagementApi, &SessionRef) -> Result<T>,
    ) -> Result<T> {
        let mut attempts = 0;
        loop {
            let session = self.session()?;
            match f(self.api.as_ref(), &session) {
                Err(e) if Self::needs_reauth(&e) && attempts < self.max_reauth => {
                    attempts += 1;
                    tracing::warn!(
                        host = %self.identity,
                        call = name,
                        attempt = attempts,
                        error = %e,
                        "Session lost, re-authenticating"
                    );
                    self.invalidate(&session);
                }
                other => return other,
            }
        }
    }

    fn needs_reauth(err: &Error) -> bool {
        err.is_session_invalid() || matches!(err, Error::Transport(_))
    }

    fn session(&self) -> Result<SessionRef> {
        if let Some(session) = self.session.read().clone() {
            return Ok(session);
        }
        let mut slot = self.session.write();
        if let Some(session) = slot.clone() {
            return Ok(session);
        }
        let session = self.login()?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session unless another thread already replaced it.
    fn invalidate(&self, stale: &SessionRef) {
        let mut slot = self.session.write();
        if slot.as_ref() == Some(stale) {
            *slot = None;
        }
    }

    /// Try each known credential, newest first.
    fn login(&self) -> Result<SessionRef> {
        let candidates: Vec<Credentials> = self.credentials.read().iter().rev().cloned().collect();
        if candidates.is_empty() {
            return Err(Error::Config("no credentials configured".into()));
        }
        for creds in candidates {
            match self.api.login(&creds.username, &creds.password) {
                Ok(session) => {
                    tracing::info!(host = %self.identity, user = %creds.username, "Logged in");
                    return Ok(session);
                }
                Err(e) if e.code() == Some(SESSION_AUTHENTICATION_FAILED) => {
                    tracing::warn!(host = %self.identity, user = %creds.username, "Credential rejected");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::AuthenticationFailed {
            host: self.identity.address.clone(),
        })
    }

    pub fn logout(&self) -> Result<()> {
        let session = self.session.write().take();
        match session {
            Some(session) => self.api.logout(&session),
            None => Ok(()),
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }
}

/// Memoized connections keyed by host identity.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<HostIdentity, Arc<Connection>>>,
    credentials: Arc<RwLock<VecDeque<Credentials>>>,
    settings: SessionSettings,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, credentials: Credentials, settings: SessionSettings) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(credentials);
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
            credentials: Arc::new(RwLock::new(queue)),
            settings,
        }
    }

    pub fn get_connection(&self, identity: &HostIdentity) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connections.read().get(identity) {
            return Ok(conn.clone());
        }
        let mut connections = self.connections.write();
        if let Some(conn) = connections.get(identity) {
            return Ok(conn.clone());
        }
        let api = self.connector.connect(&identity.address)?;
        let conn = Arc::new(Connection::new(
            identity.clone(),
            api,
            self.credentials.clone(),
            self.settings.max_reauth_attempts,
        ));
        tracing::debug!(host = %identity, "Opened connection");
        connections.insert(identity.clone(), conn.clone());
        Ok(conn)
    }

    /// Append a new credential. Older entries beyond the history bound are dropped.
    pub fn rotate_password(&self, username: &str, password: &str) {
        let mut queue = self.credentials.write();
        queue.push_back(Credentials::new(username, password));
        while queue.len() > self.settings.credential_history.max(1) {
            queue.pop_front();
        }
        tracing::info!(user = %username, kept = queue.len(), "Credential rotated");
    }

    /// Log out and forget the connection for `identity`.
    pub fn disconnect(&self, identity: &HostIdentity) -> Result<()> {
        let removed = self.connections.write().remove(identity);
        match removed {
            Some(conn) => conn.logout(),
            None => Ok(()),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SESSION_INVALID;
    use crate::mgmt::MockManagementApi;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedConnector {
        api: Arc<dyn ManagementApi>,
        connects: AtomicUsize,
    }

    impl Connector for FixedConnector {
        fn connect(&self, _address: &str) -> Result<Arc<dyn ManagementApi>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.api.clone())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            max_reauth_attempts: 2,
            credential_history: 3,
        }
    }

    fn pool_for(mock: MockManagementApi) -> (ConnectionPool, Arc<FixedConnector>) {
        let connector = Arc::new(FixedConnector {
            api: Arc::new(mock),
            connects: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::new(connector.clone(), Credentials::new("root", "old"), settings());
        (pool, connector)
    }

    fn identity() -> HostIdentity {
        HostIdentity::new("host-1", "10.0.0.1").with_pool("pool-1")
    }

    #[test]
    fn test_connection_is_memoized() {
        let (pool, connector) = pool_for(MockManagementApi::new());
        let a = pool.get_connection(&identity()).unwrap();
        let b = pool.get_connection(&identity()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reauthenticates_on_session_invalid() {
        let mut mock = MockManagementApi::new();
        let logins = Arc::new(AtomicUsize::new(0));
        let l = logins.clone();
        mock.expect_login().returning(move |_, _| {
            let n = l.fetch_add(1, Ordering::SeqCst);
            Ok(SessionRef::new(format!("session-{}", n)))
        });
        mock.expect_pool_get_uuid().returning(|session| {
            if session.as_str() == "session-0" {
                Err(Error::api("pool.get_uuid", SESSION_INVALID, vec![]))
            } else {
                Ok("pool-1".into())
            }
        });
        let (pool, _) = pool_for(mock);
        let conn = pool.get_connection(&identity()).unwrap();
        let uuid = conn.call("pool.get_uuid", |api, s| api.pool_get_uuid(s)).unwrap();
        assert_eq!(uuid, "pool-1");
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reauth_is_bounded() {
        let mut mock = MockManagementApi::new();
        mock.expect_login()
            .times(3)
            .returning(|_, _| Ok(SessionRef::new("s")));
        mock.expect_pool_get_uuid()
            .times(3)
            .returning(|_| Err(Error::api("pool.get_uuid", SESSION_INVALID, vec![])));
        let (pool, _) = pool_for(mock);
        let conn = pool.get_connection(&identity()).unwrap();
        let err = conn.call("pool.get_uuid", |api, s| api.pool_get_uuid(s)).unwrap_err();
        assert!(err.is_session_invalid());
    }

    #[test]
    fn test_rotation_tries_newest_credential_first() {
        let mut mock = MockManagementApi::new();
        let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let t = tried.clone();
        mock.expect_login().returning(move |_, password| {
            t.lock().push(password.to_string());
            if password == "old" {
                Ok(SessionRef::new("s"))
            } else {
                Err(Error::api("session.login_with_password", SESSION_AUTHENTICATION_FAILED, vec![]))
            }
        });
        mock.expect_pool_get_uuid().returning(|_| Ok("pool-1".into()));
        let (pool, _) = pool_for(mock);
        pool.rotate_password("root", "new");
        let conn = pool.get_connection(&identity()).unwrap();
        conn.call("pool.get_uuid", |api, s| api.pool_get_uuid(s)).unwrap();
        assert_eq!(*tried.lock(), vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_all_credentials_rejected_is_fatal() {
        let mut mock = MockManagementApi::new();
        mock.expect_login().returning(|_, _| {
            Err(Error::api("session.login_with_password", SESSION_AUTHENTICATION_FAILED, vec![]))
        });
        let (pool, _) = pool_for(mock);
        let conn = pool.get_connection(&identity()).unwrap();
        let err = conn.call("pool.get_uuid", |api, s| api.pool_get_uuid(s)).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_credential_history_is_bounded() {
        let (pool, _) = pool_for(MockManagementApi::new());
        for i in 0..5 {
            pool.rotate_password("root", &format!("pw{}", i));
        }
        assert_eq!(pool.credential_count(), 3);
    }

    #[test]
    fn test_disconnect_logs_out() {
        let mut mock = MockManagementApi::new();
        mock.expect_login().returning(|_, _| Ok(SessionRef::new("s")));
        mock.expect_pool_get_uuid().returning(|_| Ok("pool-1".into()));
        mock.expect_logout().times(1).returning(|_| Ok(()));
        let (pool, _) = pool_for(mock);
        let conn = pool.get_connection(&identity()).unwrap();
        conn.call("pool.get_uuid", |api, s| api.pool_get_uuid(s)).unwrap();
        pool.disconnect(&identity()).unwrap();
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let text = format!("{:?}", Credentials::new("root", "hunter2"));
        assert!(!text.contains("hunter2"));
    }
}
