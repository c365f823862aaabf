//! Shared fixture for unit tests

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AgentConfig, SessionSettings};
use crate::mgmt::{OpaqueRef, SimulatedPool};
use crate::session::{Connection, ConnectionPool, Credentials, HostIdentity};
use crate::task::TaskExecutor;

pub const TEMPLATE: &str = "Debian Template";
pub const LOCAL_SR: &str = "Local storage";

/// Two-host simulated pool with a guest network, a template and local storage.
pub struct Fixture {
    pub sim: SimulatedPool,
    pub pool: ConnectionPool,
    pub identity: HostIdentity,
    pub local_sr: String,
}

impl Fixture {
    pub fn new() -> Self {
        let sim = SimulatedPool::new();
        sim.add_user("root", "secret");
        sim.add_host("host-1", "node1", "10.0.0.1");
        sim.add_host("host-2", "node2", "10.0.0.2");
        sim.add_network("guest0", "eth1");
        sim.add_template(TEMPLATE);
        let local_sr = sim.add_local_sr(LOCAL_SR, "/dev/sdb");

        let pool = ConnectionPool::new(
            Arc::new(sim.clone()),
            Credentials::new("root", "secret"),
            SessionSettings::default(),
        );
        let identity = HostIdentity::new("host-1", "10.0.0.1").with_pool(sim.pool_uuid());
        Self {
            sim,
            pool,
            identity,
            local_sr,
        }
    }

    pub fn conn(&self) -> Arc<Connection> {
        self.pool.get_connection(&self.identity).unwrap()
    }

    pub fn host_ref(&self) -> OpaqueRef {
        self.identity.resolve(&self.conn()).unwrap()
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor::new(Duration::from_millis(2))
    }

    pub fn config(&self) -> AgentConfig {
        AgentConfig::builder()
            .host("host-1", "10.0.0.1")
            .credentials("root", "secret")
            .poll_interval_ms(2)
            .build()
    }
}
