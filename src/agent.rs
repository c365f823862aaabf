//! Host agent: executes control-plane commands against one managed host

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{Answer, AnswerPayload, Command};
use crate::config::AgentConfig;
use crate::mgmt::OpaqueRef;
use crate::network::NetworkManager;
use crate::session::{Connection, ConnectionPool, Connector, Credentials, HostIdentity};
use crate::stats::{self, RrdSource};
use crate::storage::StorageManager;
use crate::task::TaskExecutor;
use crate::vm::VmManager;
use crate::{Error, Result};

const HEARTBEAT_OK: &str = "> DONE <";

/// What the agent reports about its host at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub uuid: String,
    pub name: String,
    pub address: String,
    pub pool_uuid: String,
    pub cpus: u32,
    pub cpu_speed_mhz: u64,
    pub product_version: String,
    pub memory_total: u64,
    pub memory_free: u64,
}

pub struct Agent {
    config: AgentConfig,
    identity: HostIdentity,
    pool: ConnectionPool,
    storage: Arc<StorageManager>,
    networks: Arc<NetworkManager>,
    vms: VmManager,
    rrd: Arc<dyn RrdSource>,
}

impl Agent {
    pub fn new(config: AgentConfig, connector: Arc<dyn Connector>, rrd: Arc<dyn RrdSource>) -> Result<Self> {
        config.validate()?;
        let mut identity = HostIdentity::new(&config.host_uuid, &config.host_address);
        if let Some(pool_uuid) = &config.pool_uuid {
            identity = identity.with_pool(pool_uuid);
        }
        let pool = ConnectionPool::new(
            connector,
            Credentials::new(&config.username, &config.password),
            config.session.clone(),
        );
        let executor = || TaskExecutor::new(config.tasks.poll_interval());
        let storage = Arc::new(StorageManager::new(
            executor(),
            config.tasks.clone(),
            config.storage.clone(),
        ));
        let networks = Arc::new(NetworkManager::new(config.network.clone()));
        let vms = VmManager::new(executor(), config.tasks.clone(), storage.clone(), networks.clone());

        Ok(Self {
            config,
            identity,
            pool,
            storage,
            networks,
            vms,
            rrd,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn vms(&self) -> &VmManager {
        &self.vms
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    fn connect(&self) -> Result<(Arc<Connection>, OpaqueRef)> {
        let conn = self.pool.get_connection(&self.identity)?;
        let host = self.identity.resolve(&conn)?;
        Ok((conn, host))
    }

    /// Startup handshake: confirm the host belongs to the configured pool
    /// and that its management network is usable.
    pub fn initialize(&self) -> Result<HostInfo> {
        let (conn, host) = self.connect()?;
        let pool_uuid = conn.call("pool.get_uuid", |api, s| api.pool_get_uuid(s))?;
        if let Some(expected) = &self.config.pool_uuid {
            if expected != &pool_uuid {
                return Err(Error::Config(format!(
                    "host {} belongs to pool {}, configured for {}",
                    self.identity.uuid, pool_uuid, expected
                )));
            }
        }
        self.networks.check_management_network(&conn, &host)?;

        let record = conn.call("host.get_record", |api, s| api.host_get_record(s, &host))?;
        tracing::info!(
            host = %record.uuid,
            pool = %pool_uuid,
            cpus = record.cpu_count,
            version = %record.product_version,
            "Agent initialized"
        );
        Ok(HostInfo {
            uuid: record.uuid,
            name: record.name_label,
            address: record.address,
            pool_uuid,
            cpus: record.cpu_count,
            cpu_speed_mhz: record.cpu_speed_mhz,
            product_version: record.product_version,
            memory_total: record.memory_total,
            memory_free: record.memory_free,
        })
    }

    /// Run one command. Failures are reported in the answer, never raised.
    pub fn execute(&self, command: Command) -> Answer {
        let name = command.name();
        let target = command.target();
        let span = tracing::info_span!("command", command = name, target = %target);
        let _enter = span.enter();

        match self.dispatch(command) {
            Ok(answer) => {
                tracing::info!(details = %answer.details, "Command succeeded");
                answer
            }
            Err(e) => {
                tracing::error!(error = %e, kind = %e.kind(), "Command failed");
                Answer::failure(format!("{} {} failed ({}): {}", name, target, e.kind(), e))
            }
        }
    }

    fn dispatch(&self, command: Command) -> Result<Answer> {
        if let Command::RotatePassword { username, password } = &command {
            self.pool.rotate_password(username, password);
            return Ok(Answer::ok(format!("credentials for {} rotated", username)));
        }

        let (conn, host) = self.connect()?;
        let conn = conn.as_ref();
        match command {
            Command::StartVm { vm } => {
                let info = self.vms.start(conn, &host, &vm)?;
                Ok(Answer::with_payload(format!("{} is running", vm.name), AnswerPayload::Vm(info)))
            }
            Command::StopVm { vm_name, force } => {
                self.vms.stop(conn, &vm_name, force)?;
                Ok(Answer::ok(format!("{} stopped", vm_name)))
            }
            Command::RebootVm { vm_name } => {
                let info = self.vms.reboot(conn, &vm_name)?;
                Ok(Answer::with_payload(format!("{} rebooted", vm_name), AnswerPayload::Vm(info)))
            }
            Command::MigrateVm { vm_name, dest_host_uuid } => {
                let info = self.vms.migrate(conn, &vm_name, &dest_host_uuid)?;
                Ok(Answer::with_payload(
                    format!("{} migrated to {}", vm_name, dest_host_uuid),
                    AnswerPayload::Vm(info),
                ))
            }
            Command::ScaleVm { vm_name, memory, vcpus } => {
                let info = self.vms.scale(conn, &vm_name, &memory, vcpus)?;
                Ok(Answer::with_payload(format!("{} scaled", vm_name), AnswerPayload::Vm(info)))
            }

            Command::AttachVolume { vm_name, vdi_uuid, device } => {
                let device = self.vms.attach_volume(conn, &host, &vm_name, &vdi_uuid, device)?;
                Ok(Answer::with_payload(
                    format!("{} attached to {} at {}", vdi_uuid, vm_name, device),
                    AnswerPayload::Device { device },
                ))
            }
            Command::DetachVolume { vm_name, vdi_uuid } => {
                self.vms.detach_volume(conn, &vm_name, &vdi_uuid)?;
                Ok(Answer::ok(format!("{} detached from {}", vdi_uuid, vm_name)))
            }
            Command::AttachIso { vm_name, iso_url } => {
                self.vms.attach_iso(conn, &host, &vm_name, &iso_url)?;
                Ok(Answer::ok(format!("{} inserted into {}", iso_url, vm_name)))
            }
            Command::DetachIso { vm_name } => {
                self.vms.detach_iso(conn, &vm_name)?;
                Ok(Answer::ok(format!("ISO ejected from {}", vm_name)))
            }
            Command::CreateVolume { sr_uuid, name, size } => {
                let vdi = self.storage.create_vdi(conn, &host, &sr_uuid, &name, size)?;
                Ok(Answer::with_payload(format!("volume {} created", vdi.uuid), AnswerPayload::Volume(vdi)))
            }
            Command::DeleteVolume { vdi_uuid } => {
                self.storage.delete_vdi(conn, &vdi_uuid)?;
                Ok(Answer::ok(format!("volume {} deleted", vdi_uuid)))
            }
            Command::ResizeVolume { vdi_uuid, new_size } => {
                let vdi = self.storage.resize_vdi(conn, &vdi_uuid, new_size)?;
                Ok(Answer::with_payload(format!("volume {} resized", vdi_uuid), AnswerPayload::Volume(vdi)))
            }
            Command::CopyVolume { vdi_uuid, dest_sr_uuid } => {
                let vdi = self.storage.copy_vdi(conn, &host, &vdi_uuid, &dest_sr_uuid)?;
                Ok(Answer::with_payload(
                    format!("volume {} copied to {}", vdi_uuid, vdi.uuid),
                    AnswerPayload::Volume(vdi),
                ))
            }

            Command::CreateStoragePool { pool } => {
                let sr = self.storage.ensure_attached(conn, &host, &pool)?;
                Ok(Answer::with_payload(
                    format!("storage pool {} attached", sr.uuid),
                    AnswerPayload::StoragePool(sr),
                ))
            }
            Command::DeleteStoragePool { sr_uuid } => {
                self.storage.remove_sr(conn, &sr_uuid)?;
                Ok(Answer::ok(format!("storage pool {} removed", sr_uuid)))
            }

            Command::CreateVolumeSnapshot { vdi_uuid } => {
                let snapshot = self.storage.snapshot_vdi(conn, &vdi_uuid)?;
                Ok(Answer::with_payload(
                    format!("snapshot {} of {}", snapshot.uuid, vdi_uuid),
                    AnswerPayload::Volume(snapshot),
                ))
            }
            Command::BackupSnapshot { backup } => {
                let outcome = self.storage.backup_snapshot(conn, &host, &backup)?;
                Ok(Answer::with_payload(
                    format!("snapshot {} backed up as {}", backup.snapshot_uuid, outcome.backup_uuid),
                    AnswerPayload::Backup(outcome),
                ))
            }
            Command::CreateVmSnapshot { vm_name, snapshot_name } => {
                let snapshot_name = snapshot_name.unwrap_or_else(|| default_snapshot_name(&vm_name));
                let snapshot = self.vms.snapshot(conn, &vm_name, &snapshot_name)?;
                Ok(Answer::with_payload(
                    format!("{} snapshot {} taken", vm_name, snapshot.uuid),
                    AnswerPayload::VmSnapshot(snapshot),
                ))
            }
            Command::DeleteVmSnapshot { snapshot_uuid } => {
                self.vms.delete_snapshot(conn, &snapshot_uuid)?;
                Ok(Answer::ok(format!("VM snapshot {} deleted", snapshot_uuid)))
            }
            Command::RevertToVmSnapshot { snapshot_uuid } => {
                let info = self.vms.revert(conn, &snapshot_uuid)?;
                Ok(Answer::with_payload(
                    format!("{} reverted to {}", info.name, snapshot_uuid),
                    AnswerPayload::Vm(info),
                ))
            }

            Command::PlugNic { vm_name, nic } => {
                self.vms.plug_nic(conn, &host, &vm_name, &nic)?;
                Ok(Answer::ok(format!("NIC {} plugged into {}", nic.mac, vm_name)))
            }
            Command::UnplugNic { vm_name, mac } => {
                self.vms.unplug_nic(conn, &vm_name, &mac)?;
                Ok(Answer::ok(format!("NIC {} unplugged from {}", mac, vm_name)))
            }
            Command::SecurityGroupRules { rules } => {
                self.networks.program_security_group_rules(conn, &host, &rules)?;
                Ok(Answer::ok(format!(
                    "{} rules programmed for {} (seqno {})",
                    rules.rules.len(),
                    rules.vm_name,
                    rules.seqno
                )))
            }
            Command::SetupTunnelNetwork { key } => {
                let network = self.networks.setup_tunnel_network(conn, &host, key)?;
                Ok(Answer::with_payload(
                    format!("tunnel {} on bridge {}", key, network.bridge),
                    AnswerPayload::Network(network),
                ))
            }

            Command::GetHostStats => {
                let updates = stats::collect(conn, self.rrd.as_ref(), self.stats_window())?;
                let host_stats = updates.host_stats(&self.identity.uuid)?;
                Ok(Answer::with_payload("host statistics", AnswerPayload::HostStats(host_stats)))
            }
            Command::GetVmStats { vm_names } => {
                let updates = stats::collect(conn, self.rrd.as_ref(), self.stats_window())?;
                let mut per_vm = BTreeMap::new();
                for name in vm_names {
                    let info = match self.vms.info(conn, &name) {
                        Ok(info) => info,
                        Err(Error::NotFound { .. }) => {
                            tracing::debug!(vm = %name, "No such VM, skipping statistics");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    match updates.vm_stats(&info.uuid) {
                        Ok(vm_stats) => {
                            per_vm.insert(name, vm_stats);
                        }
                        Err(Error::NotFound { .. }) => {
                            tracing::debug!(vm = %name, "VM not in the statistics export");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(Answer::with_payload(
                    format!("statistics for {} VM(s)", per_vm.len()),
                    AnswerPayload::VmStats(per_vm),
                ))
            }
            Command::GetStorageStats { sr_uuid } => {
                let sr_stats = self.storage.storage_stats(conn, &sr_uuid)?;
                Ok(Answer::with_payload(
                    format!("storage pool {}", sr_uuid),
                    AnswerPayload::StorageStats(sr_stats),
                ))
            }

            Command::Ping => {
                self.heartbeat(conn, &host)?;
                let states = self.vms.host_vm_states(conn, &host)?;
                Ok(Answer::with_payload(
                    format!("{} VM(s) on {}", states.len(), self.identity.uuid),
                    AnswerPayload::PowerStates(states),
                ))
            }
            Command::RotatePassword { .. } => Ok(Answer::ok("credentials rotated")),
        }
    }

    fn stats_window(&self) -> Duration {
        Duration::from_secs(self.config.stats.rrd_window_secs)
    }

    fn heartbeat(&self, conn: &Connection, host: &OpaqueRef) -> Result<()> {
        let mut args = BTreeMap::new();
        args.insert("host_uuid".to_string(), self.identity.uuid.clone());
        args.insert("interval".to_string(), self.config.stats.rrd_window_secs.to_string());
        let reply = conn.call("host.call_plugin", |api, s| {
            api.call_plugin(s, host, "vmops", "heartbeat", &args)
        })?;
        if !reply.contains(HEARTBEAT_OK) {
            return Err(Error::api("vmops.heartbeat", "PLUGIN_FAILED", vec![reply]));
        }
        Ok(())
    }
}

fn default_snapshot_name(vm_name: &str) -> String {
    format!("{}_{}", vm_name, chrono::Utc::now().format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::SimulatedPool;
    use crate::network::NetworkSpec;
    use crate::testing::{Fixture, TEMPLATE};
    use crate::vm::{DiskSpec, NicSpec, PowerState, VmSpec};

    fn agent(fx: &Fixture) -> Agent {
        Agent::new(fx.config(), Arc::new(fx.sim.clone()), Arc::new(fx.sim.clone())).unwrap()
    }

    fn start_command(fx: &Fixture) -> Command {
        Command::StartVm {
            vm: VmSpec::builder("i-2-3-test", TEMPLATE)
                .disk(DiskSpec::new_root(fx.local_sr.clone(), 8 << 30))
                .nic(NicSpec::new(0, "02:00:0c:ae:00:01", NetworkSpec::named("guest0")))
                .build(),
        }
    }

    #[test]
    fn test_initialize_reports_host() {
        let fx = Fixture::new();
        let info = agent(&fx).initialize().unwrap();
        assert_eq!(info.uuid, "host-1");
        assert_eq!(info.address, "10.0.0.1");
        assert_eq!(info.pool_uuid, fx.sim.pool_uuid());
        assert_eq!(info.cpus, 8);
    }

    #[test]
    fn test_initialize_rejects_management_vlan() {
        let fx = Fixture::new();
        fx.sim.set_management_vlan("host-1", 100);
        assert!(matches!(agent(&fx).initialize(), Err(Error::Precondition(_))));

        let mut config = fx.config();
        config.network.allow_management_vlan = true;
        let lenient = Agent::new(config, Arc::new(fx.sim.clone()), Arc::new(fx.sim.clone())).unwrap();
        assert!(lenient.initialize().is_ok());
    }

    #[test]
    fn test_initialize_rejects_foreign_pool() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.pool_uuid = Some("other-pool".into());
        let agent = Agent::new(config, Arc::new(fx.sim.clone()), Arc::new(fx.sim.clone())).unwrap();
        assert!(matches!(agent.initialize(), Err(Error::Config(_))));
    }

    #[test]
    fn test_failure_becomes_answer() {
        let fx = Fixture::new();
        let answer = agent(&fx).execute(Command::RebootVm {
            vm_name: "missing".into(),
        });
        assert!(!answer.success);
        assert!(answer.details.contains("RebootVm missing"));
        assert!(answer.details.contains("VM not found"));
    }

    #[test]
    fn test_unreachable_host_becomes_answer() {
        let fx = Fixture::new();
        let config = AgentConfig::builder()
            .host("host-1", "10.9.9.9")
            .credentials("root", "secret")
            .build();
        let agent = Agent::new(config, Arc::new(fx.sim.clone()), Arc::new(SimulatedPool::new())).unwrap();
        let answer = agent.execute(Command::Ping);
        assert!(!answer.success);
        assert!(answer.details.contains("session"));
    }

    #[test]
    fn test_ping_reports_vm_states() {
        let fx = Fixture::new();
        let agent = agent(&fx);
        assert!(agent.execute(start_command(&fx)).success);

        let answer = agent.execute(Command::Ping);
        assert!(answer.success, "{}", answer.details);
        match answer.payload {
            Some(AnswerPayload::PowerStates(states)) => {
                assert_eq!(states.get("i-2-3-test"), Some(&PowerState::PowerOn));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_ping_fails_on_bad_heartbeat() {
        let fx = Fixture::new();
        fx.sim.set_plugin_response("vmops", "heartbeat", "timeout");
        let answer = agent(&fx).execute(Command::Ping);
        assert!(!answer.success);
        assert!(answer.details.contains("PLUGIN_FAILED"));
    }

    #[test]
    fn test_vm_stats_skip_unknown_vms() {
        let fx = Fixture::new();
        let agent = agent(&fx);
        assert!(agent.execute(start_command(&fx)).success);
        let answer = agent.execute(Command::GetVmStats {
            vm_names: vec!["i-2-3-test".into(), "ghost".into()],
        });
        assert!(answer.success, "{}", answer.details);
        match answer.payload {
            Some(AnswerPayload::VmStats(stats)) => {
                assert_eq!(stats.len(), 1);
                assert!(stats.contains_key("i-2-3-test"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rotate_password_needs_no_connection() {
        let fx = Fixture::new();
        let agent = agent(&fx);
        let answer = agent.execute(Command::RotatePassword {
            username: "root".into(),
            password: "next".into(),
        });
        assert!(answer.success);
        assert_eq!(agent.pool().credential_count(), 2);
        assert_eq!(fx.sim.session_count(), 0);
    }

    #[test]
    fn test_default_snapshot_name() {
        let name = default_snapshot_name("i-2-3-test");
        assert!(name.starts_with("i-2-3-test_"));
        assert_eq!(name.len(), "i-2-3-test_".len() + 14);
    }
}
