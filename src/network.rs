//! Guest network resolution, VLAN and tunnel setup, security-group rules
//!
//! Networks are found or created by name. Creation is serialized per name
//! inside this agent; agents on other hosts can still race, which the VLAN
//! tie-break below only narrows.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::NetworkSettings;
use crate::locks::KeyedLocks;
use crate::mgmt::{NetworkRecord, OpaqueRef};
use crate::session::Connection;
use crate::{Error, Result};

pub const CREATED_BY_KEY: &str = "created-by";
pub const CREATED_BY_VALUE: &str = "hv-agent";
pub const CREATION_TS_KEY: &str = "creation-ts";
pub const CREATION_NONCE_KEY: &str = "creation-nonce";
pub const TUNNEL_MARKER_KEY: &str = "is-ovs-tun-network";

/// Which network a NIC should be placed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkSpec {
    /// An existing network, by name label.
    Named { name: String },
    /// A tagged network over the physical network (or device) `physical`.
    Vlan { tag: u16, physical: String },
    /// An overlay network keyed by tunnel id.
    Tunnel { key: u32 },
}

impl NetworkSpec {
    pub fn named(name: impl Into<String>) -> Self {
        NetworkSpec::Named { name: name.into() }
    }

    pub fn name_label(&self) -> String {
        match self {
            NetworkSpec::Named { name } => name.clone(),
            NetworkSpec::Vlan { tag, physical } => format!("VLAN-{}-{}", physical, tag),
            NetworkSpec::Tunnel { key } => format!("OVSTunnel{}", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub uuid: String,
    pub name_label: String,
    pub bridge: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub direction: RuleDirection,
    pub protocol: String,
    pub start_port: u16,
    pub end_port: u16,
    #[serde(default)]
    pub cidrs: Vec<String>,
}

impl SecurityRule {
    fn encode(&self) -> String {
        let direction = match self.direction {
            RuleDirection::Ingress => "I",
            RuleDirection::Egress => "E",
        };
        format!(
            "{}:{}:{}:{}:{}",
            direction,
            self.protocol,
            self.start_port,
            self.end_port,
            self.cidrs.join(",")
        )
    }
}

/// Rule set for one VM's interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRules {
    pub vm_name: String,
    pub vm_id: u64,
    pub vm_ip: String,
    pub vm_mac: String,
    pub signature: String,
    pub seqno: u64,
    pub rules: Vec<SecurityRule>,
}

impl SecurityGroupRules {
    /// Rules as `dir:proto:start:end:cidr,...` joined by `;`, base64 encoded.
    pub fn encoded_rules(&self) -> String {
        let joined = self
            .rules
            .iter()
            .map(SecurityRule::encode)
            .collect::<Vec<_>>()
            .join(";");
        BASE64.encode(joined)
    }
}

/// (timestamp, nonce) ordering key of an agent-created network.
fn creation_key(record: &NetworkRecord) -> (i64, u64) {
    let ts = record
        .other_config
        .get(CREATION_TS_KEY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(i64::MAX);
    let nonce = record
        .other_config
        .get(CREATION_NONCE_KEY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(u64::MAX);
    (ts, nonce)
}

fn created_by_agent(record: &NetworkRecord) -> bool {
    record.other_config.get(CREATED_BY_KEY).map(String::as_str) == Some(CREATED_BY_VALUE)
}

pub struct NetworkManager {
    locks: KeyedLocks,
    settings: NetworkSettings,
}

impl NetworkManager {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            locks: KeyedLocks::new(),
            settings,
        }
    }

    /// Resolve `spec` to a network usable on `host`, creating it if needed.
    pub fn resolve(&self, conn: &Connection, host: &OpaqueRef, spec: &NetworkSpec) -> Result<OpaqueRef> {
        match spec {
            NetworkSpec::Named { name } => {
                let found = conn.call("network.get_by_name_label", |api, s| {
                    api.network_get_by_name_label(s, name)
                })?;
                found
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::not_found("network", name.clone()))
            }
            NetworkSpec::Vlan { tag, physical } => self.ensure_vlan(conn, host, *tag, physical, &spec.name_label()),
            NetworkSpec::Tunnel { key } => self.ensure_tunnel(conn, host, *key).map(|(network, _)| network),
        }
    }

    fn ensure_vlan(&self, conn: &Connection, host: &OpaqueRef, tag: u16, physical: &str, name: &str) -> Result<OpaqueRef> {
        let _guard = self.locks.lock(name);

        let mut candidates = self.networks_named(conn, name)?;
        if candidates.is_empty() {
            let mut other_config = BTreeMap::new();
            other_config.insert(CREATED_BY_KEY.to_string(), CREATED_BY_VALUE.to_string());
            other_config.insert(
                CREATION_TS_KEY.to_string(),
                chrono::Utc::now().timestamp_millis().to_string(),
            );
            other_config.insert(
                CREATION_NONCE_KEY.to_string(),
                (uuid::Uuid::new_v4().as_u128() as u64).to_string(),
            );
            let network = conn.call("network.create", |api, s| api.network_create(s, name, &other_config))?;
            tracing::info!(network = %name, tag, "Created VLAN network");
            // Re-read: another host may have created the same name concurrently.
            candidates = self.networks_named(conn, name)?;
            if candidates.is_empty() {
                let record = conn.call("network.get_record", |api, s| api.network_get_record(s, &network))?;
                candidates.push((network, record));
            }
        }

        let winner = self.settle_duplicates(conn, name, candidates)?;
        self.ensure_vlan_pif(conn, host, &winner, tag, physical)?;
        Ok(winner)
    }

    fn networks_named(&self, conn: &Connection, name: &str) -> Result<Vec<(OpaqueRef, NetworkRecord)>> {
        let refs = conn.call("network.get_by_name_label", |api, s| api.network_get_by_name_label(s, name))?;
        refs.into_iter()
            .map(|r| {
                let record = conn.call("network.get_record", |api, s| api.network_get_record(s, &r))?;
                Ok((r, record))
            })
            .collect()
    }

    /// Keep the network with the lowest (timestamp, nonce); tear down the rest.
    ///
    /// This is first-writer-wins without any atomicity: two agents can still
    /// both observe themselves as the winner if their reads interleave.
    fn settle_duplicates(
        &self,
        conn: &Connection,
        name: &str,
        mut candidates: Vec<(OpaqueRef, NetworkRecord)>,
    ) -> Result<OpaqueRef> {
        candidates.sort_by_key(|(_, record)| creation_key(record));
        let mut iter = candidates.into_iter();
        let (winner, winner_record) = iter
            .next()
            .ok_or_else(|| Error::not_found("network", name))?;
        for (loser, record) in iter {
            tracing::warn!(
                network = %name,
                kept = %winner_record.uuid,
                dropped = %record.uuid,
                "Duplicate VLAN network; resolving by creation order (best-effort, not atomic)"
            );
            if created_by_agent(&record) && record.vifs.is_empty() {
                if let Err(e) = self.destroy_network(conn, &loser, &record) {
                    tracing::warn!(network = %record.uuid, error = %e, "Failed to remove duplicate network");
                }
            }
        }
        Ok(winner)
    }

    fn ensure_vlan_pif(&self, conn: &Connection, host: &OpaqueRef, network: &OpaqueRef, tag: u16, physical: &str) -> Result<()> {
        let record = conn.call("network.get_record", |api, s| api.network_get_record(s, network))?;
        for pif in &record.pifs {
            let pif_record = conn.call("PIF.get_record", |api, s| api.pif_get_record(s, pif))?;
            if &pif_record.host == host {
                return Ok(());
            }
        }
        let base = self.physical_pif(conn, host, physical)?;
        conn.call("VLAN.create", |api, s| api.vlan_create(s, &base, tag, network))?;
        tracing::info!(network = %record.name_label, tag, physical = %physical, "Created VLAN interface");
        Ok(())
    }

    /// Untagged PIF on `host` for a physical network name or device name.
    fn physical_pif(&self, conn: &Connection, host: &OpaqueRef, physical: &str) -> Result<OpaqueRef> {
        for network in conn.call("network.get_by_name_label", |api, s| api.network_get_by_name_label(s, physical))? {
            let record = conn.call("network.get_record", |api, s| api.network_get_record(s, &network))?;
            for pif in &record.pifs {
                let pif_record = conn.call("PIF.get_record", |api, s| api.pif_get_record(s, pif))?;
                if &pif_record.host == host && pif_record.vlan < 0 {
                    return Ok(pif.clone());
                }
            }
        }
        let host_record = conn.call("host.get_record", |api, s| api.host_get_record(s, host))?;
        for pif in &host_record.pifs {
            let pif_record = conn.call("PIF.get_record", |api, s| api.pif_get_record(s, pif))?;
            if pif_record.device == physical && pif_record.vlan < 0 {
                return Ok(pif.clone());
            }
        }
        Err(Error::not_found("physical interface", physical))
    }

    fn destroy_network(&self, conn: &Connection, network: &OpaqueRef, record: &NetworkRecord) -> Result<()> {
        for pif in &record.pifs {
            let pif_record = conn.call("PIF.get_record", |api, s| api.pif_get_record(s, pif))?;
            if pif_record.vlan >= 0 {
                conn.call("VLAN.destroy", |api, s| api.vlan_destroy(s, pif))?;
            }
        }
        conn.call("network.destroy", |api, s| api.network_destroy(s, network))
    }

    /// Tear down an agent-created VLAN network once no VIF uses it.
    ///
    /// Returns whether the network was removed.
    pub fn release_if_unused(&self, conn: &Connection, spec: &NetworkSpec) -> Result<bool> {
        if !matches!(spec, NetworkSpec::Vlan { .. }) {
            return Ok(false);
        }
        self.release_named(conn, &spec.name_label())
    }

    /// Same as [`release_if_unused`](Self::release_if_unused), addressed by
    /// name label. Networks not created as VLANs by this agent are left alone.
    pub fn release_named(&self, conn: &Connection, name: &str) -> Result<bool> {
        let _guard = self.locks.lock(name);
        let mut released = false;
        for (network, record) in self.networks_named(conn, name)? {
            let is_vlan = record.other_config.contains_key(CREATION_NONCE_KEY)
                && !record.other_config.contains_key(TUNNEL_MARKER_KEY);
            if !created_by_agent(&record) || !is_vlan || !record.vifs.is_empty() {
                continue;
            }
            self.destroy_network(conn, &network, &record)?;
            tracing::info!(network = %name, "Released unused VLAN network");
            released = true;
        }
        Ok(released)
    }

    fn ensure_tunnel(&self, conn: &Connection, host: &OpaqueRef, key: u32) -> Result<(OpaqueRef, NetworkRecord)> {
        let name = NetworkSpec::Tunnel { key }.name_label();
        let _guard = self.locks.lock(&name);

        let existing = self.networks_named(conn, &name)?.into_iter().next();
        let (network, record) = match existing {
            Some(found) => found,
            None => {
                let mut other_config = BTreeMap::new();
                other_config.insert(CREATED_BY_KEY.to_string(), CREATED_BY_VALUE.to_string());
                other_config.insert(TUNNEL_MARKER_KEY.to_string(), "true".to_string());
                let network = conn.call("network.create", |api, s| api.network_create(s, &name, &other_config))?;
                let record = conn.call("network.get_record", |api, s| api.network_get_record(s, &network))?;
                tracing::info!(network = %name, key, "Created tunnel network");
                (network, record)
            }
        };

        let mut args = BTreeMap::new();
        args.insert("bridge".to_string(), record.bridge.clone());
        args.insert("key".to_string(), key.to_string());
        args.insert("xs_nw_uuid".to_string(), record.uuid.clone());
        let reply = conn.call("host.call_plugin", |api, s| {
            api.call_plugin(s, host, "ovstunnel", "setup_ovs_bridge", &args)
        })?;
        if !reply.starts_with("SUCCESS") {
            return Err(Error::api(
                "ovstunnel.setup_ovs_bridge",
                "PLUGIN_FAILED",
                vec![record.bridge.clone(), reply],
            ));
        }
        tracing::info!(network = %name, bridge = %record.bridge, "Tunnel bridge configured");
        Ok((network, record))
    }

    /// Create (or reuse) the overlay network for `key` and configure its bridge on `host`.
    pub fn setup_tunnel_network(&self, conn: &Connection, host: &OpaqueRef, key: u32) -> Result<NetworkInfo> {
        let (_, record) = self.ensure_tunnel(conn, host, key)?;
        Ok(NetworkInfo {
            uuid: record.uuid,
            name_label: record.name_label,
            bridge: record.bridge,
        })
    }

    pub fn program_security_group_rules(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        rules: &SecurityGroupRules,
    ) -> Result<()> {
        let mut args = BTreeMap::new();
        args.insert("vmName".to_string(), rules.vm_name.clone());
        args.insert("vmID".to_string(), rules.vm_id.to_string());
        args.insert("vmIP".to_string(), rules.vm_ip.clone());
        args.insert("vmMAC".to_string(), rules.vm_mac.clone());
        args.insert("signature".to_string(), rules.signature.clone());
        args.insert("seqno".to_string(), rules.seqno.to_string());
        args.insert("rules".to_string(), rules.encoded_rules());

        let reply = conn.call("host.call_plugin", |api, s| {
            api.call_plugin(s, host, "vmops", "network_rules", &args)
        })?;
        if reply.trim() != "true" {
            return Err(Error::api(
                "vmops.network_rules",
                "PLUGIN_FAILED",
                vec![rules.vm_name.clone(), reply],
            ));
        }
        tracing::info!(vm = %rules.vm_name, seqno = rules.seqno, count = rules.rules.len(), "Security group rules programmed");
        Ok(())
    }

    /// Refuse to run on a host whose management interface is tagged, unless allowed.
    pub fn check_management_network(&self, conn: &Connection, host: &OpaqueRef) -> Result<()> {
        let host_record = conn.call("host.get_record", |api, s| api.host_get_record(s, host))?;
        for pif in &host_record.pifs {
            let pif_record = conn.call("PIF.get_record", |api, s| api.pif_get_record(s, pif))?;
            if !pif_record.management {
                continue;
            }
            if pif_record.vlan >= 0 && !self.settings.allow_management_vlan {
                return Err(Error::Precondition(format!(
                    "management interface {} on {} is on VLAN {}",
                    pif_record.device, host_record.name_label, pif_record.vlan
                )));
            }
            return Ok(());
        }
        Err(Error::Precondition(format!(
            "host {} has no management interface",
            host_record.name_label
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::ManagementApi;
    use crate::testing::Fixture;

    fn manager() -> NetworkManager {
        NetworkManager::new(NetworkSettings::default())
    }

    #[test]
    fn test_resolve_named_network() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let host = fx.host_ref();
        assert!(manager().resolve(&conn, &host, &NetworkSpec::named("guest0")).is_ok());
        let err = manager()
            .resolve(&conn, &host, &NetworkSpec::named("nope"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_vlan_network_created_once() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let host = fx.host_ref();
        let nets = manager();
        let spec = NetworkSpec::Vlan {
            tag: 100,
            physical: "guest0".into(),
        };
        let a = nets.resolve(&conn, &host, &spec).unwrap();
        let b = nets.resolve(&conn, &host, &spec).unwrap();
        assert_eq!(a, b);
        assert_eq!(fx.sim.networks_named("VLAN-guest0-100").len(), 1);
        assert_eq!(fx.sim.vlan_pif_count(), 1);
        assert_eq!(fx.sim.call_count("network.create"), 1);
    }

    #[test]
    fn test_vlan_duplicates_resolve_to_lowest_creation_key() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let host = fx.host_ref();
        let create = |ts: &str, nonce: &str| {
            let mut oc = BTreeMap::new();
            oc.insert(CREATED_BY_KEY.to_string(), CREATED_BY_VALUE.to_string());
            oc.insert(CREATION_TS_KEY.to_string(), ts.to_string());
            oc.insert(CREATION_NONCE_KEY.to_string(), nonce.to_string());
            conn.call("network.create", |api, s| api.network_create(s, "VLAN-guest0-200", &oc))
                .unwrap()
        };
        let _late = create("2000", "1");
        let early = create("1000", "9");
        let _tie = create("1000", "10");

        let chosen = manager()
            .resolve(&conn, &host, &NetworkSpec::Vlan { tag: 200, physical: "guest0".into() })
            .unwrap();
        assert_eq!(chosen, early);
        assert_eq!(fx.sim.networks_named("VLAN-guest0-200").len(), 1);
    }

    #[test]
    fn test_release_only_unused_agent_vlans() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let host = fx.host_ref();
        let nets = manager();
        let spec = NetworkSpec::Vlan { tag: 300, physical: "eth1".into() };
        nets.resolve(&conn, &host, &spec).unwrap();
        assert!(nets.release_if_unused(&conn, &spec).unwrap());
        assert!(fx.sim.networks_named("VLAN-eth1-300").is_empty());
        assert_eq!(fx.sim.vlan_pif_count(), 0);
        assert!(!nets.release_if_unused(&conn, &NetworkSpec::named("guest0")).unwrap());
    }

    #[test]
    fn test_tunnel_setup_calls_plugin() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let info = manager().setup_tunnel_network(&conn, &fx.host_ref(), 42).unwrap();
        assert_eq!(info.name_label, "OVSTunnel42");
        let calls = fx.sim.plugin_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].plugin, "ovstunnel");
        assert_eq!(calls[0].args["bridge"], info.bridge);
    }

    #[test]
    fn test_tunnel_plugin_failure_is_reported() {
        let fx = Fixture::new();
        fx.sim.set_plugin_response("ovstunnel", "setup_ovs_bridge", "FAILURE:no ovs");
        let err = manager()
            .setup_tunnel_network(&fx.conn(), &fx.host_ref(), 7)
            .unwrap_err();
        assert_eq!(err.code(), Some("PLUGIN_FAILED"));
    }

    #[test]
    fn test_security_group_rules_encoded() {
        let fx = Fixture::new();
        let rules = SecurityGroupRules {
            vm_name: "i-2-3-test".into(),
            vm_id: 3,
            vm_ip: "10.1.1.10".into(),
            vm_mac: "02:00:00:00:00:01".into(),
            signature: "abc".into(),
            seqno: 4,
            rules: vec![SecurityRule {
                direction: RuleDirection::Ingress,
                protocol: "tcp".into(),
                start_port: 22,
                end_port: 22,
                cidrs: vec!["0.0.0.0/0".into()],
            }],
        };
        manager()
            .program_security_group_rules(&fx.conn(), &fx.host_ref(), &rules)
            .unwrap();
        let call = &fx.sim.plugin_calls()[0];
        let decoded = BASE64.decode(&call.args["rules"]).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "I:tcp:22:22:0.0.0.0/0");

        fx.sim.set_plugin_response("vmops", "network_rules", "false");
        assert!(manager()
            .program_security_group_rules(&fx.conn(), &fx.host_ref(), &rules)
            .is_err());
    }

    #[test]
    fn test_management_vlan_rejected_unless_allowed() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let host = fx.host_ref();
        assert!(manager().check_management_network(&conn, &host).is_ok());

        fx.sim.set_management_vlan("host-1", 12);
        let err = manager().check_management_network(&conn, &host).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let permissive = NetworkManager::new(NetworkSettings {
            allow_management_vlan: true,
        });
        assert!(permissive.check_management_network(&conn, &host).is_ok());
    }

    #[test]
    fn test_direct_api_is_session_scoped() {
        let fx = Fixture::new();
        let session = fx.sim.login("root", "secret").unwrap();
        assert_eq!(fx.sim.network_get_by_name_label(&session, "guest0").unwrap().len(), 1);
    }
}
