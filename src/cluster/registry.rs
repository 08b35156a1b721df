//! Node registry
//!
//! Membership set of storage nodes plus the name/hostname to address
//! resolution tables. Probing errors demote a node to offline but never
//! remove its record.

use crate::catalog::{Catalog, NodeRecord, NodeState};
use crate::error::{Error, Result};
use crate::remote::{ExecOptions, RemoteExecutor};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Deadline for registration and liveness probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Component Report
// =============================================================================

/// Install/activity status of one on-node component
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComponentStatus {
    pub installed: bool,
    /// Whether the unit is running, where that applies
    pub active: Option<bool>,
    pub version: Option<String>,
}

/// Result of a detailed node probe
#[derive(Debug, Clone, Serialize)]
pub struct ComponentsReport {
    pub address: String,
    /// Replication driver (kernel module + userland tools)
    pub drbd: ComponentStatus,
    /// Promoter daemon handling on-node failover
    pub promoter: ComponentStatus,
    /// OCF resource-agent scripts
    pub resource_agents: ComponentStatus,
}

// =============================================================================
// Resolution Tables
// =============================================================================

#[derive(Default)]
struct Tables {
    /// Node records keyed by address, the primary key
    nodes: BTreeMap<String, NodeRecord>,
    /// Logical name -> address
    names: BTreeMap<String, String>,
    /// Self-reported hostname -> address
    hostnames: BTreeMap<String, String>,
    /// Active host list the engine fans out against, in registration order
    host_list: Vec<String>,
}

// =============================================================================
// Node Registry
// =============================================================================

/// Membership and resolution authority for storage nodes.
pub struct NodeRegistry {
    executor: Arc<RemoteExecutor>,
    catalog: Catalog,
    tables: RwLock<Tables>,
}

impl NodeRegistry {
    pub fn new(executor: Arc<RemoteExecutor>, catalog: Catalog) -> Arc<Self> {
        Arc::new(Self {
            executor,
            catalog,
            tables: RwLock::new(Tables::default()),
        })
    }

    /// Hydrate the in-memory tables from the catalog after a restart.
    pub async fn load(&self) -> Result<usize> {
        let records = self.catalog.nodes().await?;
        let mut tables = self.tables.write();
        for record in &records {
            tables.names.insert(record.name.clone(), record.address.clone());
            if !record.hostname.is_empty() {
                tables
                    .hostnames
                    .insert(record.hostname.clone(), record.address.clone());
            }
            if !tables.host_list.contains(&record.address) {
                tables.host_list.push(record.address.clone());
            }
            tables.nodes.insert(record.address.clone(), record.clone());
        }
        Ok(records.len())
    }

    /// Register a node: probe it, record it online, persist it.
    pub async fn register(&self, name: &str, address: &str) -> Result<NodeRecord> {
        if self.tables.read().nodes.contains_key(address) {
            return Err(Error::AlreadyExists {
                kind: "node".into(),
                name: address.into(),
            });
        }

        let probe = self
            .executor
            .exec_one(address, "uname -n", Some(PROBE_TIMEOUT))
            .await
            .map_err(|err| {
                Error::Precondition(format!("node {address} is not reachable: {err}"))
            })?;
        let hostname = probe.output.trim().to_string();

        let record = NodeRecord {
            name: name.to_string(),
            address: address.to_string(),
            hostname: hostname.clone(),
            state: NodeState::Online,
            last_seen: Some(Utc::now()),
            version: None,
            capacity: BTreeMap::new(),
        };

        self.catalog.put_node(&record).await?;

        let mut tables = self.tables.write();
        tables.names.insert(name.to_string(), address.to_string());
        if !hostname.is_empty() {
            tables.hostnames.insert(hostname, address.to_string());
        }
        if !tables.host_list.contains(&record.address) {
            tables.host_list.push(record.address.clone());
        }
        tables.nodes.insert(record.address.clone(), record.clone());
        drop(tables);

        info!(name, address, "node registered");
        Ok(record)
    }

    /// Unregister a node: offline in memory, removed from the catalog.
    ///
    /// Resolution tables are retained; a lingering resource may still
    /// reference the node by name.
    pub async fn unregister(&self, address: &str) -> Result<()> {
        {
            let mut tables = self.tables.write();
            let Some(record) = tables.nodes.get_mut(address) else {
                return Err(Error::NotFound {
                    kind: "node".into(),
                    name: address.into(),
                });
            };
            record.state = NodeState::Offline;
            tables.host_list.retain(|h| h != address);
        }
        self.catalog.delete_node(address).await?;
        info!(address, "node unregistered");
        Ok(())
    }

    /// Resolve a name or hostname to its address. Unknown inputs pass
    /// through unchanged; the transport may still resolve them.
    pub fn resolve(&self, name_or_address: &str) -> String {
        let tables = self.tables.read();
        if let Some(address) = tables.names.get(name_or_address) {
            return address.clone();
        }
        if let Some(address) = tables.hostnames.get(name_or_address) {
            return address.clone();
        }
        name_or_address.to_string()
    }

    /// Reverse of [`resolve`]: the stable display name for an address or
    /// hostname, used for deduplication.
    pub fn normalize(&self, address_or_name: &str) -> String {
        let tables = self.tables.read();
        if let Some(record) = tables.nodes.get(address_or_name) {
            return record.name.clone();
        }
        if let Some(address) = tables.hostnames.get(address_or_name) {
            if let Some(record) = tables.nodes.get(address) {
                return record.name.clone();
            }
        }
        address_or_name.to_string()
    }

    /// Single-host liveness probe; updates state and last-seen.
    pub async fn health(&self, address: &str) -> Result<NodeState> {
        let state = match self
            .executor
            .exec_one(address, "uname -n", Some(PROBE_TIMEOUT))
            .await
        {
            Ok(_) => NodeState::Online,
            Err(err) => {
                warn!(address, "health probe failed: {err}");
                NodeState::Offline
            }
        };

        let record = {
            let mut tables = self.tables.write();
            let Some(record) = tables.nodes.get_mut(address) else {
                return Err(Error::NotFound {
                    kind: "node".into(),
                    name: address.into(),
                });
            };
            record.state = state;
            if state == NodeState::Online {
                record.last_seen = Some(Utc::now());
            }
            record.clone()
        };
        self.catalog.put_node(&record).await?;
        Ok(state)
    }

    /// Probe the replication driver, the promoter daemon and the
    /// resource-agent scripts on one node.
    pub async fn detailed_health(&self, address: &str) -> Result<ComponentsReport> {
        let address = self.resolve(address);
        let opts = ExecOptions::with_timeout(PROBE_TIMEOUT);
        let target = vec![address.clone()];

        let drbd_probe = self.executor.exec(&target, "drbdadm --version", &opts).await;
        let drbd = match drbd_probe.first_success() {
            Some(result) => ComponentStatus {
                installed: true,
                active: None,
                version: parse_drbd_version(&result.output),
            },
            None => ComponentStatus::default(),
        };

        let active_probe = self
            .executor
            .exec(&target, "systemctl is-active drbd-reactor", &opts)
            .await;
        let version_probe = self
            .executor
            .exec(&target, "drbd-reactorctl --version", &opts)
            .await;
        let promoter = ComponentStatus {
            installed: version_probe.first_success().is_some(),
            active: Some(
                active_probe
                    .get(&address)
                    .is_some_and(|r| r.output.trim() == "active"),
            ),
            version: version_probe
                .first_success()
                .map(|r| r.output.trim().to_string()),
        };

        let agents_probe = self
            .executor
            .exec(&target, "test -d /usr/lib/ocf/resource.d", &opts)
            .await;
        let resource_agents = ComponentStatus {
            installed: agents_probe.first_success().is_some(),
            active: None,
            version: None,
        };

        Ok(ComponentsReport {
            address,
            drbd,
            promoter,
            resource_agents,
        })
    }

    /// Snapshot of the active host list, in registration order.
    pub fn host_list(&self) -> Vec<String> {
        self.tables.read().host_list.clone()
    }

    pub fn get(&self, address: &str) -> Option<NodeRecord> {
        self.tables.read().nodes.get(address).cloned()
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        self.tables.read().nodes.values().cloned().collect()
    }

    /// Whether the address belongs to a registered node.
    pub fn is_registered(&self, address: &str) -> bool {
        self.tables.read().nodes.contains_key(address)
    }
}

/// Pull the userland version out of `drbdadm --version` output.
fn parse_drbd_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("DRBDADM_VERSION="))
        .map(|v| v.trim().to_string())
}
