//! Pool manager
//!
//! Creates and tracks the local storage containers replica volumes are
//! carved from: LVM volume groups and ZFS pools. All node interaction
//! goes through the remote executor with well-known privileged commands.

use crate::catalog::{Catalog, PoolKind, PoolRecord};
use crate::cluster::NodeRegistry;
use crate::error::{Error, Result};
use crate::remote::{ExecOptions, RemoteExecutor};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Listing Commands
// =============================================================================

/// Machine-readable volume-group listing, sizes in bytes
const VGS_LIST: &str =
    "vgs --noheadings --separator '|' --units b --nosuffix -o vg_name,vg_size,vg_free";

/// Machine-readable ZFS pool listing, sizes in bytes
const ZPOOL_LIST: &str = "zpool list -Hp -o name,size,free";

impl PoolRecord {
    /// Capacity reported in gigabytes; stored bytes stay exact.
    pub fn total_gb(&self) -> u64 {
        self.total_bytes >> 30
    }

    pub fn free_gb(&self) -> u64 {
        self.free_bytes >> 30
    }
}

// =============================================================================
// Pool Manager
// =============================================================================

/// Manages volume groups and ZFS pools across the cluster.
pub struct PoolManager {
    executor: Arc<RemoteExecutor>,
    registry: Arc<NodeRegistry>,
    catalog: Catalog,
}

impl PoolManager {
    pub fn new(
        executor: Arc<RemoteExecutor>,
        registry: Arc<NodeRegistry>,
        catalog: Catalog,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            registry,
            catalog,
        })
    }

    /// Create a pool from the given devices on one node.
    ///
    /// For the volume-group backing the devices are initialized as
    /// physical volumes first; ZFS assembles the pool directly.
    pub async fn create(
        &self,
        node: &str,
        name: &str,
        kind: PoolKind,
        devices: &[String],
    ) -> Result<PoolRecord> {
        if devices.is_empty() {
            return Err(Error::Precondition(format!(
                "pool {name} needs at least one member device"
            )));
        }
        let address = self.registry.resolve(node);
        let device_list = devices.join(" ");

        match kind {
            PoolKind::VolumeGroup => {
                self.executor
                    .exec_one(&address, &format!("pvcreate {device_list}"), None)
                    .await?;
                self.executor
                    .exec_one(&address, &format!("vgcreate {name} {device_list}"), None)
                    .await?;
            }
            PoolKind::ZfsPool => {
                self.executor
                    .exec_one(&address, &format!("zpool create {name} {device_list}"), None)
                    .await?;
            }
        }

        let mut record = self
            .probe(&address, name, kind)
            .await?
            .unwrap_or(PoolRecord {
                name: name.to_string(),
                kind,
                node: address.clone(),
                total_bytes: 0,
                free_bytes: 0,
                devices: vec![],
            });
        record.devices = devices.to_vec();
        self.catalog.put_pool(&record).await?;

        info!(node = %address, pool = name, kind = %kind, "pool created");
        Ok(record)
    }

    /// List pools across the given nodes (or every registered node).
    ///
    /// A pool seen under the same (normalized host, name) pair on
    /// multiple probes is reported once.
    pub async fn list(&self, nodes: Option<&[String]>) -> Result<Vec<PoolRecord>> {
        let hosts: Vec<String> = match nodes {
            Some(nodes) => nodes.iter().map(|n| self.registry.resolve(n)).collect(),
            None => self.registry.host_list(),
        };

        let mut pools = Vec::new();
        let mut seen = BTreeSet::new();
        let opts = ExecOptions::default();

        let vg_report = self.executor.exec(&hosts, VGS_LIST, &opts).await;
        let zfs_report = self.executor.exec(&hosts, ZPOOL_LIST, &opts).await;

        for host in &hosts {
            if let Some(result) = vg_report.get(host) {
                if result.success {
                    for record in parse_vgs(host, &result.output) {
                        if seen.insert((self.registry.normalize(host), record.name.clone())) {
                            pools.push(record);
                        }
                    }
                } else {
                    warn!(host, "volume-group listing failed, skipping host");
                }
            }
            if let Some(result) = zfs_report.get(host) {
                if result.success {
                    for record in parse_zpool(host, &result.output) {
                        if seen.insert((self.registry.normalize(host), record.name.clone())) {
                            pools.push(record);
                        }
                    }
                }
            }
        }

        Ok(pools)
    }

    /// Inspect one pool on one node from a live probe.
    pub async fn get(&self, node: &str, name: &str) -> Result<PoolRecord> {
        let address = self.registry.resolve(node);
        for kind in [PoolKind::VolumeGroup, PoolKind::ZfsPool] {
            if let Some(record) = self.probe(&address, name, kind).await? {
                return Ok(record);
            }
        }
        Err(Error::NotFound {
            kind: "pool".into(),
            name: format!("{node}/{name}"),
        })
    }

    /// Grow a pool with additional devices.
    pub async fn extend(&self, node: &str, name: &str, devices: &[String]) -> Result<PoolRecord> {
        if devices.is_empty() {
            return Err(Error::Precondition(format!(
                "extending pool {name} needs at least one device"
            )));
        }
        let address = self.registry.resolve(node);
        let existing = self.get(&address, name).await?;
        let device_list = devices.join(" ");

        match existing.kind {
            PoolKind::VolumeGroup => {
                self.executor
                    .exec_one(&address, &format!("pvcreate {device_list}"), None)
                    .await?;
                self.executor
                    .exec_one(&address, &format!("vgextend {name} {device_list}"), None)
                    .await?;
            }
            PoolKind::ZfsPool => {
                self.executor
                    .exec_one(&address, &format!("zpool add {name} {device_list}"), None)
                    .await?;
            }
        }

        let mut record = self
            .probe(&address, name, existing.kind)
            .await?
            .unwrap_or(existing);
        let mut devices_all = record.devices.clone();
        devices_all.extend(devices.iter().cloned());
        record.devices = devices_all;
        self.catalog.put_pool(&record).await?;
        info!(node = %address, pool = name, "pool extended");
        Ok(record)
    }

    /// Destroy a pool. Fails if the tool reports it busy.
    pub async fn destroy(&self, node: &str, name: &str) -> Result<()> {
        let address = self.registry.resolve(node);
        let existing = self.get(&address, name).await?;

        let command = match existing.kind {
            PoolKind::VolumeGroup => format!("vgremove -f {name}"),
            PoolKind::ZfsPool => format!("zpool destroy {name}"),
        };
        self.executor.exec_one(&address, &command, None).await?;
        self.catalog.delete_pool(&address, name).await?;
        info!(node = %address, pool = name, "pool destroyed");
        Ok(())
    }

    /// Probe one pool of a known kind; `None` when the tool does not
    /// list it.
    async fn probe(&self, address: &str, name: &str, kind: PoolKind) -> Result<Option<PoolRecord>> {
        let command = match kind {
            PoolKind::VolumeGroup => format!("{VGS_LIST} {name}"),
            PoolKind::ZfsPool => format!("{ZPOOL_LIST} {name}"),
        };
        let report = self
            .executor
            .exec(&[address.to_string()], &command, &ExecOptions::default())
            .await;
        let Some(result) = report.get(address) else {
            return Ok(None);
        };
        if !result.success {
            return Ok(None);
        }
        let parsed = match kind {
            PoolKind::VolumeGroup => parse_vgs(address, &result.output),
            PoolKind::ZfsPool => parse_zpool(address, &result.output),
        };
        Ok(parsed.into_iter().find(|p| p.name == name))
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

/// Split `vgs` separator output into pool records.
fn parse_vgs(node: &str, output: &str) -> Vec<PoolRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let total = parse_bytes(fields.next()?)?;
            let free = parse_bytes(fields.next()?)?;
            Some(PoolRecord {
                name: name.to_string(),
                kind: PoolKind::VolumeGroup,
                node: node.to_string(),
                total_bytes: total,
                free_bytes: free,
                devices: vec![],
            })
        })
        .collect()
}

/// Split `zpool list -Hp` tab output into pool records.
fn parse_zpool(node: &str, output: &str) -> Vec<PoolRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('\t');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let total = parse_bytes(fields.next()?)?;
            let free = parse_bytes(fields.next()?)?;
            Some(PoolRecord {
                name: name.to_string(),
                kind: PoolKind::ZfsPool,
                node: node.to_string(),
                total_bytes: total,
                free_bytes: free,
                devices: vec![],
            })
        })
        .collect()
}

/// Byte counts as the tools print them: plain integers, with an optional
/// trailing `B` from `vgs --units b`.
fn parse_bytes(field: &str) -> Option<u64> {
    field.trim().trim_end_matches(['B', 'b']).parse().ok()
}
