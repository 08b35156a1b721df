//! Resource engine
//!
//! Multi-node orchestration of replicated resources. Every multi-step
//! plan is barriered: a step runs on all member nodes before the next
//! begins, and any step's failure aborts the remainder surfacing the
//! full per-host outcome map. Individual steps are written to be safe
//! to retry.

use crate::catalog::{
    BackingKind, Catalog, FsKind, Protocol, ResourceRecord, VolumeRecord,
};
use crate::cluster::NodeRegistry;
use crate::error::{Error, Result};
use crate::remote::{ExecOptions, RemoteExecutor};
use crate::resource::config::{
    backing_device_path, backing_volume_name, group_overrides, parse_volume_minors, ConfigNode,
    ConfigSpec, ConfigVolume,
};
use crate::resource::status::ResourceStatus;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Paths
// =============================================================================

/// Configuration file the driver reads for one resource.
pub fn config_path(resource: &str) -> String {
    format!("/etc/drbd.d/{resource}.res")
}

/// Stable by-resource device link for one volume.
pub fn drbd_device_path(resource: &str, volume_index: u32) -> String {
    format!("/dev/drbd/by-res/{resource}/{volume_index}")
}

// =============================================================================
// Requests & Views
// =============================================================================

/// Declarative request for a new replicated resource
#[derive(Debug, Clone)]
pub struct CreateResourceRequest {
    pub name: String,
    /// Replication TCP port, unique across live resources
    pub port: u16,
    /// Member nodes, names or addresses, in replication order
    pub nodes: Vec<String>,
    pub protocol: Protocol,
    pub size_gb: u64,
    /// Backing pool name, present on every member node
    pub pool: String,
    pub backing: BackingKind,
    /// Raw `section/key=value` driver-config overrides
    pub overrides: BTreeMap<String, String>,
}

/// Catalog record joined with a live one-peer probe
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDetails {
    pub record: ResourceRecord,
    /// Peer that answered the status probe, if any
    pub probed_on: Option<String>,
    /// Parsed live status; `None` when no peer answered
    pub status: Option<ResourceStatus>,
}

// =============================================================================
// Resource Engine
// =============================================================================

/// Orchestrates replicated resources across their member nodes.
pub struct ResourceEngine {
    executor: Arc<RemoteExecutor>,
    registry: Arc<NodeRegistry>,
    catalog: Catalog,
}

impl ResourceEngine {
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

    // =========================================================================
    // Creation
    // =========================================================================

    /// Materialize a replicated resource across its member nodes.
    ///
    /// Plan: carve backing volumes, render the driver configuration,
    /// distribute it, create replica metadata, bring the resource up,
    /// persist the record. Nothing is carved until every precondition
    /// holds.
    pub async fn create(
        &self,
        request: CreateResourceRequest,
        cancel: CancellationToken,
    ) -> Result<ResourceRecord> {
        info!(resource = %request.name, port = request.port, "creating resource");

        if self.catalog.resource(&request.name).await?.is_some() {
            return Err(Error::AlreadyExists {
                kind: "resource".into(),
                name: request.name,
            });
        }
        if request.nodes.len() < 2 {
            return Err(Error::Precondition(format!(
                "resource {} needs at least two member nodes",
                request.name
            )));
        }
        for existing in self.catalog.resources().await? {
            if existing.port == request.port {
                return Err(Error::Precondition(format!(
                    "port {} is already used by resource {}",
                    request.port, existing.name
                )));
            }
        }

        let addresses = self.resolve_members(&request.nodes)?;
        self.check_pool(&addresses, &request.pool, request.backing).await?;

        // Step 1: carve backing volumes, guarded for safe retry.
        let carve = carve_command(request.backing, &request.pool, &request.name, 0, request.size_gb);
        self.barrier(&addresses, &carve, "carve backing volumes", &cancel)
            .await?;

        // Step 2+3: render the configuration and distribute it.
        let record = ResourceRecord {
            name: request.name.clone(),
            port: request.port,
            nodes: addresses.clone(),
            protocol: request.protocol,
            backing: request.backing,
            volumes: vec![VolumeRecord {
                index: 0,
                minor: ConfigSpec::base_minor(request.port),
                pool: request.pool.clone(),
                size_gb: request.size_gb,
                device_path: backing_device_path(
                    request.backing,
                    &request.pool,
                    &request.name,
                    0,
                ),
            }],
            overrides: request.overrides,
            created_at: Utc::now(),
        };
        self.distribute_config(&record, &cancel).await?;

        // Step 4: replica metadata on every node.
        self.barrier(
            &addresses,
            &format!("drbdadm create-md --force {}", record.name),
            "create metadata",
            &cancel,
        )
        .await?;

        // Step 5: bring up on every node.
        self.barrier(
            &addresses,
            &format!("drbdadm up {}", record.name),
            "bring up",
            &cancel,
        )
        .await?;

        // Step 6: persist.
        self.catalog.put_resource(&record).await?;
        info!(resource = %record.name, nodes = record.nodes.len(), "resource created");
        Ok(record)
    }

    // =========================================================================
    // Role Management
    // =========================================================================

    /// Promote one member node. Mutual exclusion between primaries is
    /// the driver's job; no other node is demoted here.
    pub async fn set_primary(&self, resource: &str, node: &str, force: bool) -> Result<()> {
        let record = self.require(resource).await?;
        let address = self.member_address(&record, node)?;
        let flag = if force { " --force" } else { "" };
        self.executor
            .exec_one(&address, &format!("drbdadm primary{flag} {resource}"), None)
            .await?;
        info!(resource, node = %address, "promoted to primary");
        Ok(())
    }

    /// Demote one member node.
    pub async fn set_secondary(&self, resource: &str, node: &str) -> Result<()> {
        let record = self.require(resource).await?;
        let address = self.member_address(&record, node)?;
        self.executor
            .exec_one(&address, &format!("drbdadm secondary {resource}"), None)
            .await?;
        info!(resource, node = %address, "demoted to secondary");
        Ok(())
    }

    // =========================================================================
    // Volume Management
    // =========================================================================

    /// Add one volume to an existing resource.
    ///
    /// The on-disk configuration of a reachable peer is the authority
    /// for the next free volume index and minor number; the catalog
    /// record only raises the floor so minors never decrease.
    pub async fn add_volume(
        &self,
        resource: &str,
        pool: &str,
        size_gb: u64,
        cancel: CancellationToken,
    ) -> Result<VolumeRecord> {
        let mut record = self.require(resource).await?;
        if record.backing == BackingKind::Zfs {
            return Err(Error::Precondition(format!(
                "resource {resource} is zfs-backed; add-volume supports lvm backing only"
            )));
        }
        let addresses = record.nodes.clone();
        self.check_pool(&addresses, pool, record.backing).await?;

        let peer_config = self.read_peer_config(&record).await?;
        let minors = parse_volume_minors(&peer_config);
        let index = minors
            .iter()
            .map(|(i, _)| i + 1)
            .max()
            .unwrap_or(1)
            .max(record.next_volume_index());
        let minor = minors
            .iter()
            .map(|(_, m)| m + 1)
            .max()
            .unwrap_or(0)
            .max(record.next_minor());

        let volume = VolumeRecord {
            index,
            minor,
            pool: pool.to_string(),
            size_gb,
            device_path: backing_device_path(record.backing, pool, resource, index),
        };
        info!(resource, index, minor, "adding volume");

        let result = self
            .apply_new_volume(&mut record, volume.clone(), &cancel)
            .await;
        if let Err(err) = result {
            // Rollback is best-effort: surface the per-host map and leave
            // the partial state for a retry of the aggregate operation.
            warn!(resource, index, "add-volume failed mid-plan: {err}");
            return Err(err);
        }

        self.catalog.put_resource(&record).await?;
        Ok(volume)
    }

    async fn apply_new_volume(
        &self,
        record: &mut ResourceRecord,
        volume: VolumeRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let addresses = record.nodes.clone();
        let carve = carve_command(
            record.backing,
            &volume.pool,
            &record.name,
            volume.index,
            volume.size_gb,
        );
        self.barrier(&addresses, &carve, "carve backing volume", cancel)
            .await?;

        let index = volume.index;
        record.volumes.push(volume);
        self.distribute_config(record, cancel).await?;

        self.barrier(
            &addresses,
            &format!("drbdadm down {}", record.name),
            "bring down",
            cancel,
        )
        .await?;
        self.barrier(
            &addresses,
            &format!("drbdadm create-md --force {}/{}", record.name, index),
            "create volume metadata",
            cancel,
        )
        .await?;
        self.barrier(
            &addresses,
            &format!("drbdadm up {}", record.name),
            "bring up",
            cancel,
        )
        .await?;
        Ok(())
    }

    /// Grow one volume and let the driver pick up the new size.
    pub async fn resize_volume(
        &self,
        resource: &str,
        index: u32,
        size_gb: u64,
        cancel: CancellationToken,
    ) -> Result<VolumeRecord> {
        let mut record = self.require(resource).await?;
        let volume = record.volume(index).cloned().ok_or_else(|| Error::NotFound {
            kind: "volume".into(),
            name: format!("{resource}/{index}"),
        })?;
        if size_gb <= volume.size_gb {
            return Err(Error::Precondition(format!(
                "volume {resource}/{index} is already {}G; shrink is not supported",
                volume.size_gb
            )));
        }

        let grow = match record.backing {
            BackingKind::Lvm => format!("lvextend -L {}G {}", size_gb, volume.device_path),
            BackingKind::Zfs => format!(
                "zfs set volsize={}G {}/{}",
                size_gb,
                volume.pool,
                backing_volume_name(resource, index)
            ),
        };
        self.barrier(&record.nodes.clone(), &grow, "grow backing volume", &cancel)
            .await?;

        // drbdadm resize runs once; any reachable member will do.
        let mut resized = false;
        for host in &record.nodes {
            if self
                .executor
                .exec_one(host, &format!("drbdadm resize {resource}/{index}"), None)
                .await
                .is_ok()
            {
                resized = true;
                break;
            }
        }
        if !resized {
            return Err(Error::Remote {
                host: record.nodes.join(","),
                reason: format!("no member accepted drbdadm resize {resource}/{index}"),
            });
        }

        for vol in &mut record.volumes {
            if vol.index == index {
                vol.size_gb = size_gb;
            }
        }
        self.catalog.put_resource(&record).await?;
        info!(resource, index, size_gb, "volume resized");
        record
            .volume(index)
            .cloned()
            .ok_or_else(|| Error::Internal("resized volume vanished from record".into()))
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Tear a resource down on every node and forget it.
    ///
    /// Backing storage is deliberately left in place for the operator's
    /// reclaim tooling. Overlays must be removed first.
    pub async fn delete(&self, resource: &str, force: bool, cancel: CancellationToken) -> Result<()> {
        let record = self.require(resource).await?;

        if self.catalog.ha(resource).await?.is_some() {
            return Err(Error::Precondition(format!(
                "resource {resource} has an HA overlay; remove it first"
            )));
        }
        if self
            .catalog
            .gateways()
            .await?
            .iter()
            .any(|g| g.resource == resource)
        {
            return Err(Error::Precondition(format!(
                "resource {resource} is referenced by a gateway; delete the gateway first"
            )));
        }

        let opts = ExecOptions::with_cancel(cancel);
        let down = self
            .executor
            .exec(&record.nodes, &format!("drbdadm down {resource}"), &opts)
            .await;
        if !down.all_ok() {
            if force {
                warn!(resource, failed = ?down.failed_hosts(), "forcing delete past down failures");
            } else {
                return Err(Error::partial("bring down", down));
            }
        }

        let removed = self
            .executor
            .remove(&record.nodes, &config_path(resource), &opts)
            .await;
        if !removed.all_ok() && !force {
            return Err(Error::partial("remove configuration", removed));
        }

        self.catalog.delete_resource(resource).await?;
        info!(resource, "resource deleted");
        Ok(())
    }

    // =========================================================================
    // Filesystem & Mount
    // =========================================================================

    /// Create a filesystem on one volume. The target node must hold the
    /// primary role; an existing filesystem is kept unless `force`.
    pub async fn create_filesystem(
        &self,
        resource: &str,
        index: u32,
        fs: FsKind,
        node: &str,
        force: bool,
    ) -> Result<()> {
        let record = self.require(resource).await?;
        if record.volume(index).is_none() {
            return Err(Error::NotFound {
                kind: "volume".into(),
                name: format!("{resource}/{index}"),
            });
        }
        let address = self.member_address(&record, node)?;

        let status = self.status_on(&address, resource).await?;
        if !status.local_role.is_primary() {
            return Err(Error::Precondition(format!(
                "node {node} must hold the primary role of {resource} to format it"
            )));
        }

        let device = drbd_device_path(resource, index);
        if let Some(existing) = self.probe_filesystem(&address, &device).await {
            if !force {
                info!(resource, index, %existing, "filesystem already present, skipping mkfs");
                return Ok(());
            }
        }

        // The tool-level force flag rides only on an explicit `force`;
        // a plain format never overwrites signatures behind blkid's back.
        let command = if force {
            format!("{} {} {}", fs.mkfs_tool(), fs.force_flag(), device)
        } else {
            format!("{} {}", fs.mkfs_tool(), device)
        };
        self.executor.exec_one(&address, &command, None).await?;
        info!(resource, index, fs = %fs, node = %address, "filesystem created");
        Ok(())
    }

    /// Mount one volume's by-resource device link. Safe to repeat.
    pub async fn mount(
        &self,
        resource: &str,
        index: u32,
        path: &str,
        node: &str,
        fs: FsKind,
    ) -> Result<()> {
        let record = self.require(resource).await?;
        let address = self.member_address(&record, node)?;
        let device = drbd_device_path(resource, index);
        self.executor
            .exec_one(
                &address,
                &format!("mkdir -p {path} && {{ mountpoint -q {path} || mount -t {fs} {device} {path}; }}"),
                None,
            )
            .await?;
        info!(resource, index, path, node = %address, "volume mounted");
        Ok(())
    }

    /// Inverse of [`mount`]. An already-unmounted path is not an error.
    pub async fn unmount(&self, resource: &str, path: &str, node: &str) -> Result<()> {
        let record = self.require(resource).await?;
        let address = self.member_address(&record, node)?;
        self.executor
            .exec_one(
                &address,
                &format!("! mountpoint -q {path} || umount {path}"),
                None,
            )
            .await?;
        info!(resource, path, node = %address, "volume unmounted");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The declared record joined with a live probe of one reachable
    /// peer. Probe failure degrades to sentinel fields, never an error.
    pub async fn get(&self, resource: &str) -> Result<ResourceDetails> {
        let record = self.require(resource).await?;

        let peers = record.nodes.clone();
        for host in peers {
            match self.status_on(&host, resource).await {
                Ok(status) => {
                    return Ok(ResourceDetails {
                        record,
                        probed_on: Some(host),
                        status: Some(status),
                    });
                }
                Err(err) => warn!(resource, host = %host, "status probe failed: {err}"),
            }
        }

        Ok(ResourceDetails {
            record,
            probed_on: None,
            status: None,
        })
    }

    pub async fn list(&self) -> Result<Vec<ResourceRecord>> {
        self.catalog.resources().await
    }

    /// Parse the live status of one resource as seen from one host.
    pub(crate) async fn status_on(&self, host: &str, resource: &str) -> Result<ResourceStatus> {
        let result = self
            .executor
            .exec_one(host, &format!("drbdadm status {resource}"), None)
            .await?;
        Ok(ResourceStatus::parse(resource, &result.output))
    }

    pub(crate) async fn require(&self, resource: &str) -> Result<ResourceRecord> {
        self.catalog
            .resource(resource)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "resource".into(),
                name: resource.into(),
            })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resolve_members(&self, nodes: &[String]) -> Result<Vec<String>> {
        let mut addresses = Vec::with_capacity(nodes.len());
        for node in nodes {
            let address = self.registry.resolve(node);
            if !self.registry.is_registered(&address) {
                return Err(Error::Precondition(format!(
                    "node {node} is not a registered storage node"
                )));
            }
            addresses.push(address);
        }
        Ok(addresses)
    }

    fn member_address(&self, record: &ResourceRecord, node: &str) -> Result<String> {
        let address = self.registry.resolve(node);
        if record.nodes.contains(&address) {
            Ok(address)
        } else {
            Err(Error::Precondition(format!(
                "node {node} is not a member of resource {}",
                record.name
            )))
        }
    }

    // Read-only probe; runs without the caller's cancellation token so a
    // cancelled request surfaces as partial failure, not a bogus
    // missing-pool verdict.
    async fn check_pool(
        &self,
        addresses: &[String],
        pool: &str,
        backing: BackingKind,
    ) -> Result<()> {
        let probe = match backing {
            BackingKind::Lvm => format!("vgs {pool}"),
            BackingKind::Zfs => format!("zpool list {pool}"),
        };
        let report = self.executor.exec(addresses, &probe, &ExecOptions::default()).await;
        if report.all_ok() {
            Ok(())
        } else {
            Err(Error::Precondition(format!(
                "pool {pool} is missing on {}",
                report.failed_hosts().join(", ")
            )))
        }
    }

    /// Render the configuration for a record and place it on every
    /// member node.
    async fn distribute_config(
        &self,
        record: &ResourceRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = ConfigSpec {
            name: record.name.clone(),
            port: record.port,
            protocol: record.protocol,
            nodes: record
                .nodes
                .iter()
                .map(|address| ConfigNode {
                    name: self.registry.normalize(address),
                    address: address.clone(),
                })
                .collect(),
            volumes: record
                .volumes
                .iter()
                .map(|v| ConfigVolume {
                    index: v.index,
                    minor: v.minor,
                    device_path: v.device_path.clone(),
                })
                .collect(),
            overrides: group_overrides(record.overrides.clone()),
        };

        let report = self
            .executor
            .distribute(
                &record.nodes,
                &spec.render(),
                &config_path(&record.name),
                None,
                &ExecOptions::with_cancel(cancel.clone()),
            )
            .await;
        report.into_result("distribute configuration").map(|_| ())
    }

    /// First reachable peer's on-disk configuration.
    async fn read_peer_config(&self, record: &ResourceRecord) -> Result<String> {
        let path = config_path(&record.name);
        let mut last_err = None;
        for host in &record.nodes {
            match self.executor.exec_one(host, &format!("cat {path}"), None).await {
                Ok(result) => return Ok(result.output),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Internal(format!("resource {} has no member nodes", record.name))
        }))
    }

    /// Run one barriered plan step across all hosts.
    async fn barrier(
        &self,
        hosts: &[String],
        command: &str,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let report = self
            .executor
            .exec(hosts, command, &ExecOptions::with_cancel(cancel.clone()))
            .await;
        report.into_result(operation).map(|_| ())
    }

    async fn probe_filesystem(&self, address: &str, device: &str) -> Option<String> {
        let report = self
            .executor
            .exec(
                &[address.to_string()],
                &format!("blkid -o value -s TYPE {device}"),
                &ExecOptions::default(),
            )
            .await;
        report
            .get(address)
            .filter(|r| r.success && !r.output.trim().is_empty())
            .map(|r| r.output.trim().to_string())
    }
}

/// Guarded carve command: creates the backing volume only when it does
/// not exist yet, so a retried step is a no-op.
fn carve_command(
    backing: BackingKind,
    pool: &str,
    resource: &str,
    index: u32,
    size_gb: u64,
) -> String {
    let volume = backing_volume_name(resource, index);
    match backing {
        BackingKind::Lvm => format!(
            "lvs {pool}/{volume} >/dev/null 2>&1 || lvcreate -y -n {volume} -L {size_gb}G {pool}"
        ),
        BackingKind::Zfs => format!(
            "zfs list {pool}/{volume} >/dev/null 2>&1 || zfs create -s -V {size_gb}G {pool}/{volume}"
        ),
    }
}
