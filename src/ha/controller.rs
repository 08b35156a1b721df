//! HA controller
//!
//! Layers a filesystem, mount unit, floating address and service set
//! under the on-node promoter daemon, then cedes steady-state ownership
//! of the stack to it. Nothing is written to any node until every
//! supplied service validates on every node.

use crate::catalog::{Catalog, FsKind, HaRecord, ResourceRecord};
use crate::error::{Error, Result};
use crate::ha::promoter;
use crate::remote::{ExecOptions, RemoteExecutor};
use crate::resource::engine::drbd_device_path;
use crate::resource::ResourceEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Deadline for service-manager and promoter reloads
const RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Request
// =============================================================================

/// Request to put a resource under promoter control
#[derive(Debug, Clone)]
pub struct MakeHaRequest {
    pub resource: String,
    /// Service units the promoter starts on the primary, in order
    pub services: Vec<String>,
    pub mount_point: Option<String>,
    pub fs_kind: Option<FsKind>,
    /// Floating address, CIDR or bare
    pub vip: Option<String>,
}

// =============================================================================
// HA Controller
// =============================================================================

/// Converts replicated resources into promoter-managed HA services.
pub struct HaController {
    executor: Arc<RemoteExecutor>,
    engine: Arc<ResourceEngine>,
    catalog: Catalog,
}

impl HaController {
    pub fn new(
        executor: Arc<RemoteExecutor>,
        engine: Arc<ResourceEngine>,
        catalog: Catalog,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            engine,
            catalog,
        })
    }

    // =========================================================================
    // Bring-Up
    // =========================================================================

    /// Put a resource under promoter control.
    ///
    /// Returns the promoter snippet path. Pre-existing data under the
    /// mount point is snapshotted to a host-local backup before the
    /// handoff and restored onto the new primary afterwards; the backup
    /// directory is retained, and a failed restore degrades to a
    /// warning because the promoter already owns a healthy stack.
    pub async fn make_ha(&self, request: MakeHaRequest) -> Result<String> {
        let record = self.engine.require(&request.resource).await?;
        let resource = &record.name;
        let nodes = record.nodes.clone();
        info!(resource, services = request.services.len(), "starting HA bring-up");

        if request.mount_point.is_some() != request.fs_kind.is_some() {
            return Err(Error::Precondition(
                "mount point and filesystem kind must be supplied together".into(),
            ));
        }

        // Step 1: the resource must be up everywhere; adjust covers the
        // already-up case.
        self.executor
            .exec(
                &nodes,
                &format!("drbdadm up {resource} 2>/dev/null || drbdadm adjust {resource}"),
                &ExecOptions::default(),
            )
            .await
            .into_result("ensure resource up")?;

        // Step 2: exactly one node must hold primary before mkfs.
        let primary = match self.find_primary(&record).await {
            Some(primary) => primary,
            None => {
                let first = nodes[0].clone();
                info!(resource, node = %first, "no primary found, force-promoting");
                self.engine.set_primary(resource, &first, true).await?;
                first
            }
        };

        // Step 3: stack a filesystem unless one is already there.
        if let (Some(_), Some(fs)) = (&request.mount_point, request.fs_kind) {
            self.engine
                .create_filesystem(resource, 0, fs, &primary, false)
                .await?;
        }

        // Step 4: all-or-nothing service validation. No file lands on
        // any node while any service is missing anywhere.
        self.validate_services(&nodes, &request.services).await?;

        // Step 5: the promoter needs exclusive control of the units.
        for service in &request.services {
            let report = self
                .executor
                .exec(&nodes, &format!("systemctl disable --now {service}"), &ExecOptions::default())
                .await;
            if !report.all_ok() {
                warn!(resource, service, failed = ?report.failed_hosts(), "stop/disable was partial");
            }
        }

        // Step 6: snapshot pre-existing data before the handoff.
        if let Some(mount_point) = &request.mount_point {
            let backup = promoter::backup_dir(mount_point);
            let report = self
                .executor
                .exec(
                    &nodes,
                    &format!("! test -d {mount_point} || cp -a {mount_point} {backup}"),
                    &ExecOptions::default(),
                )
                .await;
            if !report.all_ok() {
                warn!(resource, failed = ?report.failed_hosts(), "data backup was partial");
            }
        }

        // Step 7: mount unit on every node.
        if let (Some(mount_point), Some(fs)) = (&request.mount_point, request.fs_kind) {
            let unit = promoter::render_mount_unit(
                mount_point,
                &drbd_device_path(resource, 0),
                fs,
            );
            self.executor
                .distribute(
                    &nodes,
                    &unit,
                    &promoter::mount_unit_path(mount_point),
                    Some("systemctl daemon-reload"),
                    &ExecOptions::default(),
                )
                .await
                .into_result("distribute mount unit")?;
        }

        // Step 8: promoter snippet, then reload the daemon.
        let mut start = Vec::new();
        if let Some(mount_point) = &request.mount_point {
            start.push(promoter::mount_unit_name(mount_point));
        }
        if let Some(vip) = &request.vip {
            start.push(promoter::vip_unit_name(vip));
        }
        start.extend(request.services.iter().cloned());

        let snippet_path = promoter::snippet_path(resource);
        self.executor
            .distribute(
                &nodes,
                &promoter::render_snippet(resource, &start),
                &snippet_path,
                None,
                &ExecOptions::default(),
            )
            .await
            .into_result("distribute promoter snippet")?;
        self.executor
            .exec(
                &nodes,
                "systemctl reload drbd-reactor",
                &ExecOptions::with_timeout(RELOAD_TIMEOUT),
            )
            .await
            .into_result("reload promoter daemon")?;

        // Step 9: restore the snapshot onto whichever node now holds
        // primary. Best-effort; the backup is retained either way.
        if let Some(mount_point) = &request.mount_point {
            let target = self.find_primary(&record).await.unwrap_or(primary);
            let backup = promoter::backup_dir(mount_point);
            let restore = format!("! test -d {backup} || cp -a {backup}/. {mount_point}");
            match self.executor.exec_one(&target, &restore, None).await {
                Ok(_) => info!(resource, node = %target, backup = %backup, "data restored, backup retained"),
                Err(err) => warn!(
                    resource,
                    node = %target,
                    backup = %backup,
                    "restore failed, recover manually from the backup: {err}"
                ),
            }
        }

        // Step 10: persist the overlay.
        let ha = HaRecord {
            resource: resource.clone(),
            vip: request.vip,
            mount_point: request.mount_point,
            fs_kind: request.fs_kind,
            services: request.services,
        };
        self.catalog.put_ha(&ha).await?;

        info!(resource, snippet = %snippet_path, "HA bring-up complete");
        Ok(snippet_path)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict the current primary through the promoter, forcing a
    /// failover to another member node.
    pub async fn evict(&self, resource: &str) -> Result<()> {
        let record = self.engine.require(resource).await?;
        if self.catalog.ha(resource).await?.is_none() {
            return Err(Error::Precondition(format!(
                "resource {resource} is not under promoter control"
            )));
        }

        let primary = self.find_primary(&record).await.ok_or_else(|| {
            Error::Precondition(format!("resource {resource} has no primary to evict"))
        })?;

        self.executor
            .exec_one(
                &primary,
                &format!("drbd-reactorctl evict {}", promoter::snippet_id(resource)),
                None,
            )
            .await?;
        info!(resource, node = %primary, "primary evicted");
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Remove the promoter overlay from every node and forget it.
    /// Missing files are tolerated; teardown is safe to repeat.
    pub async fn remove_ha(&self, resource: &str) -> Result<()> {
        let record = self.engine.require(resource).await?;
        let ha = self.catalog.ha(resource).await?.ok_or_else(|| Error::NotFound {
            kind: "ha".into(),
            name: resource.into(),
        })?;
        let nodes = record.nodes.clone();

        self.executor
            .remove(&nodes, &promoter::snippet_path(resource), &ExecOptions::default())
            .await
            .into_result("remove promoter snippet")?;

        if let Some(mount_point) = &ha.mount_point {
            self.executor
                .remove(&nodes, &promoter::mount_unit_path(mount_point), &ExecOptions::default())
                .await
                .into_result("remove mount unit")?;
        }

        let reload = self
            .executor
            .exec(
                &nodes,
                "systemctl daemon-reload && systemctl reload drbd-reactor",
                &ExecOptions::with_timeout(RELOAD_TIMEOUT),
            )
            .await;
        if !reload.all_ok() {
            warn!(resource, failed = ?reload.failed_hosts(), "post-teardown reload was partial");
        }

        self.catalog.delete_ha(resource).await?;
        info!(resource, "HA overlay removed");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Node currently holding the primary role, probing the controller's
    /// own host first to avoid a remote hop.
    async fn find_primary(&self, record: &ResourceRecord) -> Option<String> {
        let mut ordered = record.nodes.clone();
        ordered.sort_by_key(|host| !self.executor.is_local(host));

        for host in &ordered {
            match self.engine.status_on(host, &record.name).await {
                Ok(status) if status.local_role.is_primary() => return Some(host.clone()),
                Ok(_) => {}
                Err(err) => warn!(resource = %record.name, host = %host, "primary probe failed: {err}"),
            }
        }
        None
    }

    /// Every service must report `LoadState=loaded` on every node.
    async fn validate_services(&self, nodes: &[String], services: &[String]) -> Result<()> {
        for service in services {
            let report = self
                .executor
                .exec(
                    nodes,
                    &format!("systemctl show -p LoadState {service}"),
                    &ExecOptions::default(),
                )
                .await;
            for host in nodes {
                let loaded = report
                    .get(host)
                    .is_some_and(|r| r.success && r.output.contains("LoadState=loaded"));
                if !loaded {
                    return Err(Error::Precondition(format!(
                        "service {service} is not loaded on {host}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackingKind, CatalogConfig, FileCatalog, Protocol};
    use crate::cluster::NodeRegistry;
    use crate::remote::transport::mock::MockTransport;
    use crate::remote::{ExecutorConfig, LocalIdentity};
    use crate::resource::CreateResourceRequest;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        mock: Arc<MockTransport>,
        ha: Arc<HaController>,
        catalog: Catalog,
    }

    async fn setup(dir: &tempfile::TempDir) -> Fixture {
        let mock = Arc::new(MockTransport::new());
        let executor = RemoteExecutor::new(
            mock.clone(),
            LocalIdentity::new("ctrl-1", []),
            ExecutorConfig::default(),
        );
        let store = FileCatalog::open(CatalogConfig {
            path: dir.path().join("state.db"),
            open_timeout: Duration::from_millis(500),
        })
        .await
        .unwrap();
        let catalog = Catalog::new(store);
        let registry = NodeRegistry::new(executor.clone(), catalog.clone());
        let engine = ResourceEngine::new(executor.clone(), registry.clone(), catalog.clone());

        mock.respond_on("10.0.0.1", "uname -n", "n1\n");
        mock.respond_on("10.0.0.2", "uname -n", "n2\n");
        registry.register("n1", "10.0.0.1").await.unwrap();
        registry.register("n2", "10.0.0.2").await.unwrap();
        engine
            .create(
                CreateResourceRequest {
                    name: "r1".into(),
                    port: 7001,
                    nodes: vec!["n1".into(), "n2".into()],
                    protocol: Protocol::C,
                    size_gb: 4,
                    pool: "pool0".into(),
                    backing: BackingKind::Lvm,
                    overrides: BTreeMap::new(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let ha = HaController::new(executor, engine, catalog.clone());
        Fixture { mock, ha, catalog }
    }

    fn full_request() -> MakeHaRequest {
        MakeHaRequest {
            resource: "r1".into(),
            services: vec!["app.service".into()],
            mount_point: Some("/srv/app".into()),
            fs_kind: Some(FsKind::Ext4),
            vip: Some("10.0.0.100/24".into()),
        }
    }

    fn script_loaded_services(mock: &MockTransport) {
        mock.respond("systemctl show -p LoadState app.service", "LoadState=loaded\n");
    }

    fn script_primary(mock: &MockTransport, host: &str) {
        mock.respond_on(
            host,
            "drbdadm status r1",
            "r1 role:Primary\n  disk:UpToDate\n",
        );
    }

    #[tokio::test]
    async fn test_make_ha_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        script_loaded_services(&fx.mock);
        script_primary(&fx.mock, "10.0.0.1");

        let snippet_path = fx.ha.make_ha(full_request()).await.unwrap();
        assert_eq!(snippet_path, "/etc/drbd-reactor.d/sds-ha-r1.toml");

        for host in ["10.0.0.1", "10.0.0.2"] {
            assert!(fx.mock.saw(host, "systemctl disable --now app.service"));

            let unit = fx
                .mock
                .distributed_content(host, "/etc/systemd/system/srv-app.mount")
                .expect("mount unit distributed");
            assert!(unit.contains("Where=/srv/app\n"));
            assert!(unit.contains("Type=ext4\n"));
            assert!(fx.mock.saw(host, "systemctl daemon-reload"));

            let snippet = fx
                .mock
                .distributed_content(host, "/etc/drbd-reactor.d/sds-ha-r1.toml")
                .expect("snippet distributed");
            let mount = snippet.find("\"srv-app.mount\"").unwrap();
            let vip = snippet.find("\"service-ip@10.0.0.100-24.service\"").unwrap();
            let svc = snippet.find("\"app.service\"").unwrap();
            assert!(mount < vip && vip < svc);
            assert!(fx.mock.saw(host, "systemctl reload drbd-reactor"));
        }

        // Filesystem went onto the primary; no force flag without an
        // explicit force from the caller.
        assert!(fx.mock.saw("10.0.0.1", "mkfs.ext4 /dev/drbd/by-res/r1/0"));
        assert!(!fx.mock.saw("10.0.0.1", "mkfs.ext4 -F"));
        // Data snapshot before the handoff, restore after, backup retained.
        assert!(fx.mock.saw("10.0.0.1", "cp -a /srv/app /tmp/ha_backup_srv-app"));
        assert!(fx.mock.saw("10.0.0.1", "cp -a /tmp/ha_backup_srv-app/. /srv/app"));
        assert!(!fx.mock.saw("10.0.0.1", "rm -rf /tmp/ha_backup_srv-app"));

        let ha = fx.catalog.ha("r1").await.unwrap().unwrap();
        assert_eq!(ha.services, vec!["app.service"]);
        assert_eq!(ha.vip.as_deref(), Some("10.0.0.100/24"));
    }

    #[tokio::test]
    async fn test_make_ha_force_promotes_when_no_primary() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        script_loaded_services(&fx.mock);
        // Both peers report Secondary.
        fx.mock.respond("drbdadm status r1", "r1 role:Secondary\n");

        fx.ha
            .make_ha(MakeHaRequest {
                resource: "r1".into(),
                services: vec!["app.service".into()],
                mount_point: None,
                fs_kind: None,
                vip: None,
            })
            .await
            .unwrap();

        assert!(fx.mock.saw("10.0.0.1", "drbdadm primary --force r1"));
        // No mount point: no mount unit, no backup, no restore.
        assert!(!fx.mock.saw("10.0.0.1", "/etc/systemd/system/"));
        assert!(!fx.mock.saw("10.0.0.1", "ha_backup"));
    }

    #[tokio::test]
    async fn test_make_ha_missing_service_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        script_primary(&fx.mock, "10.0.0.1");
        fx.mock.respond_on(
            "10.0.0.1",
            "systemctl show -p LoadState app.service",
            "LoadState=loaded\n",
        );
        fx.mock.respond_on(
            "10.0.0.2",
            "systemctl show -p LoadState app.service",
            "LoadState=not-found\n",
        );

        let err = fx.ha.make_ha(full_request()).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        for host in ["10.0.0.1", "10.0.0.2"] {
            assert!(fx.mock.distributed_content(host, "/etc/systemd/system/srv-app.mount").is_none());
            assert!(fx.mock.distributed_content(host, "/etc/drbd-reactor.d/sds-ha-r1.toml").is_none());
        }
        assert!(fx.catalog.ha("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_targets_current_primary() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        script_loaded_services(&fx.mock);
        script_primary(&fx.mock, "10.0.0.1");
        fx.ha.make_ha(full_request()).await.unwrap();

        // Failover moved primary to the second node.
        fx.mock.respond_on("10.0.0.1", "drbdadm status r1", "r1 role:Secondary\n");
        script_primary(&fx.mock, "10.0.0.2");

        fx.ha.evict("r1").await.unwrap();
        assert!(fx.mock.saw("10.0.0.2", "drbd-reactorctl evict sds-ha-r1"));
        assert!(!fx.mock.saw("10.0.0.1", "drbd-reactorctl evict"));
    }

    #[tokio::test]
    async fn test_evict_without_overlay_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        let err = fx.ha.evict("r1").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_remove_ha_deletes_artifacts_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        script_loaded_services(&fx.mock);
        script_primary(&fx.mock, "10.0.0.1");
        fx.ha.make_ha(full_request()).await.unwrap();

        fx.ha.remove_ha("r1").await.unwrap();

        for host in ["10.0.0.1", "10.0.0.2"] {
            assert!(fx.mock.saw(host, "rm -f /etc/drbd-reactor.d/sds-ha-r1.toml"));
            assert!(fx.mock.saw(host, "rm -f /etc/systemd/system/srv-app.mount"));
        }
        assert!(fx.catalog.ha("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mount_point_without_fs_kind_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        let mut request = full_request();
        request.fs_kind = None;

        let err = fx.ha.make_ha(request).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
