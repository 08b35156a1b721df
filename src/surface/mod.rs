//! Control surface
//!
//! Request dispatch binding the outward RPC layer to the engine and
//! controllers. Normalizes hostnames to addresses before dispatch and
//! serializes mutations per resource name; operations on different
//! resources proceed in parallel.

use crate::catalog::{
    Catalog, FsKind, GatewayKind, GatewayRecord, HaRecord, NodeRecord, PoolKind, PoolRecord,
    ResourceRecord, VolumeRecord,
};
use crate::cluster::{ComponentsReport, NodeRegistry};
use crate::error::Result;
use crate::gateway::GatewayBridge;
use crate::ha::{HaController, MakeHaRequest};
use crate::resource::{CreateResourceRequest, ResourceDetails, ResourceEngine};
use crate::storage::PoolManager;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Binds external requests to the managers. Owns the per-resource
/// serialization the engine relies on: the surface never admits two
/// concurrent mutations of the same resource name.
pub struct ControlSurface {
    registry: Arc<NodeRegistry>,
    pools: Arc<PoolManager>,
    engine: Arc<ResourceEngine>,
    ha: Arc<HaController>,
    gateways: Arc<GatewayBridge>,
    catalog: Catalog,
    locks: parking_lot::Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl ControlSurface {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pools: Arc<PoolManager>,
        engine: Arc<ResourceEngine>,
        ha: Arc<HaController>,
        gateways: Arc<GatewayBridge>,
        catalog: Catalog,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pools,
            engine,
            ha,
            gateways,
            catalog,
            locks: parking_lot::Mutex::new(BTreeMap::new()),
        })
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn node_register(&self, name: &str, address: &str) -> Result<NodeRecord> {
        self.registry.register(name, address).await
    }

    pub async fn node_unregister(&self, node: &str) -> Result<()> {
        let address = self.registry.resolve(node);
        self.registry.unregister(&address).await
    }

    pub fn node_list(&self) -> Vec<NodeRecord> {
        self.registry.list()
    }

    pub async fn node_health(&self, node: &str) -> Result<crate::catalog::NodeState> {
        let address = self.registry.resolve(node);
        self.registry.health(&address).await
    }

    pub async fn node_components(&self, node: &str) -> Result<ComponentsReport> {
        self.registry.detailed_health(node).await
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub async fn pool_create(
        &self,
        node: &str,
        name: &str,
        kind: PoolKind,
        devices: Vec<String>,
    ) -> Result<PoolRecord> {
        self.pools.create(node, name, kind, &devices).await
    }

    pub async fn pool_list(&self, nodes: Option<Vec<String>>) -> Result<Vec<PoolRecord>> {
        self.pools.list(nodes.as_deref()).await
    }

    pub async fn pool_extend(
        &self,
        node: &str,
        name: &str,
        devices: Vec<String>,
    ) -> Result<PoolRecord> {
        self.pools.extend(node, name, &devices).await
    }

    pub async fn pool_destroy(&self, node: &str, name: &str) -> Result<()> {
        self.pools.destroy(node, name).await
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub async fn resource_create(
        &self,
        request: CreateResourceRequest,
        cancel: CancellationToken,
    ) -> Result<ResourceRecord> {
        let _guard = self.lock(&request.name).await;
        self.engine.create(request, cancel).await
    }

    /// Cascading teardown: HA overlay first, then gateways, then the
    /// resource itself.
    pub async fn resource_delete(
        &self,
        resource: &str,
        force: bool,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _guard = self.lock(resource).await;

        if self.catalog.ha(resource).await?.is_some() {
            info!(resource, "cascading delete: removing HA overlay first");
            self.ha.remove_ha(resource).await?;
        }
        for gateway in self.gateways.for_resource(resource).await? {
            info!(resource, gateway = %gateway.id, "cascading delete: removing gateway");
            self.gateways.remove(&gateway.id).await?;
        }

        self.engine.delete(resource, force, cancel).await
    }

    pub async fn resource_add_volume(
        &self,
        resource: &str,
        pool: &str,
        size_gb: u64,
        cancel: CancellationToken,
    ) -> Result<VolumeRecord> {
        let _guard = self.lock(resource).await;
        self.engine.add_volume(resource, pool, size_gb, cancel).await
    }

    pub async fn resource_resize_volume(
        &self,
        resource: &str,
        index: u32,
        size_gb: u64,
        cancel: CancellationToken,
    ) -> Result<VolumeRecord> {
        let _guard = self.lock(resource).await;
        self.engine.resize_volume(resource, index, size_gb, cancel).await
    }

    pub async fn resource_set_primary(
        &self,
        resource: &str,
        node: &str,
        force: bool,
    ) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.engine.set_primary(resource, node, force).await
    }

    pub async fn resource_set_secondary(&self, resource: &str, node: &str) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.engine.set_secondary(resource, node).await
    }

    pub async fn resource_create_filesystem(
        &self,
        resource: &str,
        index: u32,
        fs: FsKind,
        node: &str,
        force: bool,
    ) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.engine.create_filesystem(resource, index, fs, node, force).await
    }

    pub async fn resource_mount(
        &self,
        resource: &str,
        index: u32,
        path: &str,
        node: &str,
        fs: FsKind,
    ) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.engine.mount(resource, index, path, node, fs).await
    }

    pub async fn resource_unmount(&self, resource: &str, path: &str, node: &str) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.engine.unmount(resource, path, node).await
    }

    pub async fn resource_get(&self, resource: &str) -> Result<ResourceDetails> {
        self.engine.get(resource).await
    }

    pub async fn resource_list(&self) -> Result<Vec<ResourceRecord>> {
        self.engine.list().await
    }

    // =========================================================================
    // HA
    // =========================================================================

    pub async fn ha_create(&self, request: MakeHaRequest) -> Result<String> {
        let _guard = self.lock(&request.resource).await;
        self.ha.make_ha(request).await
    }

    pub async fn ha_evict(&self, resource: &str) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.ha.evict(resource).await
    }

    pub async fn ha_remove(&self, resource: &str) -> Result<()> {
        let _guard = self.lock(resource).await;
        self.ha.remove_ha(resource).await
    }

    pub async fn ha_list(&self) -> Result<Vec<HaRecord>> {
        self.catalog.ha_configs().await
    }

    // =========================================================================
    // Gateways
    // =========================================================================

    pub async fn gateway_register(
        &self,
        name: &str,
        kind: GatewayKind,
        resource: &str,
        config: BTreeMap<String, String>,
    ) -> Result<GatewayRecord> {
        let _guard = self.lock(resource).await;
        self.gateways.register(name, kind, resource, config).await
    }

    pub async fn gateway_list(&self) -> Result<Vec<GatewayRecord>> {
        self.gateways.list().await
    }

    pub async fn gateway_remove(&self, id: &str) -> Result<()> {
        self.gateways.remove(id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Per-resource-name mutation lock. Role changes, HA operations and
    /// structural mutations of one resource never interleave.
    async fn lock(&self, resource: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackingKind, CatalogConfig, FileCatalog, Protocol};
    use crate::remote::transport::mock::MockTransport;
    use crate::remote::{ExecutorConfig, LocalIdentity, RemoteExecutor};
    use std::time::Duration;

    struct Fixture {
        mock: Arc<MockTransport>,
        surface: Arc<ControlSurface>,
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
        let pools = PoolManager::new(executor.clone(), registry.clone(), catalog.clone());
        let engine = ResourceEngine::new(executor.clone(), registry.clone(), catalog.clone());
        let ha = HaController::new(executor.clone(), engine.clone(), catalog.clone());
        let gateways = GatewayBridge::new(executor.clone(), engine.clone(), catalog.clone());
        let surface = ControlSurface::new(registry, pools, engine, ha, gateways, catalog.clone());
        Fixture {
            mock,
            surface,
            catalog,
        }
    }

    async fn seed_resource(fx: &Fixture) {
        fx.mock.respond_on("10.0.0.1", "uname -n", "n1\n");
        fx.mock.respond_on("10.0.0.2", "uname -n", "n2\n");
        fx.surface.node_register("n1", "10.0.0.1").await.unwrap();
        fx.surface.node_register("n2", "10.0.0.2").await.unwrap();
        fx.surface
            .resource_create(
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
    }

    #[tokio::test]
    async fn test_node_names_normalize_through_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        seed_resource(&fx).await;

        // Role change addressed by logical name reaches the address.
        fx.surface
            .resource_set_primary("r1", "n2", true)
            .await
            .unwrap();
        assert!(fx.mock.saw("10.0.0.2", "drbdadm primary --force r1"));

        fx.surface.node_unregister("n2").await.unwrap();
        assert!(fx.catalog.node("10.0.0.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascading_delete_removes_overlays_first() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        seed_resource(&fx).await;

        fx.mock
            .respond("systemctl show -p LoadState app.service", "LoadState=loaded\n");
        fx.mock
            .respond_on("10.0.0.1", "drbdadm status r1", "r1 role:Primary\n");
        fx.surface
            .ha_create(MakeHaRequest {
                resource: "r1".into(),
                services: vec!["app.service".into()],
                mount_point: None,
                fs_kind: None,
                vip: None,
            })
            .await
            .unwrap();
        fx.surface
            .gateway_register("share1", GatewayKind::Nfs, "r1", BTreeMap::new())
            .await
            .unwrap();

        fx.surface
            .resource_delete("r1", false, CancellationToken::new())
            .await
            .unwrap();

        assert!(fx.catalog.ha("r1").await.unwrap().is_none());
        assert!(fx.catalog.gateways().await.unwrap().is_empty());
        assert!(fx.catalog.resource("r1").await.unwrap().is_none());
        assert!(fx.mock.saw("10.0.0.1", "rm -f /etc/drbd-reactor.d/sds-ha-r1.toml"));
        assert!(fx.mock.saw("10.0.0.1", "rm -f /etc/drbd.d/r1.res"));
    }

    #[tokio::test]
    async fn test_mutations_on_same_resource_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let fx = setup(&dir).await;
        seed_resource(&fx).await;

        // Both tasks contend for the same per-resource lock; the joined
        // outcome must look as if they ran one after the other.
        let surface = fx.surface.clone();
        let a = tokio::spawn({
            let surface = surface.clone();
            async move { surface.resource_set_primary("r1", "n1", false).await }
        });
        let b = tokio::spawn({
            let surface = surface.clone();
            async move { surface.resource_set_secondary("r1", "n1").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let commands = fx.mock.commands_for("10.0.0.1");
        assert!(commands.iter().any(|c| c.contains("drbdadm primary r1")));
        assert!(commands.iter().any(|c| c.contains("drbdadm secondary r1")));
    }
}
