//! Gateway bridge
//!
//! Thin adapter between the export-protocol managers (NFS, iSCSI,
//! NVMe-oF) and the core. The managers provision exports themselves;
//! the bridge validates backing resources, tracks gateway records, and
//! lends out the engine and executor handles the managers drive nodes
//! with.

use crate::catalog::{Catalog, GatewayKind, GatewayRecord};
use crate::error::{Error, Result};
use crate::remote::RemoteExecutor;
use crate::resource::ResourceEngine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Adapter the gateway managers are constructed against.
pub struct GatewayBridge {
    executor: Arc<RemoteExecutor>,
    engine: Arc<ResourceEngine>,
    catalog: Catalog,
}

impl GatewayBridge {
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

    /// Executor handle for managers that run export tooling on nodes.
    pub fn executor(&self) -> Arc<RemoteExecutor> {
        self.executor.clone()
    }

    /// Engine handle for managers that need resource state or role
    /// changes.
    pub fn engine(&self) -> Arc<ResourceEngine> {
        self.engine.clone()
    }

    /// Record a gateway over an existing resource.
    pub async fn register(
        &self,
        name: &str,
        kind: GatewayKind,
        resource: &str,
        config: BTreeMap<String, String>,
    ) -> Result<GatewayRecord> {
        // A gateway references exactly one existing resource.
        self.engine.require(resource).await?;

        let id = format!("{kind}-{name}");
        if self.catalog.gateway(&id).await?.is_some() {
            return Err(Error::AlreadyExists {
                kind: "gateway".into(),
                name: id,
            });
        }

        let record = GatewayRecord {
            id: id.clone(),
            name: name.to_string(),
            kind,
            resource: resource.to_string(),
            config,
            status: "configured".to_string(),
        };
        self.catalog.put_gateway(&record).await?;
        info!(gateway = %id, resource, "gateway registered");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<GatewayRecord>> {
        self.catalog.gateway(id).await
    }

    pub async fn list(&self) -> Result<Vec<GatewayRecord>> {
        self.catalog.gateways().await
    }

    /// Gateways backed by one resource.
    pub async fn for_resource(&self, resource: &str) -> Result<Vec<GatewayRecord>> {
        Ok(self
            .catalog
            .gateways()
            .await?
            .into_iter()
            .filter(|g| g.resource == resource)
            .collect())
    }

    /// Forget a gateway. Removing an unknown id is not an error.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.catalog.delete_gateway(id).await?;
        info!(gateway = %id, "gateway removed");
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
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn setup(dir: &tempfile::TempDir) -> Arc<GatewayBridge> {
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

        GatewayBridge::new(executor, engine, catalog)
    }

    #[tokio::test]
    async fn test_register_requires_backing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = setup(&dir).await;

        let err = bridge
            .register("share1", GatewayKind::Nfs, "missing", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let record = bridge
            .register("share1", GatewayKind::Nfs, "r1", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(record.id, "nfs-share1");
        assert_eq!(record.resource, "r1");
    }

    #[tokio::test]
    async fn test_duplicate_gateway_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = setup(&dir).await;

        bridge
            .register("share1", GatewayKind::Iscsi, "r1", BTreeMap::new())
            .await
            .unwrap();
        let err = bridge
            .register("share1", GatewayKind::Iscsi, "r1", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_for_resource_filters_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = setup(&dir).await;

        bridge
            .register("share1", GatewayKind::Nfs, "r1", BTreeMap::new())
            .await
            .unwrap();
        bridge
            .register("target1", GatewayKind::Nvmeof, "r1", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(bridge.for_resource("r1").await.unwrap().len(), 2);
        assert!(bridge.for_resource("r2").await.unwrap().is_empty());

        bridge.remove("nfs-share1").await.unwrap();
        bridge.remove("nfs-share1").await.unwrap();
        assert_eq!(bridge.list().await.unwrap().len(), 1);
    }
}
