//! Catalog store
//!
//! A namespaced key/value store persisted as a single on-disk JSON
//! document. Writes go through one writer lock and land atomically via a
//! temp-file rename; reads run against the in-memory image.

use crate::catalog::records::{
    pool_key, GatewayRecord, HaRecord, NodeRecord, PoolRecord, ResourceRecord,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Namespaces
// =============================================================================

/// One namespace per entity kind. Keys are the entity's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Namespace {
    Nodes,
    Pools,
    Resources,
    Gateways,
    Ha,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Nodes => "nodes",
            Namespace::Pools => "pools",
            Namespace::Resources => "resources",
            Namespace::Gateways => "gateways",
            Namespace::Ha => "ha",
        }
    }
}

// =============================================================================
// Store Contract
// =============================================================================

/// Persistence contract shared by all components.
///
/// `save` is a full overwrite and is atomic per call; `delete` is
/// idempotent; `list` iteration order is stable. A single controller
/// instance gets read-your-writes.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn save(&self, kind: Namespace, key: &str, value: Value) -> Result<()>;
    async fn get(&self, kind: Namespace, key: &str) -> Result<Option<Value>>;
    async fn list(&self, kind: Namespace) -> Result<Vec<(String, Value)>>;
    async fn delete(&self, kind: Namespace, key: &str) -> Result<()>;
}

// =============================================================================
// File-Backed Store
// =============================================================================

/// Configuration for the file-backed catalog
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Path of the state file
    pub path: PathBuf,
    /// Bounded wait for the startup lock
    pub open_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sds-controller/state.db"),
            open_timeout: Duration::from_secs(10),
        }
    }
}

type Image = BTreeMap<String, BTreeMap<String, Value>>;

/// Single-file catalog store.
///
/// The whole document is held in memory and rewritten on every mutation.
/// The record count here is nodes + pools + resources, not data blocks;
/// full rewrites stay small.
pub struct FileCatalog {
    path: PathBuf,
    lock_path: PathBuf,
    image: RwLock<Image>,
}

impl FileCatalog {
    /// Open (or create) the state file.
    ///
    /// The parent directory is created with mode 0755. A concurrent
    /// holder of the startup lock is waited out up to
    /// `config.open_timeout`, then the open fails.
    pub async fn open(config: CatalogConfig) -> Result<Arc<Self>> {
        if let Some(parent) = config.path.parent() {
            create_dir_0755(parent)?;
        }

        let lock_path = config.path.with_extension("lock");
        Self::acquire_lock(&lock_path, config.open_timeout).await?;

        let image = match tokio::fs::read(&config.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| Error::Catalog(format!("corrupt state file: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %config.path.display(), "creating new state file");
                Image::new()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Arc::new(Self {
            path: config.path,
            lock_path,
            image: RwLock::new(image),
        }))
    }

    async fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<()> {
        let attempt = || async {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(backoff::Error::transient(()))
                }
                Err(err) => {
                    warn!("state lock error: {err}");
                    Err(backoff::Error::permanent(()))
                }
            }
        };

        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_elapsed_time(Some(timeout))
            .build();

        backoff::future::retry(policy, attempt).await.map_err(|_| {
            Error::Catalog(format!(
                "state file is locked (remove stale {} if no other controller runs)",
                lock_path.display()
            ))
        })
    }

    /// Serialize the image and promote it into place atomically.
    async fn persist(&self, image: &Image) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(image)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl Drop for FileCatalog {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[async_trait]
impl CatalogStore for FileCatalog {
    async fn save(&self, kind: Namespace, key: &str, value: Value) -> Result<()> {
        let mut image = self.image.write().await;
        image
            .entry(kind.as_str().to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.persist(&image).await?;
        debug!(kind = kind.as_str(), key, "catalog record saved");
        Ok(())
    }

    async fn get(&self, kind: Namespace, key: &str) -> Result<Option<Value>> {
        let image = self.image.read().await;
        Ok(image.get(kind.as_str()).and_then(|ns| ns.get(key)).cloned())
    }

    async fn list(&self, kind: Namespace) -> Result<Vec<(String, Value)>> {
        let image = self.image.read().await;
        Ok(image
            .get(kind.as_str())
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn delete(&self, kind: Namespace, key: &str) -> Result<()> {
        let mut image = self.image.write().await;
        let removed = image
            .get_mut(kind.as_str())
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.persist(&image).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Typed Catalog Facade
// =============================================================================

/// Typed entity API over the raw store, shared by all components.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn CatalogStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    // ---- nodes ----

    pub async fn put_node(&self, record: &NodeRecord) -> Result<()> {
        self.store
            .save(Namespace::Nodes, &record.address, serde_json::to_value(record)?)
            .await
    }

    pub async fn node(&self, address: &str) -> Result<Option<NodeRecord>> {
        self.decode(self.store.get(Namespace::Nodes, address).await?)
    }

    pub async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        self.decode_list(self.store.list(Namespace::Nodes).await?)
    }

    pub async fn delete_node(&self, address: &str) -> Result<()> {
        self.store.delete(Namespace::Nodes, address).await
    }

    // ---- pools ----

    pub async fn put_pool(&self, record: &PoolRecord) -> Result<()> {
        self.store
            .save(Namespace::Pools, &record.key(), serde_json::to_value(record)?)
            .await
    }

    pub async fn pool(&self, node: &str, name: &str) -> Result<Option<PoolRecord>> {
        self.decode(self.store.get(Namespace::Pools, &pool_key(node, name)).await?)
    }

    pub async fn pools(&self) -> Result<Vec<PoolRecord>> {
        self.decode_list(self.store.list(Namespace::Pools).await?)
    }

    pub async fn delete_pool(&self, node: &str, name: &str) -> Result<()> {
        self.store.delete(Namespace::Pools, &pool_key(node, name)).await
    }

    // ---- resources ----

    pub async fn put_resource(&self, record: &ResourceRecord) -> Result<()> {
        self.store
            .save(Namespace::Resources, &record.name, serde_json::to_value(record)?)
            .await
    }

    pub async fn resource(&self, name: &str) -> Result<Option<ResourceRecord>> {
        self.decode(self.store.get(Namespace::Resources, name).await?)
    }

    pub async fn resources(&self) -> Result<Vec<ResourceRecord>> {
        self.decode_list(self.store.list(Namespace::Resources).await?)
    }

    pub async fn delete_resource(&self, name: &str) -> Result<()> {
        self.store.delete(Namespace::Resources, name).await
    }

    // ---- gateways ----

    pub async fn put_gateway(&self, record: &GatewayRecord) -> Result<()> {
        self.store
            .save(Namespace::Gateways, &record.id, serde_json::to_value(record)?)
            .await
    }

    pub async fn gateway(&self, id: &str) -> Result<Option<GatewayRecord>> {
        self.decode(self.store.get(Namespace::Gateways, id).await?)
    }

    pub async fn gateways(&self) -> Result<Vec<GatewayRecord>> {
        self.decode_list(self.store.list(Namespace::Gateways).await?)
    }

    pub async fn delete_gateway(&self, id: &str) -> Result<()> {
        self.store.delete(Namespace::Gateways, id).await
    }

    // ---- ha ----

    pub async fn put_ha(&self, record: &HaRecord) -> Result<()> {
        self.store
            .save(Namespace::Ha, &record.resource, serde_json::to_value(record)?)
            .await
    }

    pub async fn ha(&self, resource: &str) -> Result<Option<HaRecord>> {
        self.decode(self.store.get(Namespace::Ha, resource).await?)
    }

    pub async fn ha_configs(&self) -> Result<Vec<HaRecord>> {
        self.decode_list(self.store.list(Namespace::Ha).await?)
    }

    pub async fn delete_ha(&self, resource: &str) -> Result<()> {
        self.store.delete(Namespace::Ha, resource).await
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, value: Option<Value>) -> Result<Option<T>> {
        value.map(|v| serde_json::from_value(v).map_err(Error::from)).transpose()
    }

    fn decode_list<T: serde::de::DeserializeOwned>(
        &self,
        values: Vec<(String, Value)>,
    ) -> Result<Vec<T>> {
        values
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }
}

#[cfg(unix)]
fn create_dir_0755(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new().recursive(true).mode(0o755).create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_0755(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::records::{NodeState, PoolKind};

    async fn open_catalog(dir: &tempfile::TempDir) -> (Catalog, Arc<FileCatalog>) {
        let store = FileCatalog::open(CatalogConfig {
            path: dir.path().join("state.db"),
            open_timeout: Duration::from_millis(500),
        })
        .await
        .unwrap();
        (Catalog::new(store.clone()), store)
    }

    fn node(address: &str) -> NodeRecord {
        NodeRecord {
            name: "n1".into(),
            address: address.into(),
            hostname: "n1.cluster".into(),
            state: NodeState::Online,
            last_seen: None,
            version: None,
            capacity: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_save_then_list_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (catalog, _store) = open_catalog(&dir).await;

        catalog.put_node(&node("10.0.0.1")).await.unwrap();
        catalog
            .put_pool(&PoolRecord {
                name: "pool0".into(),
                kind: PoolKind::VolumeGroup,
                node: "10.0.0.1".into(),
                total_bytes: 512 << 30,
                free_bytes: 500 << 30,
                devices: vec!["/dev/sdb".into()],
            })
            .await
            .unwrap();

        let nodes = catalog.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostname, "n1.cluster");

        let pools = catalog.pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].devices, vec!["/dev/sdb"]);
        assert_eq!(pools[0].total_bytes, 512 << 30);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (catalog, store) = open_catalog(&dir).await;
            catalog.put_node(&node("10.0.0.1")).await.unwrap();
            drop(catalog);
            drop(store); // releases the startup lock
        }

        let (catalog, _store) = open_catalog(&dir).await;
        let loaded = catalog.node("10.0.0.1").await.unwrap();
        assert_eq!(loaded.unwrap().address, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (catalog, _store) = open_catalog(&dir).await;

        catalog.put_node(&node("10.0.0.1")).await.unwrap();
        catalog.delete_node("10.0.0.1").await.unwrap();
        catalog.delete_node("10.0.0.1").await.unwrap();
        assert!(catalog.node("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_full_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (catalog, _store) = open_catalog(&dir).await;

        let mut record = node("10.0.0.1");
        catalog.put_node(&record).await.unwrap();
        record.state = NodeState::Offline;
        record.version = Some("9.2.8".into());
        catalog.put_node(&record).await.unwrap();

        let loaded = catalog.node("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(loaded.state, NodeState::Offline);
        assert_eq!(loaded.version.as_deref(), Some("9.2.8"));
        assert_eq!(catalog.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_opener_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (_catalog, _store) = open_catalog(&dir).await;

        let second = FileCatalog::open(CatalogConfig {
            path: dir.path().join("state.db"),
            open_timeout: Duration::from_millis(200),
        })
        .await;
        assert!(matches!(second, Err(Error::Catalog(_))));
    }
}
