//! Catalog records
//!
//! Serialized record bodies for every entity kind the controller tracks.
//! Records are self-describing; the store treats them as opaque values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// =============================================================================
// Nodes
// =============================================================================

/// Liveness state of a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Online,
    Offline,
    Degraded,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Online => write!(f, "online"),
            NodeState::Offline => write!(f, "offline"),
            NodeState::Degraded => write!(f, "degraded"),
        }
    }
}

/// A registered storage host. The address is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Logical name chosen at registration
    pub name: String,
    /// Reachable network address, unique across the cluster
    pub address: String,
    /// Hostname the node reported for itself
    pub hostname: String,
    /// Liveness state
    pub state: NodeState,
    /// Last successful probe
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Version string reported by the node
    #[serde(default)]
    pub version: Option<String>,
    /// Free-form capacity map
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
}

// =============================================================================
// Pools
// =============================================================================

/// Kind of local storage container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    VolumeGroup,
    ZfsPool,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::VolumeGroup => write!(f, "volume-group"),
            PoolKind::ZfsPool => write!(f, "zfs-pool"),
        }
    }
}

/// A local storage container on exactly one node. (name, node) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub kind: PoolKind,
    /// Owning node address
    pub node: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Member devices the pool was assembled from
    #[serde(default)]
    pub devices: Vec<String>,
}

impl PoolRecord {
    /// Catalog key: the (node, name) pair.
    pub fn key(&self) -> String {
        pool_key(&self.node, &self.name)
    }
}

/// Catalog key for a (node, name) pool pair.
pub fn pool_key(node: &str, name: &str) -> String {
    format!("{node}/{name}")
}

// =============================================================================
// Resources
// =============================================================================

/// Replication protocol of the block driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    A,
    B,
    C,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::A => write!(f, "A"),
            Protocol::B => write!(f, "B"),
            Protocol::C => write!(f, "C"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Protocol::A),
            "B" | "b" => Ok(Protocol::B),
            "C" | "c" => Ok(Protocol::C),
            other => Err(format!("unknown replication protocol: {other}")),
        }
    }
}

/// Backing store the replica volumes are carved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingKind {
    Lvm,
    Zfs,
}

impl std::fmt::Display for BackingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackingKind::Lvm => write!(f, "lvm"),
            BackingKind::Zfs => write!(f, "zfs"),
        }
    }
}

/// One data unit inside a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Dense, 0-based index within the resource
    pub index: u32,
    /// Device minor number, unique per host
    pub minor: u32,
    /// Backing pool name
    pub pool: String,
    pub size_gb: u64,
    /// Backing device path on the node
    pub device_path: String,
}

/// A replicated block device spanning two or more nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Cluster-unique name, the primary key
    pub name: String,
    /// Replication TCP port, unique across live resources
    pub port: u16,
    /// Member node addresses in input order
    pub nodes: Vec<String>,
    pub protocol: Protocol,
    pub backing: BackingKind,
    /// Volumes, dense by index starting at 0
    pub volumes: Vec<VolumeRecord>,
    /// Raw `section/key=value` driver-config overrides, kept so later
    /// re-renders reproduce the original document
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Replica count equals the member node count.
    pub fn replica_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn volume(&self, index: u32) -> Option<&VolumeRecord> {
        self.volumes.iter().find(|v| v.index == index)
    }

    /// Next free volume index. Indices are dense, so this is the count.
    pub fn next_volume_index(&self) -> u32 {
        self.volumes.len() as u32
    }

    /// Next minor number: minors never decrease across add-volume calls.
    pub fn next_minor(&self) -> u32 {
        self.volumes.iter().map(|v| v.minor).max().map_or(0, |m| m + 1)
    }
}

// =============================================================================
// HA Overlay
// =============================================================================

/// Filesystem kind stacked on a promoted replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Ext4,
    Xfs,
}

impl FsKind {
    /// mkfs tool for this filesystem.
    pub fn mkfs_tool(&self) -> &'static str {
        match self {
            FsKind::Ext4 => "mkfs.ext4",
            FsKind::Xfs => "mkfs.xfs",
        }
    }

    /// Tool-specific force flag guarding re-format.
    pub fn force_flag(&self) -> &'static str {
        match self {
            FsKind::Ext4 => "-F",
            FsKind::Xfs => "-f",
        }
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsKind::Ext4 => write!(f, "ext4"),
            FsKind::Xfs => write!(f, "xfs"),
        }
    }
}

impl FromStr for FsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(FsKind::Ext4),
            "xfs" => Ok(FsKind::Xfs),
            other => Err(format!("unsupported filesystem kind: {other}")),
        }
    }
}

/// HA overlay on a resource, one-to-one with the resource name.
///
/// Existence of this record implies a promoter snippet is present on all
/// member nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaRecord {
    /// Backing resource name, the primary key
    pub resource: String,
    /// Floating address in CIDR form
    #[serde(default)]
    pub vip: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub fs_kind: Option<FsKind>,
    /// Service unit names in promoter start order
    pub services: Vec<String>,
}

// =============================================================================
// Gateways
// =============================================================================

/// Export protocol of a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Nfs,
    Iscsi,
    Nvmeof,
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayKind::Nfs => write!(f, "nfs"),
            GatewayKind::Iscsi => write!(f, "iscsi"),
            GatewayKind::Nvmeof => write!(f, "nvmeof"),
        }
    }
}

/// An export overlay backed by exactly one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub id: String,
    pub name: String,
    pub kind: GatewayKind,
    /// Backing resource name
    pub resource: String,
    /// Opaque manager-specific configuration
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_volume_indexing() {
        let resource = ResourceRecord {
            name: "r1".into(),
            port: 7001,
            nodes: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            protocol: Protocol::C,
            backing: BackingKind::Lvm,
            volumes: vec![VolumeRecord {
                index: 0,
                minor: 1,
                pool: "pool0".into(),
                size_gb: 4,
                device_path: "/dev/pool0/r1_data".into(),
            }],
            overrides: BTreeMap::new(),
            created_at: Utc::now(),
        };

        assert_eq!(resource.replica_count(), 2);
        assert_eq!(resource.next_volume_index(), 1);
        assert_eq!(resource.next_minor(), 2);
        assert!(resource.volume(0).is_some());
        assert!(resource.volume(1).is_none());
    }

    #[test]
    fn test_next_minor_skips_gaps_upward() {
        let mut resource = ResourceRecord {
            name: "r1".into(),
            port: 7001,
            nodes: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            protocol: Protocol::C,
            backing: BackingKind::Lvm,
            volumes: vec![],
            overrides: BTreeMap::new(),
            created_at: Utc::now(),
        };
        resource.volumes.push(VolumeRecord {
            index: 0,
            minor: 7,
            pool: "pool0".into(),
            size_gb: 4,
            device_path: "/dev/pool0/r1_data".into(),
        });

        // Minors never decrease even when they started above the dense range.
        assert_eq!(resource.next_minor(), 8);
    }

    #[test]
    fn test_record_round_trip() {
        let node = NodeRecord {
            name: "n1".into(),
            address: "10.0.0.1".into(),
            hostname: "n1.cluster".into(),
            state: NodeState::Online,
            last_seen: Some(Utc::now()),
            version: Some("9.2.8".into()),
            capacity: BTreeMap::from([("pool0".into(), "512GiB".into())]),
        };
        let value = serde_json::to_value(&node).unwrap();
        let back: NodeRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.address, "10.0.0.1");
        assert_eq!(back.state, NodeState::Online);
        assert_eq!(back.capacity.len(), 1);
    }

    #[test]
    fn test_enum_wire_forms() {
        assert_eq!(serde_json::to_string(&PoolKind::VolumeGroup).unwrap(), "\"volume-group\"");
        assert_eq!(serde_json::to_string(&BackingKind::Zfs).unwrap(), "\"zfs\"");
        assert_eq!(serde_json::to_string(&GatewayKind::Nvmeof).unwrap(), "\"nvmeof\"");
        assert_eq!(Protocol::from_str("c").unwrap(), Protocol::C);
        assert!(Protocol::from_str("D").is_err());
    }

    #[test]
    fn test_fs_kind_tooling() {
        assert_eq!(FsKind::Ext4.mkfs_tool(), "mkfs.ext4");
        assert_eq!(FsKind::Ext4.force_flag(), "-F");
        assert_eq!(FsKind::Xfs.force_flag(), "-f");
        assert_eq!(FsKind::from_str("XFS").unwrap(), FsKind::Xfs);
    }

    #[test]
    fn test_pool_key_is_node_scoped() {
        let pool = PoolRecord {
            name: "pool0".into(),
            kind: PoolKind::VolumeGroup,
            node: "10.0.0.1".into(),
            total_bytes: 0,
            free_bytes: 0,
            devices: vec![],
        };
        assert_eq!(pool.key(), "10.0.0.1/pool0");
    }
}
