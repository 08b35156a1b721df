//! Live status parsing
//!
//! Parses the textual output of `drbdadm status <resource>`. The parse
//! is tolerant: unrecognized fields are ignored and missing fields yield
//! the `Unknown` sentinel. A status probe must never fail a query.

use serde::Serialize;

// =============================================================================
// States
// =============================================================================

/// Replica role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Primary,
    Secondary,
    Unknown,
}

impl Role {
    fn parse(token: &str) -> Self {
        match token {
            "Primary" => Role::Primary,
            "Secondary" => Role::Secondary,
            _ => Role::Unknown,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "Primary"),
            Role::Secondary => write!(f, "Secondary"),
            Role::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Backing disk state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskState {
    UpToDate,
    Consistent,
    Inconsistent,
    Outdated,
    Attaching,
    Negotiating,
    Diskless,
    Failed,
    Unknown,
}

impl DiskState {
    fn parse(token: &str) -> Self {
        match token {
            "UpToDate" => DiskState::UpToDate,
            "Consistent" => DiskState::Consistent,
            "Inconsistent" => DiskState::Inconsistent,
            "Outdated" => DiskState::Outdated,
            "Attaching" => DiskState::Attaching,
            "Negotiating" => DiskState::Negotiating,
            "Diskless" => DiskState::Diskless,
            "Failed" => DiskState::Failed,
            _ => DiskState::Unknown,
        }
    }
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiskState::UpToDate => "UpToDate",
            DiskState::Consistent => "Consistent",
            DiskState::Inconsistent => "Inconsistent",
            DiskState::Outdated => "Outdated",
            DiskState::Attaching => "Attaching",
            DiskState::Negotiating => "Negotiating",
            DiskState::Diskless => "Diskless",
            DiskState::Failed => "Failed",
            DiskState::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Parsed Status
// =============================================================================

/// Per-peer role and disk state
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub role: Role,
    pub disk: DiskState,
}

/// Per-volume disk state as seen locally
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStatus {
    pub index: u32,
    pub disk: DiskState,
}

/// Parsed `drbdadm status` output for one resource on one node.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub resource: String,
    /// Role of the probed node itself
    pub local_role: Role,
    /// Local disk state (first volume when per-volume lines are present)
    pub local_disk: DiskState,
    pub volumes: Vec<VolumeStatus>,
    pub peers: Vec<PeerStatus>,
}

impl ResourceStatus {
    /// Empty status with every field at its sentinel.
    pub fn unknown(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            local_role: Role::Unknown,
            local_disk: DiskState::Unknown,
            volumes: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// Name of the node currently holding the primary role, with the
    /// probed host standing in for the local line.
    pub fn primary_node(&self, probed_host: &str) -> Option<String> {
        if self.local_role.is_primary() {
            return Some(probed_host.to_string());
        }
        self.peers
            .iter()
            .find(|p| p.role.is_primary())
            .map(|p| p.name.clone())
    }

    /// Parse one node's status output. Never fails; malformed input
    /// degrades field by field to `Unknown`.
    pub fn parse(resource: &str, output: &str) -> Self {
        let mut status = Self::unknown(resource);

        for (line_no, raw) in output.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            // Line 1: "<resource> role:<Role> ..."
            if line_no == 0 || raw.starts_with(|c: char| !c.is_whitespace()) {
                for token in line.split_whitespace().skip(1) {
                    if let Some(role) = token.strip_prefix("role:") {
                        status.local_role = Role::parse(role);
                    }
                }
                continue;
            }

            let mut tokens = line.split_whitespace();
            let Some(first) = tokens.next() else {
                continue;
            };

            let peer_disk = line
                .split_whitespace()
                .find_map(|t| t.strip_prefix("peer-disk:"))
                .map(DiskState::parse);

            if let Some(state) = peer_disk {
                // Binds to the most recently opened peer, including
                // per-volume peer lines.
                if let Some(peer) = status.peers.last_mut() {
                    if peer.disk == DiskState::Unknown {
                        peer.disk = state;
                    }
                }
            } else if let Some(index) = first.strip_prefix("volume:") {
                let disk = line
                    .split_whitespace()
                    .find_map(|t| t.strip_prefix("disk:"))
                    .map(DiskState::parse)
                    .unwrap_or(DiskState::Unknown);
                if let Ok(index) = index.parse() {
                    if status.volumes.is_empty() {
                        status.local_disk = disk;
                    }
                    status.volumes.push(VolumeStatus { index, disk });
                }
            } else if let Some(state) = first.strip_prefix("disk:") {
                status.local_disk = DiskState::parse(state);
            } else {
                // "<peer> role:<Role> ..." opens a peer; anything else is
                // an unrecognized field and is skipped.
                let role = line
                    .split_whitespace()
                    .find_map(|t| t.strip_prefix("role:"))
                    .map(Role::parse);
                if let Some(role) = role {
                    status.peers.push(PeerStatus {
                        name: first.to_string(),
                        role,
                        disk: DiskState::Unknown,
                    });
                }
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODE: &str = "\
r1 role:Primary
  disk:UpToDate
  n2 role:Secondary
    peer-disk:UpToDate
";

    #[test]
    fn test_parse_two_node_status() {
        let status = ResourceStatus::parse("r1", TWO_NODE);
        assert_eq!(status.local_role, Role::Primary);
        assert_eq!(status.local_disk, DiskState::UpToDate);
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].name, "n2");
        assert_eq!(status.peers[0].role, Role::Secondary);
        assert_eq!(status.peers[0].disk, DiskState::UpToDate);
    }

    #[test]
    fn test_parse_volume_lines() {
        let output = "\
r1 role:Secondary
  volume:0 disk:UpToDate
  volume:1 disk:Inconsistent
  n2 role:Primary
    volume:0 peer-disk:UpToDate
";
        let status = ResourceStatus::parse("r1", output);
        assert_eq!(status.volumes.len(), 2);
        assert_eq!(status.volumes[0].index, 0);
        assert_eq!(status.volumes[1].disk, DiskState::Inconsistent);
        assert_eq!(status.local_disk, DiskState::UpToDate);
    }

    #[test]
    fn test_peer_disk_binds_to_preceding_peer() {
        let output = "\
r1 role:Secondary
  n2 role:Secondary
    peer-disk:Outdated
  n3 role:Primary
";
        let status = ResourceStatus::parse("r1", output);
        assert_eq!(status.peers[0].disk, DiskState::Outdated);
        assert_eq!(status.peers[1].disk, DiskState::Unknown);
        assert_eq!(status.primary_node("local"), Some("n3".to_string()));
    }

    #[test]
    fn test_missing_fields_yield_unknown() {
        let status = ResourceStatus::parse("r1", "r1\n");
        assert_eq!(status.local_role, Role::Unknown);
        assert_eq!(status.local_disk, DiskState::Unknown);
        assert!(status.peers.is_empty());
    }

    #[test]
    fn test_malformed_input_never_panics() {
        for garbage in [
            "",
            "\n\n\n",
            "role:",
            "  peer-disk:UpToDate\n",
            "r1 role:Chaos\n  disk:Melted\n  volume:x disk:UpToDate\n",
            "  \t weird indent role:Primary",
        ] {
            let status = ResourceStatus::parse("r1", garbage);
            assert_eq!(status.resource, "r1");
        }
    }

    #[test]
    fn test_unrecognized_tokens_ignored() {
        let output = "\
r1 role:Primary suspended:no
  disk:UpToDate quorum:yes
  n2 connection:Connected role:Secondary congested:no
    peer-disk:UpToDate resync-suspended:no
";
        let status = ResourceStatus::parse("r1", output);
        assert_eq!(status.local_role, Role::Primary);
        assert_eq!(status.peers[0].role, Role::Secondary);
        assert_eq!(status.peers[0].disk, DiskState::UpToDate);
    }

    #[test]
    fn test_primary_node_local() {
        let status = ResourceStatus::parse("r1", TWO_NODE);
        assert_eq!(status.primary_node("10.0.0.1"), Some("10.0.0.1".to_string()));
    }
}
