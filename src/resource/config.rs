//! Driver configuration rendering
//!
//! Renders the textual resource configuration the replication driver
//! reads from `/etc/drbd.d/<resource>.res`. Output is byte-stable:
//! every option map is normalized to sorted (section, key, value)
//! triples before emission, so identical inputs always render
//! identically regardless of input iteration order.

use crate::catalog::{BackingKind, Protocol};
use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

/// Minor numbers are derived from the replication port.
pub const MINOR_PORT_BASE: u16 = 7000;

/// Fixed `options` section defaults, in emission order.
const OPTION_DEFAULTS: &[(&str, &str)] = &[
    ("auto-promote", "no"),
    ("quorum", "majority"),
    ("on-no-quorum", "io-error"),
    ("on-no-data-accessible", "io-error"),
    ("on-suspended-primary-outdated", "force-secondary"),
];

// =============================================================================
// Rendering Inputs
// =============================================================================

/// One member node of a resource configuration
#[derive(Debug, Clone)]
pub struct ConfigNode {
    /// Display name, used for the `on` block and the connection mesh
    pub name: String,
    /// Replication address
    pub address: String,
}

/// One volume block of a resource configuration
#[derive(Debug, Clone)]
pub struct ConfigVolume {
    pub index: u32,
    pub minor: u32,
    pub device_path: String,
}

/// Everything needed to render one resource configuration.
#[derive(Debug, Clone)]
pub struct ConfigSpec {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Member nodes in input order; node-id follows this order
    pub nodes: Vec<ConfigNode>,
    /// Volumes, dense by index
    pub volumes: Vec<ConfigVolume>,
    /// Overrides grouped by section, already normalized
    pub overrides: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigSpec {
    /// Minor number of volume 0 for a given replication port.
    pub fn base_minor(port: u16) -> u32 {
        port.saturating_sub(MINOR_PORT_BASE) as u32
    }

    /// Render the full configuration document.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str(&format!("resource {} {{\n", self.name));

        // net section: protocol, overrides, then the fixed conflict policy
        out.push_str("    net {\n");
        out.push_str(&format!("        protocol {};\n", self.protocol));
        if let Some(net) = self.overrides.get("net") {
            for (key, value) in net {
                out.push_str(&format!("        {key} {value};\n"));
            }
        }
        out.push_str("        rr-conflict retry-connect;\n");
        out.push_str("    }\n");

        // options section: defaults with overrides applied in place,
        // then the remaining overrides sorted after
        let option_overrides = self.overrides.get("options").cloned().unwrap_or_default();
        out.push_str("    options {\n");
        for (key, default) in OPTION_DEFAULTS {
            let value = option_overrides.get(*key).map(String::as_str).unwrap_or(default);
            out.push_str(&format!("        {key} {value};\n"));
        }
        for (key, value) in &option_overrides {
            if !OPTION_DEFAULTS.iter().any(|(k, _)| k == key) {
                out.push_str(&format!("        {key} {value};\n"));
            }
        }
        out.push_str("    }\n");

        // any other override section gets its own block, sorted by name
        for (section, entries) in &self.overrides {
            if matches!(section.as_str(), "net" | "options" | "disk") {
                continue;
            }
            out.push_str(&format!("    {section} {{\n"));
            for (key, value) in entries {
                out.push_str(&format!("        {key} {value};\n"));
            }
            out.push_str("    }\n");
        }

        // volume blocks, dense by index
        let disk_overrides = self.overrides.get("disk");
        for volume in &self.volumes {
            out.push_str(&format!("    volume {} {{\n", volume.index));
            out.push_str(&format!("        device minor {};\n", volume.minor));
            out.push_str(&format!("        disk {};\n", volume.device_path));
            out.push_str("        meta-disk internal;\n");
            if let Some(disk) = disk_overrides {
                out.push_str("        disk {\n");
                for (key, value) in disk {
                    out.push_str(&format!("            {key} {value};\n"));
                }
                out.push_str("        }\n");
            }
            out.push_str("    }\n");
        }

        // on blocks in input node order; node-id follows that order
        for (node_id, node) in self.nodes.iter().enumerate() {
            out.push_str(&format!("    on {} {{\n", node.name));
            out.push_str(&format!("        address {}:{};\n", node.address, self.port));
            out.push_str(&format!("        node-id {node_id};\n"));
            out.push_str("    }\n");
        }

        // full mesh over all members
        let hosts: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        out.push_str("    connection-mesh {\n");
        out.push_str(&format!("        hosts {};\n", hosts.join(" ")));
        out.push_str("    }\n");

        out.push_str("}\n");
        out
    }
}

// =============================================================================
// Override Normalization
// =============================================================================

/// Group raw `section/key=value` overrides by section.
///
/// A bare `key` defaults to the `options` section. Input iteration order
/// is irrelevant; the result is fully sorted.
pub fn group_overrides(
    raw: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (key, value) in raw {
        let (section, option) = match key.split_once('/') {
            Some((section, option)) => (section.to_string(), option.to_string()),
            None => ("options".to_string(), key),
        };
        grouped.entry(section).or_default().insert(option, value);
    }
    grouped
}

// =============================================================================
// Backing Device Naming
// =============================================================================

/// Backing volume name for one volume of a resource.
///
/// Volume 0 keeps the bare `_data` suffix; later volumes append their
/// index so every logical volume name stays unique within the pool.
pub fn backing_volume_name(resource: &str, index: u32) -> String {
    if index == 0 {
        format!("{resource}_data")
    } else {
        format!("{resource}_data{index}")
    }
}

/// Device path of a backing volume as the node's kernel exposes it.
pub fn backing_device_path(kind: BackingKind, pool: &str, resource: &str, index: u32) -> String {
    let volume = backing_volume_name(resource, index);
    match kind {
        BackingKind::Lvm => format!("/dev/{pool}/{volume}"),
        BackingKind::Zfs => format!("/dev/zvol/{pool}/{volume}"),
    }
}

/// Extract (index, minor) pairs from a rendered configuration.
///
/// Used when a peer's on-disk configuration is the authority for the
/// next free volume index and minor number.
pub fn parse_volume_minors(config: &str) -> Vec<(u32, u32)> {
    let mut volumes = Vec::new();
    let mut current_index: Option<u32> = None;
    for line in config.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("volume ") {
            current_index = rest.split_whitespace().next().and_then(|t| t.parse().ok());
        } else if let Some(rest) = line.strip_prefix("device minor ") {
            if let (Some(index), Some(minor)) = (
                current_index.take(),
                rest.trim_end_matches(';').trim().parse().ok(),
            ) {
                volumes.push((index, minor));
            }
        }
    }
    volumes
}
