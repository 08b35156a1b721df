//! Promoter artifacts
//!
//! Text generation for everything the promoter daemon consumes: systemd
//! mount units, floating-address unit names, and the per-resource
//! promoter snippet under `/etc/drbd-reactor.d/`.

use crate::catalog::FsKind;

// =============================================================================
// Naming
// =============================================================================

/// systemd path mangling: `/a/b/c` becomes `a-b-c`.
pub fn mangle_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "-")
}

/// Mount unit name for a mount point.
pub fn mount_unit_name(mount_point: &str) -> String {
    format!("{}.mount", mangle_path(mount_point))
}

/// Host-local backup directory used before the promoter takes over.
pub fn backup_dir(mount_point: &str) -> String {
    format!("/tmp/ha_backup_{}", mangle_path(mount_point))
}

/// Promoter snippet id for a resource.
pub fn snippet_id(resource: &str) -> String {
    format!("sds-ha-{resource}")
}

/// Promoter snippet path on every member node.
pub fn snippet_path(resource: &str) -> String {
    format!("/etc/drbd-reactor.d/{}.toml", snippet_id(resource))
}

/// Mount unit path on every member node.
pub fn mount_unit_path(mount_point: &str) -> String {
    format!("/etc/systemd/system/{}", mount_unit_name(mount_point))
}

/// Floating-address unit name. A vip without CIDR notation defaults to
/// a /32 host route.
pub fn vip_unit_name(vip: &str) -> String {
    let (address, prefix) = match vip.split_once('/') {
        Some((address, prefix)) => (address, prefix),
        None => (vip, "32"),
    };
    format!("service-ip@{address}-{prefix}.service")
}

// =============================================================================
// Rendering
// =============================================================================

/// Render the systemd mount unit for a mount point.
pub fn render_mount_unit(mount_point: &str, device: &str, fs: FsKind) -> String {
    format!(
        "[Unit]\n\
         Description=Replicated data mount for {mount_point}\n\
         \n\
         [Mount]\n\
         What={device}\n\
         Where={mount_point}\n\
         Type={fs}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

/// Render the promoter snippet for a resource.
///
/// Units in `start` are listed in start order; the promoter stops them
/// in reverse on demotion. Demote failure always escalates to a reboot
/// so a wedged node cannot hold the resource hostage.
pub fn render_snippet(resource: &str, start: &[String]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("[[promoter]]\n");
    out.push_str(&format!("[promoter.resources.{resource}]\n"));
    out.push_str("runner = \"systemd\"\n");
    out.push_str("start = [\n");
    for unit in start {
        out.push_str(&format!("  \"{unit}\",\n"));
    }
    out.push_str("]\n");
    out.push_str("on-drbd-demote-failure = \"reboot\"\n");
    out
}
