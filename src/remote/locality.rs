//! Local host classification
//!
//! Commands that target the controller's own host must bypass the SSH
//! layer. Classification happens once per executor call against a
//! snapshot of the machine's identity: hostname plus every non-loopback
//! interface address.

use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

/// Snapshot of the controller host's identity.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    hostname: String,
    addresses: HashSet<IpAddr>,
}

impl LocalIdentity {
    /// Build an identity from explicit parts.
    pub fn new(hostname: impl Into<String>, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            hostname: hostname.into(),
            addresses: addresses.into_iter().collect(),
        }
    }

    /// Detect the running machine's identity.
    ///
    /// Enumeration failures degrade to an empty address set; loopback and
    /// hostname matches still classify as local.
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|err| {
                warn!("hostname lookup failed: {err}");
                String::new()
            });

        let mut addresses = HashSet::new();
        match nix::ifaddrs::getifaddrs() {
            Ok(ifaddrs) => {
                for ifaddr in ifaddrs {
                    let Some(storage) = ifaddr.address else {
                        continue;
                    };
                    let ip = if let Some(sin) = storage.as_sockaddr_in() {
                        IpAddr::V4(sin.ip())
                    } else if let Some(sin6) = storage.as_sockaddr_in6() {
                        IpAddr::V6(sin6.ip())
                    } else {
                        continue;
                    };
                    if !ip.is_loopback() {
                        addresses.insert(ip);
                    }
                }
            }
            Err(err) => warn!("interface enumeration failed: {err}"),
        }

        Self { hostname, addresses }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Classify one target host string.
    ///
    /// The local hostname, "localhost", loopback addresses and any
    /// non-loopback interface address all classify as local; everything
    /// else goes over SSH.
    pub fn is_local(&self, host: &str) -> bool {
        if host == "localhost" || (!self.hostname.is_empty() && host == self.hostname) {
            return true;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback() || self.addresses.contains(&ip),
            Err(_) => false,
        }
    }
}
