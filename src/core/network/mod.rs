use std::path::{Path, PathBuf};

mod bridge;
mod endpoint;
mod ipam;
mod lock;
mod nat;
mod netns;
mod network;

pub use bridge::{ensure_link_absent, link_exists};
pub use endpoint::{endpoint_id, peer_name, truncate_ifname, Endpoint, VethPair, IFNAME_MAX_LEN};
pub use ipam::{IPAM, MAX_PREFIX_LEN};
pub use lock::{NetworkLock, NetworkLockGuard};
pub use nat::{Iptables, NatManager, PortMapping, SystemIptables};
pub use netns::{run_in_namespace, NetnsHandle};
pub use network::*;

/// On-disk layout of the network state under the runtime root.
#[derive(Debug, Clone)]
pub struct NetworkPaths {
    root: PathBuf,
}

impl NetworkPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join("network"),
        }
    }

    /// Directory holding one descriptor per network.
    pub fn bridge_dir(&self) -> PathBuf {
        self.root.join("bridge")
    }

    pub fn descriptor(&self, name: &str) -> PathBuf {
        self.bridge_dir().join(name)
    }

    pub fn ipam_file(&self) -> PathBuf {
        self.root.join("ipam").join("subnet.db")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("network.lock")
    }
}

/// Entry point for creating networks and attaching containers to them.
///
/// Every mutating operation holds the host-wide [`NetworkLock`] for its whole
/// duration, so separate processes each owning a `Networks` never interleave.
pub struct Networks<R: Iptables = SystemIptables> {
    paths: NetworkPaths,
    lock: NetworkLock,
    nat: NatManager<R>,
}

impl Networks {
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::with_iptables(root, SystemIptables)
    }
}

impl<R: Iptables> Networks<R> {
    pub fn with_iptables(root: impl AsRef<Path>, iptables: R) -> anyhow::Result<Self> {
        let paths = NetworkPaths::new(root);
        std::fs::create_dir_all(paths.bridge_dir())?;

        Ok(Self {
            lock: NetworkLock::new(paths.lock_file()),
            paths,
            nat: NatManager::new(iptables),
        })
    }

    pub fn paths(&self) -> &NetworkPaths {
        &self.paths
    }
}
