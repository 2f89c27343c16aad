use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

pub mod rootfs;

/// The part of a container record the network layer reads and fills in.
/// Owned by the runtime; `connect` writes `network` and `ip` back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Pid of the container's init process.
    pub pid: i32,
    pub network: Option<String>,
    /// Assigned address with the network's prefix length.
    pub ip: Option<Ipv4Net>,
    /// `"<hostPort>:<containerPort>"` entries.
    pub port_map: Vec<String>,
    pub hosts_path: PathBuf,
}
