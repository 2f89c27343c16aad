use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    net::Ipv4Addr,
    path::Path,
};

use anyhow::Context;
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::error::NetError;

use super::{bridge::Netlink, ipam::MAX_PREFIX_LEN, nat::Iptables, Networks, IPAM};

/// A bridge-backed network. Stored as one JSON descriptor per network.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    pub name: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
}

impl Network {
    /// The subnet must leave room for containers and hold the gateway.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.subnet.prefix_len() > MAX_PREFIX_LEN {
            return Err(NetError::invalid_cidr(
                &self.subnet.to_string(),
                format!("prefix length must be at most {MAX_PREFIX_LEN}"),
            ));
        }

        if !self.subnet.contains(&self.gateway)
            || self.gateway == self.subnet.network()
            || self.gateway == self.subnet.broadcast()
        {
            return Err(NetError::invalid_descriptor(
                &self.name,
                format!("gateway {} outside of subnet {}", self.gateway, self.subnet),
            ));
        }

        Ok(())
    }
}

/// How [`Networks::create_or_load_network`] treats an existing descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// The name must be new.
    Create,
    /// Reuse the stored network and bring its bridge and NAT rule back.
    Restore,
}

impl<R: Iptables> Networks<R> {
    pub async fn create_network(&self, name: &str, subnet: &Ipv4Net) -> anyhow::Result<Network> {
        self.create_or_load_network(name, subnet, CreateMode::Create)
            .await
    }

    /// Re-create the kernel side of a stored network, e.g. after a reboot.
    /// Everything that already exists is left as is.
    pub async fn restore_network(&self, name: &str) -> anyhow::Result<Network> {
        let _guard = self.lock.acquire()?;

        let network = self.read_descriptor(name).context("load network failed")?;
        self.init_network(&network)
            .await
            .context("init network failed")?;

        info!("Network {name} restored");
        Ok(network)
    }

    pub async fn create_or_load_network(
        &self,
        name: &str,
        subnet: &Ipv4Net,
        mode: CreateMode,
    ) -> anyhow::Result<Network> {
        check_name(name)?;
        let _guard = self.lock.acquire()?;

        let network = if self.paths.descriptor(name).exists() {
            if mode == CreateMode::Create {
                return Err(NetError::NetworkExists {
                    name: name.to_string(),
                }
                .into());
            }

            let network = self.read_descriptor(name).context("load network failed")?;
            if network.subnet != subnet.trunc() {
                warn!(
                    "Network {name} is stored with subnet {}, ignoring {subnet}",
                    network.subnet
                );
            }
            network
        } else {
            self.register(name, subnet)?
        };

        self.init_network(&network)
            .await
            .context("init network failed")?;

        info!(
            "Network {name} ready, subnet {} gateway {}",
            network.subnet, network.gateway
        );
        Ok(network)
    }

    /// Read a network descriptor.
    pub fn load_network(&self, name: &str) -> anyhow::Result<Network> {
        self.read_descriptor(name)
    }

    /// All readable descriptors, sorted by name.
    pub fn list_networks(&self) -> anyhow::Result<Vec<Network>> {
        let mut networks = Vec::new();

        for entry in std::fs::read_dir(self.paths.bridge_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            match self.read_descriptor(&name) {
                Ok(network) => networks.push(network),
                Err(e) => warn!("Skip network descriptor {name}: {e:#}"),
            }
        }

        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    pub(super) fn read_descriptor(&self, name: &str) -> anyhow::Result<Network> {
        check_name(name)?;

        let path = self.paths.descriptor(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(NetError::NetworkNotFound {
                    name: name.to_string(),
                }
                .into())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read {} failed", path.display()));
            }
        };

        let network: Network = serde_json::from_str(&contents)
            .map_err(|e| NetError::invalid_descriptor(name, e))?;
        network.validate()?;

        Ok(network)
    }

    /// Persist a new network: placeholder descriptor, subnet registration,
    /// full descriptor, in that order. Must run under the network lock.
    fn register(&self, name: &str, subnet: &Ipv4Net) -> anyhow::Result<Network> {
        check_name(name)?;

        let path = self.paths.descriptor(name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(NetError::NetworkExists {
                    name: name.to_string(),
                }
                .into())
            }
            Err(e) => return Err(e).context("create network file failed"),
        };

        let registered = IPAM::load(self.paths.ipam_file())
            .and_then(|mut ipam| ipam.register_subnet(subnet));

        let gateway = match registered {
            Ok((_, true)) => {
                remove_placeholder(&path);
                return Err(NetError::SubnetExists {
                    subnet: subnet.trunc().to_string(),
                }
                .into());
            }
            Ok((gateway, false)) => gateway,
            Err(e) => {
                remove_placeholder(&path);
                return Err(e.context("allocate subnet failed"));
            }
        };

        let network = Network {
            name: name.to_string(),
            subnet: subnet.trunc(),
            gateway,
        };

        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut file, formatter);
        network
            .serialize(&mut serializer)
            .context("encode network file failed")?;
        file.write_all(b"\n")
            .context("encode network file failed")?;

        debug!("Registered network {name} with subnet {}", network.subnet);
        Ok(network)
    }

    /// Bring up the bridge with the gateway address and install the
    /// outbound NAT rule. Safe to repeat.
    async fn init_network(&self, network: &Network) -> anyhow::Result<()> {
        let nl = Netlink::connect()?;

        nl.ensure_bridge(&network.name)
            .await
            .context("create bridge failed")?;
        nl.ensure_address(&network.name, network.gateway, network.subnet.prefix_len())
            .await
            .context("set interface gateway IP failed")?;
        nl.set_link_up(&network.name)
            .await
            .context("set bridge up failed")?;
        self.nat
            .install_outbound_rule(&network.name, &network.subnet)
            .await
            .context("setup iptables failed")?;

        Ok(())
    }
}

fn remove_placeholder(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to remove network file {}: {e}", path.display());
    }
}

/// Names become file names and bridge names.
fn check_name(name: &str) -> Result<(), NetError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(NetError::invalid_descriptor(name, "invalid network name"));
    }

    Ok(())
}
