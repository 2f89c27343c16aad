use std::{fs::OpenOptions, io::Write, net::Ipv4Addr};

use anyhow::Context;
use ipnet::Ipv4Net;
use log::{debug, info};

use crate::core::container::ContainerInfo;

use super::{
    bridge::{ensure_link_absent, Netlink},
    nat::Iptables,
    netns::{run_in_namespace, NetnsHandle},
    Network, Networks, IPAM,
};

/// Longest interface name handed to the kernel, in bytes.
pub const IFNAME_MAX_LEN: usize = 13;

/// Keep the first [`IFNAME_MAX_LEN`] bytes of `name`, backing off to the
/// previous character boundary.
///
/// Similar inputs can collide after truncation; creating the second device
/// then fails with [`NetError::DeviceExists`](crate::core::error::NetError).
pub fn truncate_ifname(name: &str) -> String {
    let mut end = name.len().min(IFNAME_MAX_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }

    name[..end].to_string()
}

/// Host-side interface name of a container on a network.
pub fn endpoint_id(network_name: &str, container_id: &str) -> String {
    truncate_ifname(&format!("{network_name}-{container_id}"))
}

/// Container-side interface name for an endpoint.
pub fn peer_name(endpoint_id: &str) -> String {
    truncate_ifname(&format!("peer-{endpoint_id}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host side, enslaved to the bridge.
    pub name: String,
    /// Container side, moved into the container's namespace.
    pub peer_name: String,
    pub master_index: u32,
}

/// A container's attachment to a network, alive for one connect call.
#[derive(Debug)]
pub struct Endpoint<'a> {
    pub id: String,
    pub device: VethPair,
    pub ip: Ipv4Addr,
    pub port_map: Vec<String>,
    pub network: &'a Network,
}

impl<'a> Endpoint<'a> {
    pub fn new(
        network: &'a Network,
        container_id: &str,
        ip: Ipv4Addr,
        port_map: Vec<String>,
    ) -> Self {
        let id = endpoint_id(&network.name, container_id);
        let device = VethPair {
            name: id.clone(),
            peer_name: peer_name(&id),
            master_index: 0,
        };

        Self {
            id,
            device,
            ip,
            port_map,
            network,
        }
    }

    /// The endpoint address with the network's prefix.
    pub fn ip_net(&self) -> Ipv4Net {
        Ipv4Net::new(self.ip, self.network.subnet.prefix_len())
            .unwrap_or_else(|_| Ipv4Net::from(self.ip))
    }
}

impl<R: Iptables> Networks<R> {
    /// Attach a container to `network_name`.
    ///
    /// On success the container's namespace has an interface with an address
    /// from the network's subnet and a default route via the gateway, its
    /// port mappings are forwarded, `info` records the network and address,
    /// and the container's hosts file has a line for it.
    ///
    /// Kernel objects created before a failing step are left in place.
    pub async fn connect(
        &self,
        network_name: &str,
        info: &mut ContainerInfo,
        netns: &NetnsHandle,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.acquire()?;

        let network = self
            .read_descriptor(network_name)
            .context("load network failed")?;
        network.validate().context("network subnet invalid")?;

        let ip = IPAM::load(self.paths.ipam_file())
            .and_then(|mut ipam| ipam.allocate(&network.subnet))
            .context("allocate ip failed")?;

        let mut endpoint = Endpoint::new(&network, &info.id, ip, info.port_map.clone());
        debug!("Endpoint {} for container {} gets {ip}", endpoint.id, info.id);

        let nl = Netlink::connect()?;
        endpoint.device.master_index = nl
            .link_index(&network.name)
            .await
            .context("get bridge failed")?;

        ensure_link_absent(&endpoint.device.name).context("add endpoint device failed")?;
        nl.create_veth(&endpoint.device)
            .await
            .context("add endpoint device failed")?;
        nl.set_link_up(&endpoint.device.name)
            .await
            .context("set up endpoint device failed")?;

        nl.move_to_netns(&endpoint.device.peer_name, netns)
            .await
            .context("move endpoint peer to container netns failed")?;
        set_endpoint_ip_and_route(&endpoint, netns)
            .await
            .context("set endpoint ip and route failed")?;

        self.nat.install_port_mappings(&endpoint).await;

        info.network = Some(network_name.to_string());
        info.ip = Some(endpoint.ip_net());

        append_hosts_entry(info, ip).context("write hosts file failed")?;

        info!(
            "Container {} connected to network {network_name} with ip {ip}",
            info.id
        );

        Ok(())
    }
}

/// Configure the container side from inside its namespace: address, link
/// state of the peer and of `lo`, default route.
async fn set_endpoint_ip_and_route(endpoint: &Endpoint<'_>, netns: &NetnsHandle) -> anyhow::Result<()> {
    let peer = endpoint.device.peer_name.clone();
    let ip_net = endpoint.ip_net();
    let gateway = endpoint.network.gateway;

    run_in_namespace(netns, move || async move {
        let nl = Netlink::connect()?;

        nl.add_address(&peer, ip_net.addr(), ip_net.prefix_len())
            .await
            .context("set container interface IP failed")?;
        nl.set_link_up(&peer)
            .await
            .context("set up container interface failed")?;
        nl.set_link_up("lo")
            .await
            .context("set up container lo failed")?;
        nl.add_default_route(&peer, gateway)
            .await
            .context("add default route failed")?;

        Ok::<(), anyhow::Error>(())
    })
    .await
}

fn append_hosts_entry(info: &ContainerInfo, ip: Ipv4Addr) -> anyhow::Result<()> {
    let mut hosts = OpenOptions::new()
        .append(true)
        .open(&info.hosts_path)
        .with_context(|| format!("open hosts file {} failed", info.hosts_path.display()))?;

    writeln!(hosts, "{ip}\t{}", info.id)?;

    Ok(())
}
