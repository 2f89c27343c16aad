use std::{
    net::{IpAddr, Ipv4Addr},
    os::fd::AsRawFd,
};

use anyhow::Context;
use futures::TryStreamExt;
use log::debug;
use netlink_packet_route::{address::AddressAttribute, link::LinkMessage};
use nix::net::if_::if_nametoindex;

use crate::core::error::NetError;

use super::{endpoint::VethPair, netns::NetnsHandle};

/// Whether an interface called `name` exists in the calling thread's
/// network namespace.
pub fn link_exists(name: &str) -> bool {
    if_nametoindex(name).is_ok()
}

/// Fail with [`NetError::DeviceExists`] if `name` is already taken.
pub fn ensure_link_absent(name: &str) -> anyhow::Result<()> {
    if link_exists(name) {
        return Err(NetError::DeviceExists {
            name: name.to_string(),
        }
        .into());
    }

    Ok(())
}

/// A netlink connection bound to the namespace of the thread that opened it.
pub struct Netlink {
    handle: rtnetlink::Handle,
}

impl Netlink {
    /// Must be called from within a tokio runtime, which drives the
    /// connection.
    pub fn connect() -> anyhow::Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("open netlink connection failed")?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    /// Create the bridge `name` unless an interface of that name exists.
    pub async fn ensure_bridge(&self, name: &str) -> anyhow::Result<u32> {
        if !link_exists(name) {
            self.handle
                .link()
                .add()
                .bridge(name.to_string())
                .execute()
                .await
                .with_context(|| format!("add br {name} failed"))?;
            debug!("Created bridge {name}");
        } else {
            debug!("Bridge {name} exists, reusing it");
        }

        self.link_index(name).await
    }

    /// Create the veth pair, then enslave its host side to the bridge.
    pub async fn create_veth(&self, device: &VethPair) -> anyhow::Result<u32> {
        self.handle
            .link()
            .add()
            .veth(device.name.clone(), device.peer_name.clone())
            .execute()
            .await
            .with_context(|| format!("add veth {} failed", device.name))?;

        let index = self.link_index(&device.name).await?;
        self.handle
            .link()
            .set(index)
            .controller(device.master_index)
            .execute()
            .await
            .with_context(|| format!("set master of {} failed", device.name))?;

        debug!(
            "Created veth {} <-> {} on master {}",
            device.name, device.peer_name, device.master_index
        );

        Ok(index)
    }

    pub async fn set_link_up(&self, name: &str) -> anyhow::Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .with_context(|| format!("set {name} up failed"))?;

        Ok(())
    }

    /// Assign `ip/prefix_len` to `name` unless it already carries `ip`.
    pub async fn ensure_address(
        &self,
        name: &str,
        ip: Ipv4Addr,
        prefix_len: u8,
    ) -> anyhow::Result<()> {
        let index = self.link_index(name).await?;

        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addresses.try_next().await? {
            let present = msg
                .attributes
                .iter()
                .any(|attr| matches!(attr, AddressAttribute::Address(addr) if *addr == IpAddr::V4(ip)));
            if present {
                debug!("{name} already has address {ip}");
                return Ok(());
            }
        }

        self.add_address(name, ip, prefix_len).await
    }

    pub async fn add_address(&self, name: &str, ip: Ipv4Addr, prefix_len: u8) -> anyhow::Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .address()
            .add(index, ip.into(), prefix_len)
            .execute()
            .await
            .with_context(|| format!("add addr {ip}/{prefix_len} to {name} failed"))?;

        Ok(())
    }

    pub async fn move_to_netns(&self, name: &str, netns: &NetnsHandle) -> anyhow::Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns.as_raw_fd())
            .execute()
            .await
            .with_context(|| format!("move {name} to netns failed"))?;

        Ok(())
    }

    /// Route everything not covered by a more specific route via `gateway`.
    pub async fn add_default_route(&self, name: &str, gateway: Ipv4Addr) -> anyhow::Result<()> {
        let index = self.link_index(name).await?;
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .output_interface(index)
            .gateway(gateway)
            .execute()
            .await
            .with_context(|| format!("add default route via {gateway} failed"))?;

        Ok(())
    }

    pub async fn link_index(&self, name: &str) -> anyhow::Result<u32> {
        Ok(self.get_link_by_name(name).await?.header.index)
    }

    async fn get_link_by_name(&self, name: &str) -> anyhow::Result<LinkMessage> {
        self.handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .with_context(|| format!("get link {name} failed"))?
            .ok_or(anyhow::anyhow!("Link {name} not found"))
    }
}
