use std::{fmt, net::Ipv4Addr};

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use ipnet::Ipv4Net;
use log::{debug, error, warn};

#[cfg(test)]
use mockall::automock;

use crate::core::error::NetError;

use super::endpoint::Endpoint;

/// Executes `iptables`.
#[cfg_attr(test, automock)]
pub trait Iptables {
    /// Run `iptables` with `args`; `Ok(false)` means it ran and exited with
    /// a non-zero status.
    fn run(&self, args: Vec<String>) -> BoxFuture<'static, anyhow::Result<bool>>;
}

/// Runs the host's `iptables` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIptables;

impl Iptables for SystemIptables {
    fn run(&self, args: Vec<String>) -> BoxFuture<'static, anyhow::Result<bool>> {
        async move {
            let status = tokio::process::Command::new("iptables")
                .args(&args)
                .status()
                .await
                .context("Failed to execute `iptables`")?;

            Ok(status.success())
        }
        .boxed()
    }
}

/// A published port, parsed from `"<hostPort>:<containerPort>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    pub fn parse(entry: &str) -> Result<Self, NetError> {
        let invalid = || NetError::InvalidPortMapping {
            entry: entry.to_string(),
        };

        let (host, container) = entry.split_once(':').ok_or_else(invalid)?;
        let parse_port = |port: &str| {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            port.parse::<u16>().map_err(|_| invalid())
        };

        Ok(PortMapping {
            host_port: parse_port(host)?,
            container_port: parse_port(container)?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

/// Installs the masquerade and port-forward rules of the bridge networks.
#[derive(Debug, Default)]
pub struct NatManager<R: Iptables = SystemIptables> {
    iptables: R,
}

impl<R: Iptables> NatManager<R> {
    pub fn new(iptables: R) -> Self {
        Self { iptables }
    }

    /// Masquerade traffic from `subnet` that leaves through anything but the
    /// network's own bridge. The bridge name ties the rule to the network.
    pub async fn install_outbound_rule(
        &self,
        network_name: &str,
        subnet: &Ipv4Net,
    ) -> anyhow::Result<()> {
        let rule = [
            "-s",
            &subnet.trunc().to_string(),
            "!",
            "-o",
            network_name,
            "-j",
            "MASQUERADE",
        ];

        self.ensure_rule("nat", "POSTROUTING", &rule)
            .await
            .context("Failed to set MASQUERADE rule")
    }

    /// Forward every declared host port to the endpoint. Malformed entries
    /// and rules that fail to install are logged and skipped.
    ///
    /// Returns the mappings that are in place.
    pub async fn install_port_mappings(&self, endpoint: &Endpoint<'_>) -> Vec<PortMapping> {
        let mut installed = Vec::with_capacity(endpoint.port_map.len());

        for entry in &endpoint.port_map {
            let mapping = match PortMapping::parse(entry) {
                Ok(mapping) => mapping,
                Err(e) => {
                    warn!("Skip port mapping of endpoint {}: {e}", endpoint.id);
                    continue;
                }
            };

            match self.install_port_mapping(endpoint.ip, mapping).await {
                Ok(()) => installed.push(mapping),
                Err(e) => error!(
                    "Failed to set port mapping {mapping} of endpoint {}: {e:?}",
                    endpoint.id
                ),
            }
        }

        installed
    }

    async fn install_port_mapping(&self, ip: Ipv4Addr, mapping: PortMapping) -> anyhow::Result<()> {
        let rule = [
            "-p",
            "tcp",
            "-m",
            "tcp",
            "--dport",
            &mapping.host_port.to_string(),
            "-j",
            "DNAT",
            "--to-destination",
            &format!("{ip}:{}", mapping.container_port),
        ];

        self.ensure_rule("nat", "PREROUTING", &rule).await
    }

    /// Append `rule` to `chain` unless an identical rule is already there.
    async fn ensure_rule(&self, table: &str, chain: &str, rule: &[&str]) -> anyhow::Result<()> {
        let args = |op: &str| {
            ["-t", table, op, chain]
                .iter()
                .chain(rule)
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        };

        if self.iptables.run(args("-C")).await? {
            debug!("iptables rule exists in {table}/{chain}: {}", rule.join(" "));
            return Ok(());
        }

        self.iptables
            .run(args("-A"))
            .await?
            .then_some(())
            .context("`iptables` exited with non-zero status")?;

        debug!("iptables rule added to {table}/{chain}: {}", rule.join(" "));
        Ok(())
    }
}
