use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ipnet::Ipv4Net;

use super::{
    network::{PortMapping, MAX_PREFIX_LEN},
    ROOT_PATH,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "rtain-net")]
#[command(about = "Bridge networking for rtain containers.")]
pub struct CLI {
    /// Root directory of the runtime state.
    #[arg(long, global = true, default_value = ROOT_PATH)]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage networks.
    #[command(subcommand)]
    Network(NetworkCommands),
    /// Manage container root filesystems.
    #[command(subcommand)]
    Rootfs(RootfsCommands),
}

#[derive(Subcommand, Debug, Clone)]
pub enum NetworkCommands {
    /// Create a bridge network.
    Create(NetCreateArgs),
    /// Bring a stored network's bridge and NAT rule back.
    Restore(NetRestoreArgs),
    /// List networks.
    LS,
    /// Attach a running container to a network.
    Connect(NetConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NetCreateArgs {
    /// Subnet in CIDR notation, e.g. 172.18.0.0/24.
    #[arg(short, long, value_parser(parse_subnet))]
    pub subnet: Ipv4Net,

    /// Name of the network, also used as the bridge name.
    #[arg(required = true)]
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct NetRestoreArgs {
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct NetConnectArgs {
    /// Network to join.
    #[arg(required = true)]
    pub name: String,

    /// Container ID.
    #[arg(long)]
    pub id: String,

    /// Pid of the container's init process.
    #[arg(long)]
    pub pid: i32,

    /// The container's hosts file.
    #[arg(long)]
    pub hosts: PathBuf,

    /// Publish a port, <hostPort>:<containerPort>.
    #[arg(short, long, value_parser(parse_port_mapping))]
    pub publish: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RootfsCommands {
    /// Remove a container's root filesystem.
    RM(RMArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RMArgs {
    pub id: String,
}

/// Parse an IPv4 subnet that leaves room for containers.
fn parse_subnet(input: &str) -> Result<Ipv4Net, String> {
    let subnet: Ipv4Net = input.trim().parse().map_err(|e| format!("{e}"))?;

    if subnet.prefix_len() > MAX_PREFIX_LEN {
        return Err(format!("prefix length must be at most {MAX_PREFIX_LEN}"));
    }

    Ok(subnet)
}

fn parse_port_mapping(input: &str) -> Result<String, String> {
    PortMapping::parse(input)
        .map(|_| input.to_string())
        .map_err(|e| e.to_string())
}
