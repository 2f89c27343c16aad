use std::io::Write;

use anyhow::Context;
use log::info;
use tabwriter::TabWriter;

use super::{
    cmd::{Commands, NetConnectArgs, NetworkCommands, RootfsCommands, CLI},
    container::{rootfs, ContainerInfo},
    network::{NetnsHandle, Network, Networks},
};

/// Run one command line to completion.
pub async fn execute(cli: CLI) -> anyhow::Result<()> {
    match cli.command {
        Commands::Network(command) => {
            let networks = Networks::new(&cli.root).context("open network store failed")?;

            match command {
                NetworkCommands::Create(args) => {
                    let network = networks.create_network(&args.name, &args.subnet).await?;
                    println!("{}", network.name);
                }
                NetworkCommands::Restore(args) => {
                    networks.restore_network(&args.name).await?;
                }
                NetworkCommands::LS => {
                    print!("{}", format_networks(&networks.list_networks()?)?);
                }
                NetworkCommands::Connect(args) => connect_container(&networks, args).await?,
            }
        }
        Commands::Rootfs(RootfsCommands::RM(args)) => {
            rootfs::delete(&cli.root, &args.id)?;
            info!("Rootfs of container {} removed", args.id);
        }
    }

    Ok(())
}

async fn connect_container(networks: &Networks, args: NetConnectArgs) -> anyhow::Result<()> {
    let netns = NetnsHandle::from_pid(args.pid)?;
    let mut info = ContainerInfo {
        id: args.id,
        pid: args.pid,
        port_map: args.publish,
        hosts_path: args.hosts,
        ..Default::default()
    };

    networks.connect(&args.name, &mut info, &netns).await?;

    if let Some(ip) = info.ip {
        println!("{ip}");
    }

    Ok(())
}

fn format_networks(networks: &[Network]) -> anyhow::Result<String> {
    let mut tw = TabWriter::new(vec![]);
    tw.write_all(b"NAME\tSUBNET\tGATEWAY\n")?;

    for network in networks {
        writeln!(tw, "{}\t{}\t{}", network.name, network.subnet, network.gateway)?;
    }

    tw.flush()?;
    let table = tw
        .into_inner()
        .map_err(|_| anyhow::anyhow!("flush network table failed"))?;

    Ok(String::from_utf8(table)?)
}
