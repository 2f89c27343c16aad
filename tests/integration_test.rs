use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use ipnet::Ipv4Net;
use nix::errno::Errno;
use rtain_net::{
    container::{rootfs, ContainerInfo},
    error::{NetError, StorageError},
    network::{
        endpoint_id, peer_name, run_in_namespace, Endpoint, NetnsHandle, Network, NetworkLock,
        Networks, IPAM,
    },
};
use tempfile::TempDir;

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

/// Entering a namespace, even the caller's own, needs CAP_SYS_ADMIN.
fn switch_denied(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Errno>() == Some(&Errno::EPERM)
}

fn write_descriptor(networks: &Networks, name: &str, subnet: &str, gateway: &str) {
    std::fs::write(
        networks.paths().descriptor(name),
        format!(r#"{{"Name": "{name}", "Subnet": "{subnet}", "Gateway": "{gateway}"}}"#),
    )
    .unwrap();
}

/// Allocation state survives a restart and hands out distinct addresses
/// until the subnet runs dry.
#[test]
fn test_allocations_across_restarts() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("subnet.db");
    let subnet = net("172.30.0.0/28");

    let (gateway, exists) = IPAM::load(&path).unwrap().register_subnet(&subnet).unwrap();
    assert_eq!(gateway, Ipv4Addr::new(172, 30, 0, 1));
    assert!(!exists);

    let (_, exists) = IPAM::load(&path).unwrap().register_subnet(&subnet).unwrap();
    assert!(exists);

    // Every allocation reloads from disk, like one runtime command each.
    let mut seen = Vec::new();
    loop {
        match IPAM::load(&path).unwrap().allocate(&subnet) {
            Ok(ip) => {
                assert!(subnet.contains(&ip));
                assert_ne!(ip, gateway);
                assert!(!seen.contains(&ip));
                seen.push(ip);
            }
            Err(e) => {
                assert_eq!(
                    e.downcast_ref::<NetError>(),
                    Some(&NetError::SubnetExhausted {
                        subnet: "172.30.0.0/28".to_string()
                    })
                );
                break;
            }
        }
    }

    // 14 host addresses, one of them the gateway.
    assert_eq!(seen.len(), 13);
    assert_eq!(seen[0], Ipv4Addr::new(172, 30, 0, 2));
    assert_eq!(seen[12], Ipv4Addr::new(172, 30, 0, 14));
}

#[test]
fn test_lock_serializes_independent_handles() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("network.lock");

    let guard = NetworkLock::new(&path).acquire().unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let path = path.clone();
        thread::spawn(move || {
            let _guard = NetworkLock::new(&path).acquire().unwrap();
            tx.send(()).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    drop(guard);
    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    waiter.join().unwrap();
}

#[test]
fn test_endpoint_naming_example() {
    let network = Network {
        name: "br0".to_string(),
        subnet: net("172.18.0.0/24"),
        gateway: Ipv4Addr::new(172, 18, 0, 1),
    };

    let endpoint = Endpoint::new(
        &network,
        "abcdef0123456789",
        Ipv4Addr::new(172, 18, 0, 2),
        vec![],
    );

    assert_eq!(endpoint.id, "br0-abcdef012");
    assert_eq!(endpoint.id, endpoint_id("br0", "abcdef0123456789"));
    assert_eq!(endpoint.device.peer_name, peer_name(&endpoint.id));
    assert_eq!(endpoint.device.peer_name, "peer-br0-abcd");
    assert_eq!(endpoint.ip_net().to_string(), "172.18.0.2/24");
}

#[tokio::test]
async fn test_create_existing_network_fails() {
    let temp_dir = TempDir::new().unwrap();
    let networks = Networks::new(temp_dir.path()).unwrap();
    write_descriptor(&networks, "br0", "172.18.0.0/24", "172.18.0.1");

    let err = networks
        .create_network("br0", &net("172.18.0.0/24"))
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<NetError>(),
        Some(&NetError::NetworkExists {
            name: "br0".to_string()
        })
    );
    assert_eq!(networks.load_network("br0").unwrap().name, "br0");
}

#[tokio::test]
async fn test_connect_to_missing_network() {
    let temp_dir = TempDir::new().unwrap();
    let networks = Networks::new(temp_dir.path()).unwrap();

    let hosts_path = temp_dir.path().join("hosts");
    std::fs::write(&hosts_path, "").unwrap();
    let mut info = ContainerInfo {
        id: "abcdef0123456789".to_string(),
        hosts_path: hosts_path.clone(),
        port_map: vec!["8080:80".to_string()],
        ..Default::default()
    };
    let original = info.clone();

    let before = NetnsHandle::current().unwrap().inode().unwrap();
    let netns = NetnsHandle::current().unwrap();
    let err = networks.connect("nope", &mut info, &netns).await.unwrap_err();

    assert_eq!(
        err.downcast_ref::<NetError>(),
        Some(&NetError::NetworkNotFound {
            name: "nope".to_string()
        })
    );
    assert!(format!("{err:#}").starts_with("load network failed"));
    assert_eq!(info, original);
    assert_eq!(std::fs::read_to_string(&hosts_path).unwrap(), "");
    assert_eq!(NetnsHandle::current().unwrap().inode().unwrap(), before);
}

#[tokio::test]
async fn test_connect_to_exhausted_network() {
    let temp_dir = TempDir::new().unwrap();
    let networks = Networks::new(temp_dir.path()).unwrap();
    let subnet = net("172.31.0.0/30");

    write_descriptor(&networks, "tiny", "172.31.0.0/30", "172.31.0.1");
    let mut ipam = IPAM::load(networks.paths().ipam_file()).unwrap();
    ipam.register_subnet(&subnet).unwrap();
    ipam.allocate(&subnet).unwrap();

    let mut info = ContainerInfo {
        id: "c1".to_string(),
        hosts_path: temp_dir.path().join("hosts"),
        ..Default::default()
    };
    let netns = NetnsHandle::current().unwrap();
    let err = networks.connect("tiny", &mut info, &netns).await.unwrap_err();

    assert_eq!(
        err.downcast_ref::<NetError>(),
        Some(&NetError::SubnetExhausted {
            subnet: "172.31.0.0/30".to_string()
        })
    );
    assert!(format!("{err:#}").starts_with("allocate ip failed"));
    assert_eq!(info.ip, None);
}

#[tokio::test]
async fn test_namespace_switch_failure_leaves_caller_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let not_a_namespace = temp_dir.path().join("net");
    std::fs::write(&not_a_namespace, "").unwrap();

    let before = NetnsHandle::current().unwrap().inode().unwrap();
    let target = NetnsHandle::from_path(&not_a_namespace).unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let result = run_in_namespace(&target, move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok::<(), anyhow::Error>(())
    })
    .await;

    assert!(!ran.load(Ordering::SeqCst));
    assert!(result.is_err());
    assert_eq!(NetnsHandle::current().unwrap().inode().unwrap(), before);
}

#[tokio::test]
async fn test_namespace_switch_returns_work_result() {
    let current = NetnsHandle::current().unwrap();
    let before = current.inode().unwrap();

    let result = run_in_namespace(&current, || async { Ok::<_, anyhow::Error>(42) }).await;
    match result {
        Err(e) if switch_denied(&e) => {
            println!("Skipping: no permission to switch namespace");
        }
        result => assert_eq!(result.unwrap(), 42),
    }

    assert_eq!(NetnsHandle::current().unwrap().inode().unwrap(), before);
}

#[tokio::test]
async fn test_namespace_switch_restores_after_failed_work() {
    let current = NetnsHandle::current().unwrap();
    let before = current.inode().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = run_in_namespace(&current, move || async move {
        flag.store(true, Ordering::SeqCst);
        Err::<(), _>(anyhow::anyhow!("set container interface IP failed"))
    })
    .await
    .unwrap_err();

    if switch_denied(&err) {
        println!("Skipping: no permission to switch namespace");
        assert!(!ran.load(Ordering::SeqCst));
        return;
    }

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(err.to_string(), "set container interface IP failed");
    assert_eq!(NetnsHandle::current().unwrap().inode().unwrap(), before);
}

#[test]
fn test_rootfs_delete() {
    let temp_dir = TempDir::new().unwrap();

    let err = rootfs::delete(temp_dir.path(), "c1").unwrap_err();
    assert_eq!(
        err.downcast_ref::<StorageError>(),
        Some(&StorageError::RootfsNotExist {
            id: "c1".to_string()
        })
    );

    std::fs::create_dir_all(temp_dir.path().join("rootfs/c1/mnt/etc")).unwrap();
    assert!(rootfs::exists(temp_dir.path(), "c1"));

    rootfs::delete(temp_dir.path(), "c1").unwrap();
    assert!(!rootfs::exists(temp_dir.path(), "c1"));
}
