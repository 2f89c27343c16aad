use std::{
    collections::HashMap,
    io::Read,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use bitvec::prelude::*;
use ipnet::Ipv4Net;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::error::NetError;

/// Longest prefix that still leaves a host address besides the gateway.
pub const MAX_PREFIX_LEN: u8 = 30;

/// Bitmap based address allocator, one bitmap per subnet.
///
/// Bit `i` of a bitmap tracks the address at offset `i + 1` from the
/// network address, so the network and broadcast addresses are never handed
/// out. Offset 1 is reserved for the gateway when the subnet is registered.
///
/// An allocator created with [`IPAM::load`] writes itself back to disk after
/// every mutation. Callers serialize access across processes with the
/// network lock.
#[derive(Serialize, Deserialize, Debug)]
pub struct IPAM {
    #[serde(serialize_with = "serialize_subnets")]
    #[serde(deserialize_with = "deserialize_subnets")]
    subnets: HashMap<String, BitVec<u8>>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl IPAM {
    /// An in-memory allocator that never touches disk.
    pub fn empty() -> Self {
        Self {
            subnets: HashMap::new(),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let mut file = std::fs::File::open(&path)
                .with_context(|| format!("open ipam file {} failed", path.display()))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;

            let mut ipam: IPAM =
                bincode::deserialize(&contents).context("decode ipam file failed")?;
            ipam.path = Some(path);

            Ok(ipam)
        } else {
            if let Some(parent_dir) = path.parent() {
                std::fs::create_dir_all(parent_dir)?;
            }

            Ok(IPAM {
                subnets: HashMap::new(),
                path: Some(path),
            })
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents = bincode::serialize(self).context("encode ipam failed")?;
        std::fs::write(path, contents)
            .with_context(|| format!("write ipam file {} failed", path.display()))?;

        Ok(())
    }

    /// Start tracking `subnet` and reserve its gateway.
    ///
    /// Returns the gateway and whether the subnet was already tracked. A
    /// second registration does not modify anything.
    pub fn register_subnet(&mut self, subnet: &Ipv4Net) -> anyhow::Result<(Ipv4Addr, bool)> {
        let key = Self::key(subnet)?;
        let gateway = Self::calculate_ip(subnet, 1);

        if self.subnets.contains_key(&key) {
            return Ok((gateway, true));
        }

        let total_ips = (1u64 << (32 - subnet.prefix_len())) - 2;

        let mut bitmap = BitVec::new();
        bitmap.resize(total_ips as usize, false);
        bitmap.set(0, true);
        self.subnets.insert(key, bitmap);
        self.save()?;

        debug!("Registered subnet {subnet}, gateway {gateway}");

        Ok((gateway, false))
    }

    pub fn allocate(&mut self, subnet: &Ipv4Net) -> anyhow::Result<Ipv4Addr> {
        let key = Self::key(subnet)?;
        let bitmap = self
            .subnets
            .get_mut(&key)
            .ok_or_else(|| NetError::UnknownSubnet {
                subnet: key.clone(),
            })?;

        let pos = bitmap
            .first_zero()
            .ok_or_else(|| NetError::SubnetExhausted {
                subnet: key.clone(),
            })?;
        bitmap.set(pos, true);
        self.save()?;

        Ok(Self::calculate_ip(subnet, pos as u32 + 1))
    }

    pub fn release(&mut self, subnet: &Ipv4Net, ip: Ipv4Addr) -> anyhow::Result<()> {
        let key = Self::key(subnet)?;
        let not_allocated = || NetError::AddressNotAllocated {
            subnet: key.clone(),
            ip: ip.to_string(),
        };

        let bitmap = self
            .subnets
            .get_mut(&key)
            .ok_or_else(|| NetError::UnknownSubnet {
                subnet: key.clone(),
            })?;

        let pos = Self::ip_to_index(subnet, ip).ok_or_else(not_allocated)?;
        if pos >= bitmap.len() || !bitmap[pos] {
            return Err(not_allocated().into());
        }
        bitmap.set(pos, false);
        self.save()?;

        Ok(())
    }

    pub fn contains_subnet(&self, subnet: &Ipv4Net) -> bool {
        self.subnets.contains_key(&subnet.trunc().to_string())
    }

    fn key(subnet: &Ipv4Net) -> anyhow::Result<String> {
        if subnet.prefix_len() > MAX_PREFIX_LEN {
            return Err(NetError::invalid_cidr(
                &subnet.to_string(),
                format!("prefix length must be at most {MAX_PREFIX_LEN}"),
            )
            .into());
        }

        Ok(subnet.trunc().to_string())
    }

    fn calculate_ip(subnet: &Ipv4Net, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(subnet.network()) + offset)
    }

    fn ip_to_index(subnet: &Ipv4Net, ip: Ipv4Addr) -> Option<usize> {
        if !subnet.contains(&ip) {
            return None;
        }

        (u32::from(ip) - u32::from(subnet.network()))
            .checked_sub(1)
            .map(|index| index as usize)
    }
}

/// Bitmaps are stored with their exact bit length; the raw bytes alone
/// would round every subnet up to a multiple of eight addresses.
#[derive(Serialize, Deserialize)]
struct RawBitmap {
    len: usize,
    bytes: Vec<u8>,
}

fn serialize_subnets<S>(
    subnets: &HashMap<String, BitVec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut map = HashMap::new();
    for (cidr, bitmap) in subnets {
        let raw = RawBitmap {
            len: bitmap.len(),
            bytes: bitmap.as_raw_slice().to_vec(),
        };
        map.insert(cidr, raw);
    }
    map.serialize(serializer)
}

fn deserialize_subnets<'de, D>(deserializer: D) -> Result<HashMap<String, BitVec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map: HashMap<String, RawBitmap> = HashMap::deserialize(deserializer)?;
    let mut subnets = HashMap::new();
    for (cidr, raw) in map {
        let mut bitvec = BitVec::from_vec(raw.bytes);
        if raw.len > bitvec.len() {
            return Err(serde::de::Error::custom(format!(
                "bitmap of {cidr} is shorter than its recorded length"
            )));
        }
        bitvec.truncate(raw.len);
        subnets.insert(cidr, bitvec);
    }
    Ok(subnets)
}
