use thiserror::Error;

/// Conditions callers may want to branch on. They travel inside
/// `anyhow::Error` and can be recovered with `downcast_ref::<NetError>()`
/// regardless of how many step contexts were attached on the way up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("network {name} exists")]
    NetworkExists { name: String },

    #[error("network {name} not found")]
    NetworkNotFound { name: String },

    #[error("subnet {subnet} exists")]
    SubnetExists { subnet: String },

    #[error("subnet {subnet} is not registered")]
    UnknownSubnet { subnet: String },

    #[error("no available ip in subnet {subnet}")]
    SubnetExhausted { subnet: String },

    #[error("invalid cidr {cidr}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("invalid port mapping {entry:?}, expected <hostPort>:<containerPort>")]
    InvalidPortMapping { entry: String },

    #[error("device {name} already exists")]
    DeviceExists { name: String },

    #[error("ip {ip} is not allocated in subnet {subnet}")]
    AddressNotAllocated { subnet: String, ip: String },

    #[error("invalid descriptor for network {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

impl NetError {
    pub fn invalid_cidr(cidr: &str, reason: impl ToString) -> Self {
        NetError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_descriptor(name: &str, reason: impl ToString) -> Self {
        NetError::InvalidDescriptor {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("rootfs {id} does not exist")]
    RootfsNotExist { id: String },
    #[error("invalid container id {id:?}")]
    InvalidId { id: String },
}
