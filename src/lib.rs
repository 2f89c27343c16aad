mod core;

pub use crate::core::{container, error, execute, network, ROOT_PATH};

// Re-export commonly used types for integration tests
pub use crate::core::{Commands, NetCreateArgs, NetworkCommands, CLI};
