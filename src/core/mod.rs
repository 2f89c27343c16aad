mod cmd;
mod ops;

pub mod container;
pub mod error;
pub mod network;

pub use cmd::*;
pub use ops::execute;

/// Default root of all persistent runtime state.
pub const ROOT_PATH: &str = "/var/lib/rtain";
