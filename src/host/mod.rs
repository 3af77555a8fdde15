//! Host Module
//!
//! Everything that talks to the node: command execution, mount table
//! inspection, LVM activation, NVMe rescans and device resolution.

pub mod executor;
pub mod mounts;
pub mod lvm;
pub mod nvme;
pub mod device;

pub use executor::*;
pub use mounts::*;
pub use lvm::*;
pub use nvme::*;
pub use device::*;
