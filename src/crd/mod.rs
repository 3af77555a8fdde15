//! Custom Resource Definitions for the mount daemon
//!
//! - ClientMount: desired and observed mount state of one node's file systems

pub mod client_mount;

pub use client_mount::*;
