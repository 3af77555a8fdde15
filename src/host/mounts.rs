//! Mount Table Inspection
//!
//! Determines whether a path is currently a mount point by scanning the
//! output of `mount`.

use crate::crd::ClientMountState;
use crate::domain::ports::CommandExecutor;
use crate::error::{Error, Result};

/// Command listing every mounted file system
pub const MOUNT_TABLE_COMMAND: &str = "mount";

/// Mount points listed in `mount` output.
///
/// Lines look like `<device> on <path> type <fs> (<options>)`. The mount
/// point is everything between ` on ` and the last ` type `, so paths may
/// contain spaces.
pub fn mount_points(output: &str) -> impl Iterator<Item = &str> {
    output.lines().filter_map(|line| {
        let (_, rest) = line.split_once(" on ")?;
        let (path, _) = rest.rsplit_once(" type ")?;
        Some(path)
    })
}

/// Reads mount state through a command executor
pub struct MountInspector<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> MountInspector<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    /// Mount state of `mount_path`. Failing to read the mount table is an
    /// error, never a "not mounted" answer.
    pub async fn check(&self, mount_path: &str) -> Result<ClientMountState> {
        let output = self
            .executor
            .run(MOUNT_TABLE_COMMAND)
            .await
            .map_err(|e| Error::storage("Could not read the mount table", true, e))?;

        if mount_points(&output).any(|p| p == mount_path) {
            Ok(ClientMountState::Mounted)
        } else {
            Ok(ClientMountState::Unmounted)
        }
    }
}
