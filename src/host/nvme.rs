//! NVMe Namespace Rescan
//!
//! Asks every NVMe controller on the node to re-enumerate its namespaces,
//! so that namespaces attached after boot (and the volume groups on them)
//! become visible.

use crate::domain::ports::CommandExecutor;
use crate::error::{Error, Result};
use tracing::{info, warn};

/// Glob matching NVMe character and block devices
const NVME_DEVICE_GLOB: &str = "/dev/nvme*";

/// Whether a device name is a controller (`nvme0`) rather than a namespace
/// (`nvme0n1`) or partition (`nvme0n1p1`)
pub fn is_controller(name: &str) -> bool {
    name.strip_prefix("nvme")
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Rescans NVMe namespaces through a command executor
pub struct NvmeRescanner<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> NvmeRescanner<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    /// Controller device paths present on the node, sorted
    pub async fn controllers(&self) -> Result<Vec<String>> {
        let mut controllers: Vec<String> = self
            .executor
            .list_paths(NVME_DEVICE_GLOB)
            .await?
            .into_iter()
            .filter(|path| {
                path.strip_prefix("/dev/")
                    .map(is_controller)
                    .unwrap_or(false)
            })
            .collect();
        controllers.sort();
        Ok(controllers)
    }

    /// Run `nvme ns-rescan` on every controller
    pub async fn rescan(&self) -> Result<()> {
        let controllers = self.controllers().await?;
        if controllers.is_empty() {
            warn!("No NVMe controllers found, skipping namespace rescan");
            return Ok(());
        }

        for controller in &controllers {
            self.executor
                .run(&format!("nvme ns-rescan {}", controller))
                .await
                .map_err(|e| Error::storage("Could not rescan NVMe devices", true, e))?;
        }

        info!("Rescanned {} NVMe controllers", controllers.len());
        Ok(())
    }
}
