//! Device Resolution
//!
//! Turns a mount's device descriptor into the device argument of the mount
//! command, activating logical volumes on the way.

use crate::crd::{ClientMountDevice, ClientMountInfo};
use crate::domain::ports::CommandExecutor;
use crate::error::{Error, Result};
use crate::host::lvm::LvmCoordinator;

/// Resolves mount devices through a command executor
pub struct DeviceResolver<'a> {
    executor: &'a dyn CommandExecutor,
    shared_filesystems: &'a [String],
}

impl<'a> DeviceResolver<'a> {
    pub fn new(executor: &'a dyn CommandExecutor, shared_filesystems: &'a [String]) -> Self {
        Self {
            executor,
            shared_filesystems,
        }
    }

    /// Whether the file system is mounted from several nodes at once and
    /// needs shared, lock-managed activation
    pub fn is_shared(&self, info: &ClientMountInfo) -> bool {
        self.shared_filesystems
            .iter()
            .any(|fs| fs.eq_ignore_ascii_case(&info.filesystem_type))
    }

    /// Device string for `mount`, activating LVM volumes first
    pub async fn resolve(&self, info: &ClientMountInfo) -> Result<String> {
        match &info.device {
            ClientMountDevice::Lustre(lustre) => Ok(format!(
                "{}:/{}",
                lustre.mgs_addresses, lustre.file_system_name
            )),
            ClientMountDevice::Lvm(lvm) => {
                LvmCoordinator::new(self.executor)
                    .configure(lvm, true, self.is_shared(info))
                    .await?;

                Ok(format!("/dev/{}/{}", lvm.volume_group, lvm.logical_volume))
            }
            ClientMountDevice::Unsupported => Err(Error::UnsupportedDevice {
                kind: info.device.type_name().to_string(),
            }),
        }
    }

    /// Release whatever `resolve` activated. Devices without activation
    /// state need nothing.
    pub async fn release(&self, info: &ClientMountInfo) -> Result<()> {
        if let ClientMountDevice::Lvm(lvm) = &info.device {
            LvmCoordinator::new(self.executor)
                .configure(lvm, false, self.is_shared(info))
                .await?;
        }
        Ok(())
    }
}
