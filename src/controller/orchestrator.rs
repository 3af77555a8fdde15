//! Mount Orchestrator
//!
//! Mounts and unmounts single ClientMount entries. Both operations check
//! the mount table first, so repeating them is harmless.

use crate::crd::{ClientMountInfo, ClientMountState, MountTargetType};
use crate::domain::ports::CommandExecutorRef;
use crate::error::Result;
use crate::host::executor::shell_quote;
use crate::host::{DeviceResolver, MountInspector};
use std::path::Path;
use tracing::{error, info, instrument, warn};

/// Mount command for `info` backed by `device`. Every user-supplied field
/// is quoted for the shell.
pub fn mount_command(info: &ClientMountInfo, device: &str) -> String {
    let mut command = format!(
        "mount -t {} {} {}",
        shell_quote(&info.filesystem_type),
        shell_quote(device),
        shell_quote(&info.mount_path)
    );
    if !info.options.is_empty() {
        command.push_str(" -o ");
        command.push_str(&shell_quote(&info.options));
    }
    command
}

/// Unmount command for `mount_path`
pub fn unmount_command(mount_path: &str) -> String {
    format!("umount {}", shell_quote(mount_path))
}

/// Performs mount and unmount of individual entries on the host
pub struct MountOrchestrator {
    executor: CommandExecutorRef,
    shared_filesystems: Vec<String>,
}

impl MountOrchestrator {
    pub fn new(executor: CommandExecutorRef, shared_filesystems: Vec<String>) -> Self {
        Self {
            executor,
            shared_filesystems,
        }
    }

    fn resolver(&self) -> DeviceResolver<'_> {
        DeviceResolver::new(self.executor.as_ref(), &self.shared_filesystems)
    }

    /// Mount one entry. Already-mounted paths are left alone.
    #[instrument(skip_all, fields(mount_path = %info.mount_path))]
    pub async fn mount(&self, info: &ClientMountInfo) -> Result<()> {
        let state = MountInspector::new(self.executor.as_ref())
            .check(&info.mount_path)
            .await?;
        if state == ClientMountState::Mounted {
            info!("Already mounted");
            return Ok(());
        }

        let device = self.resolver().resolve(info).await?;
        let path = Path::new(&info.mount_path);

        match info.target_type {
            MountTargetType::Directory => {
                if let Err(e) = self.executor.create_dir_all(path).await {
                    error!("Could not create mount directory for {}: {}", device, e);
                    return Err(e);
                }
            }
            MountTargetType::File => {
                if let Some(parent) = path.parent() {
                    if let Err(e) = self.executor.create_dir_all(parent).await {
                        error!("Could not create mount parent directory for {}: {}", device, e);
                        return Err(e);
                    }
                }
                if let Err(e) = self.executor.create_file(path).await {
                    error!("Could not create mount file for {}: {}", device, e);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.executor.run(&mount_command(info, &device)).await {
            warn!(
                "Could not mount file system from {}: {} (output: {})",
                device,
                e,
                e.command_output().unwrap_or_default().trim()
            );
            return Err(e);
        }

        if info.set_permissions {
            if let Err(e) = self.executor.chown(path, info.user_id, info.group_id).await {
                error!(
                    "Could not set owner {}:{}: {}",
                    info.user_id, info.group_id, e
                );
                return Err(e);
            }
        }

        info!("Mounted file system from {}", device);
        Ok(())
    }

    /// Unmount one entry and release its device. The device is released
    /// even when nothing was mounted, but never while the unmount failed.
    #[instrument(skip_all, fields(mount_path = %info.mount_path))]
    pub async fn unmount(&self, info: &ClientMountInfo) -> Result<()> {
        let state = MountInspector::new(self.executor.as_ref())
            .check(&info.mount_path)
            .await?;

        if state == ClientMountState::Mounted {
            if let Err(e) = self.executor.run(&unmount_command(&info.mount_path)).await {
                warn!(
                    "Could not unmount file system: {} (output: {})",
                    e,
                    e.command_output().unwrap_or_default().trim()
                );
                return Err(e);
            }

            // Only cosmetic: a leftover mount point does no harm
            if let Err(e) = self.executor.remove(Path::new(&info.mount_path)).await {
                warn!("Unable to remove mount point: {}", e);
            }
        }

        if let Err(e) = self.resolver().release(info).await {
            error!("Could not release {} device: {}", info.device.type_name(), e);
            return Err(e);
        }

        info!("Unmounted file system");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClientMountDevice, ClientMountDeviceLustre, ClientMountDeviceLvm};
    use crate::host::executor::{HostAction, RecordingExecutor};
    use crate::host::lvm::{LOCK_STATUS_COMMAND, LVS_COMMAND};
    use crate::host::mounts::MOUNT_TABLE_COMMAND;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn lustre(path: &str) -> ClientMountInfo {
        ClientMountInfo {
            mount_path: path.into(),
            target_type: MountTargetType::Directory,
            filesystem_type: "lustre".into(),
            options: String::new(),
            device: ClientMountDevice::Lustre(ClientMountDeviceLustre {
                mgs_addresses: "10.0.0.1@tcp".into(),
                file_system_name: "fs1".into(),
            }),
            set_permissions: false,
            user_id: 0,
            group_id: 0,
        }
    }

    fn gfs2(path: &str) -> ClientMountInfo {
        ClientMountInfo {
            filesystem_type: "gfs2".into(),
            device: ClientMountDevice::Lvm(ClientMountDeviceLvm {
                volume_group: "vg0".into(),
                logical_volume: "lv0".into(),
            }),
            ..lustre(path)
        }
    }

    fn setup() -> (Arc<RecordingExecutor>, MountOrchestrator) {
        let executor = Arc::new(RecordingExecutor::new());
        let orchestrator = MountOrchestrator::new(executor.clone(), vec!["gfs2".into()]);
        (executor, orchestrator)
    }

    fn mounted(path: &str) -> String {
        format!("10.0.0.1@tcp:/fs1 on {} type lustre (rw)\n", path)
    }

    #[test]
    fn test_mount_command_options() {
        let mut info = lustre("/mnt/a");
        assert_eq!(
            mount_command(&info, "10.0.0.1@tcp:/fs1"),
            "mount -t lustre 10.0.0.1@tcp:/fs1 /mnt/a"
        );

        info.options = "ro,flock".into();
        assert_eq!(
            mount_command(&info, "10.0.0.1@tcp:/fs1"),
            "mount -t lustre 10.0.0.1@tcp:/fs1 /mnt/a -o ro,flock"
        );
    }

    #[test]
    fn test_commands_quote_shell_metacharacters() {
        let mut info = lustre("/mnt/job data; rm -rf /");
        info.options = "ro,context=\"system_u:object_r:tmp_t\"".into();

        assert_eq!(
            mount_command(&info, "10.0.0.1@tcp:/fs1"),
            "mount -t lustre 10.0.0.1@tcp:/fs1 '/mnt/job data; rm -rf /' \
             -o 'ro,context=\"system_u:object_r:tmp_t\"'"
        );
        assert_eq!(unmount_command("/mnt/$(reboot)"), "umount '/mnt/$(reboot)'");
        assert_eq!(unmount_command("/mnt/a"), "umount /mnt/a");
    }

    #[tokio::test]
    async fn test_mount_path_with_spaces_is_one_argument() {
        let (executor, orchestrator) = setup();
        executor.respond(MOUNT_TABLE_COMMAND, mounted("/mnt/job data"));

        orchestrator.unmount(&lustre("/mnt/job data")).await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![MOUNT_TABLE_COMMAND, "umount '/mnt/job data'"]
        );
    }

    #[tokio::test]
    async fn test_mount_directory() {
        let (executor, orchestrator) = setup();

        orchestrator.mount(&lustre("/mnt/a")).await.unwrap();

        assert_eq!(
            executor.actions(),
            vec![
                HostAction::Run(MOUNT_TABLE_COMMAND.into()),
                HostAction::CreateDir("/mnt/a".into()),
                HostAction::Run("mount -t lustre 10.0.0.1@tcp:/fs1 /mnt/a".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_mount_file_target() {
        let (executor, orchestrator) = setup();
        let mut info = lustre("/mnt/files/image");
        info.target_type = MountTargetType::File;

        orchestrator.mount(&info).await.unwrap();

        assert_eq!(
            executor.actions()[1..3],
            [
                HostAction::CreateDir("/mnt/files".into()),
                HostAction::CreateFile("/mnt/files/image".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_mount_already_mounted_is_noop() {
        let (executor, orchestrator) = setup();
        executor.respond(MOUNT_TABLE_COMMAND, mounted("/mnt/a"));

        orchestrator.mount(&lustre("/mnt/a")).await.unwrap();

        assert_eq!(executor.commands(), vec![MOUNT_TABLE_COMMAND]);
        assert_eq!(executor.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_mount_sets_permissions() {
        let (executor, orchestrator) = setup();
        let mut info = lustre("/mnt/a");
        info.set_permissions = true;
        info.user_id = 1050;
        info.group_id = 1051;

        orchestrator.mount(&info).await.unwrap();

        assert_eq!(
            executor.actions().last(),
            Some(&HostAction::Chown {
                path: "/mnt/a".into(),
                uid: 1050,
                gid: 1051,
            })
        );
    }

    #[tokio::test]
    async fn test_mount_permission_failure_is_reported() {
        let (executor, orchestrator) = setup();
        executor.fail_containing("chown");
        let mut info = lustre("/mnt/a");
        info.set_permissions = true;

        assert!(orchestrator.mount(&info).await.is_err());
        assert!(executor
            .commands()
            .contains(&"mount -t lustre 10.0.0.1@tcp:/fs1 /mnt/a".to_string()));
    }

    #[tokio::test]
    async fn test_mount_command_failure() {
        let (executor, orchestrator) = setup();
        executor.fail(
            "mount -t lustre 10.0.0.1@tcp:/fs1 /mnt/a",
            "mount.lustre: mount 10.0.0.1@tcp:/fs1 at /mnt/a failed",
        );

        let err = orchestrator.mount(&lustre("/mnt/a")).await.unwrap_err();
        assert!(err.command_output().unwrap().contains("mount.lustre"));
    }

    #[tokio::test]
    async fn test_mount_table_failure_stops_mount() {
        let (executor, orchestrator) = setup();
        executor.fail(MOUNT_TABLE_COMMAND, "");

        let err = orchestrator.mount(&lustre("/mnt/a")).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(executor.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_mount_lvm_activates_before_mount() {
        let (executor, orchestrator) = setup();
        executor.respond(LVS_COMMAND, "  lv0|vg0|0\n");

        orchestrator.mount(&gfs2("/mnt/gfs")).await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                MOUNT_TABLE_COMMAND,
                LVS_COMMAND,
                "vgchange --lockstart vg0",
                "vgchange --activate sy vg0",
                "mount -t gfs2 /dev/vg0/lv0 /mnt/gfs",
            ]
        );
    }

    #[tokio::test]
    async fn test_unmount_mounted() {
        let (executor, orchestrator) = setup();
        executor.respond(MOUNT_TABLE_COMMAND, mounted("/mnt/a"));

        orchestrator.unmount(&lustre("/mnt/a")).await.unwrap();

        assert_eq!(
            executor.actions(),
            vec![
                HostAction::Run(MOUNT_TABLE_COMMAND.into()),
                HostAction::Run("umount /mnt/a".into()),
                HostAction::Remove("/mnt/a".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unmount_not_mounted_still_releases_lvm() {
        let (executor, orchestrator) = setup();
        executor.respond(LVS_COMMAND, "  lv0|vg0|1\n");

        orchestrator.unmount(&gfs2("/mnt/gfs")).await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                MOUNT_TABLE_COMMAND,
                LVS_COMMAND,
                "vgchange --activate n vg0",
                LOCK_STATUS_COMMAND,
            ]
        );
    }

    #[tokio::test]
    async fn test_unmount_failure_keeps_device_active() {
        let (executor, orchestrator) = setup();
        executor.respond(
            MOUNT_TABLE_COMMAND,
            "/dev/mapper/vg0-lv0 on /mnt/gfs type gfs2 (rw)\n",
        );
        executor.fail("umount /mnt/gfs", "umount: /mnt/gfs: target is busy.");

        let err = orchestrator.unmount(&gfs2("/mnt/gfs")).await.unwrap_err();

        assert_matches!(err, crate::error::Error::CommandFailed { .. });
        assert_eq!(executor.commands(), vec![MOUNT_TABLE_COMMAND, "umount /mnt/gfs"]);
    }

    #[tokio::test]
    async fn test_unmount_removal_failure_is_ignored() {
        let (executor, orchestrator) = setup();
        executor.respond(MOUNT_TABLE_COMMAND, mounted("/mnt/a"));
        executor.fail("rm /mnt/a", "");

        assert!(orchestrator.unmount(&lustre("/mnt/a")).await.is_ok());
    }
}
