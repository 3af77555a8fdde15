//! LVM Activation
//!
//! Activates and deactivates logical volumes for mounting. Volume groups
//! holding a clustered file system are shared between nodes and guarded by
//! an lvmlockd lock, which is started before a shared activation and
//! stopped again on release.
//!
//! Nothing here serializes across nodes. Every step is safe to repeat, and
//! concurrent lock start/stop from several nodes is left to lvmlockd.

use crate::crd::ClientMountDeviceLvm;
use crate::domain::ports::CommandExecutor;
use crate::error::{Error, Result};
use crate::host::executor::shell_quote;
use crate::host::nvme::NvmeRescanner;
use tracing::{debug, info};

// =============================================================================
// Inventory
// =============================================================================

/// Logical volume inventory. `lv_active_locally` is a binary report field:
/// `1` when the volume is active on this host.
pub const LVS_COMMAND: &str =
    "lvs --noheadings --binary --separator '|' -o lv_name,vg_name,lv_active_locally";

/// lvmlockd status listing
pub const LOCK_STATUS_COMMAND: &str = "lvmlockctl -i";

/// One line of the logical volume inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeRecord {
    pub logical_volume: String,
    pub volume_group: String,
    pub active: bool,
}

/// Parse `LVS_COMMAND` output. Malformed lines are skipped.
pub fn parse_inventory(output: &str) -> Vec<LogicalVolumeRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|').map(str::trim);
            let logical_volume = fields.next().filter(|f| !f.is_empty())?;
            let volume_group = fields.next().filter(|f| !f.is_empty())?;
            let active = fields.next()? == "1";

            Some(LogicalVolumeRecord {
                logical_volume: logical_volume.to_string(),
                volume_group: volume_group.to_string(),
                active,
            })
        })
        .collect()
}

/// Whether lvmlockd reports a lockspace for `volume_group`
pub fn holds_lock(lock_status: &str, volume_group: &str) -> bool {
    lock_status.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.next() == Some("VG") && tokens.next() == Some(volume_group)
    })
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives a logical volume to the requested activation state
pub struct LvmCoordinator<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> LvmCoordinator<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    /// Activate or deactivate `lvm`. `shared` selects lock-managed shared
    /// activation for clustered file systems.
    ///
    /// Deactivating a volume that does not exist succeeds. Activating one
    /// that does not exist rescans NVMe namespaces and reports the volume
    /// as not found, so the next attempt can see it.
    pub async fn configure(
        &self,
        lvm: &ClientMountDeviceLvm,
        activate: bool,
        shared: bool,
    ) -> Result<()> {
        let output = self
            .executor
            .run(LVS_COMMAND)
            .await
            .map_err(|e| Error::storage("Client could not list storage", true, e))?;

        if self.executor.simulated() {
            return Ok(());
        }

        let record = parse_inventory(&output).into_iter().find(|r| {
            r.logical_volume == lvm.logical_volume && r.volume_group == lvm.volume_group
        });

        let Some(record) = record else {
            if !activate {
                debug!(
                    "VG/LV pair {}/{} not present, nothing to release",
                    lvm.volume_group, lvm.logical_volume
                );
                return Ok(());
            }

            NvmeRescanner::new(self.executor).rescan().await?;

            info!(
                "Could not find VG/LV pair {}/{}: {}",
                lvm.volume_group,
                lvm.logical_volume,
                output.trim()
            );
            return Err(Error::VolumeNotFound {
                volume_group: lvm.volume_group.clone(),
                logical_volume: lvm.logical_volume.clone(),
            });
        };

        if activate && !record.active {
            self.activate(&lvm.volume_group, shared).await?;
        } else if !activate && record.active {
            self.run(
                &format!("vgchange --activate n {}", shell_quote(&lvm.volume_group)),
                "Client could not release storage",
            )
            .await?;
            info!("Deactivated volume group {}", lvm.volume_group);
        }

        // A lock can outlive the activation, e.g. after an interrupted release
        if !activate && shared {
            self.stop_lock(&lvm.volume_group).await?;
        }

        Ok(())
    }

    async fn activate(&self, volume_group: &str, shared: bool) -> Result<()> {
        let mode = if shared {
            self.run(
                &format!("vgchange --lockstart {}", shell_quote(volume_group)),
                "Client could not access storage",
            )
            .await?;
            "sy"
        } else {
            "y"
        };

        self.run(
            &format!("vgchange --activate {} {}", mode, shell_quote(volume_group)),
            "Client could not access storage",
        )
        .await?;

        info!(
            "Activated volume group {} ({})",
            volume_group,
            if shared { "shared" } else { "exclusive" }
        );
        Ok(())
    }

    async fn stop_lock(&self, volume_group: &str) -> Result<()> {
        let status = self
            .run(LOCK_STATUS_COMMAND, "Client could not release storage")
            .await?;

        if holds_lock(&status, volume_group) {
            self.run(
                &format!("vgchange --lockstop {}", shell_quote(volume_group)),
                "Client could not release storage",
            )
            .await?;
            info!("Stopped lockspace for volume group {}", volume_group);
        }

        Ok(())
    }

    /// A failed activation or lock step leaves the volume group in an
    /// unknown state, so it is reported as fatal
    async fn run(&self, command: &str, message: &str) -> Result<String> {
        self.executor
            .run(command)
            .await
            .map_err(|e| Error::storage(message, true, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::executor::RecordingExecutor;
    use assert_matches::assert_matches;

    fn volume() -> ClientMountDeviceLvm {
        ClientMountDeviceLvm {
            volume_group: "job1_vg".into(),
            logical_volume: "job1_lv".into(),
        }
    }

    fn inventory(active: bool) -> String {
        format!(
            "  other_lv|other_vg|1\n  job1_lv|job1_vg|{}\n",
            if active { 1 } else { 0 }
        )
    }

    #[test]
    fn test_parse_inventory() {
        let records = parse_inventory("  a_lv|a_vg|1\n\n  garbage\n  b_lv|b_vg|0\n");
        assert_eq!(
            records,
            vec![
                LogicalVolumeRecord {
                    logical_volume: "a_lv".into(),
                    volume_group: "a_vg".into(),
                    active: true,
                },
                LogicalVolumeRecord {
                    logical_volume: "b_lv".into(),
                    volume_group: "b_vg".into(),
                    active: false,
                },
            ]
        );
    }

    #[test]
    fn test_holds_lock_matches_exact_group() {
        let status = "VG job1_vg10 lock_type=sanlock\nLS sanlock lvm_job1_vg10\n";
        assert!(holds_lock(status, "job1_vg10"));
        assert!(!holds_lock(status, "job1_vg"));
        assert!(!holds_lock("", "job1_vg"));
    }

    #[tokio::test]
    async fn test_activate_exclusive() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(false));

        LvmCoordinator::new(&executor)
            .configure(&volume(), true, false)
            .await
            .unwrap();

        assert_eq!(
            executor.commands(),
            vec![LVS_COMMAND, "vgchange --activate y job1_vg"]
        );
    }

    #[tokio::test]
    async fn test_activate_shared_starts_lock_first() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(false));

        LvmCoordinator::new(&executor)
            .configure(&volume(), true, true)
            .await
            .unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                LVS_COMMAND,
                "vgchange --lockstart job1_vg",
                "vgchange --activate sy job1_vg",
            ]
        );
    }

    #[tokio::test]
    async fn test_activate_already_active_is_noop() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(true));

        LvmCoordinator::new(&executor)
            .configure(&volume(), true, true)
            .await
            .unwrap();

        assert_eq!(executor.commands(), vec![LVS_COMMAND]);
    }

    #[tokio::test]
    async fn test_deactivate_shared_releases_lock() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(true));
        executor.respond(LOCK_STATUS_COMMAND, "VG job1_vg lock_type=sanlock\n");

        LvmCoordinator::new(&executor)
            .configure(&volume(), false, true)
            .await
            .unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                LVS_COMMAND,
                "vgchange --activate n job1_vg",
                LOCK_STATUS_COMMAND,
                "vgchange --lockstop job1_vg",
            ]
        );
    }

    #[tokio::test]
    async fn test_deactivate_inactive_reclaims_dangling_lock() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(false));
        executor.respond(LOCK_STATUS_COMMAND, "VG job1_vg lock_type=sanlock\n");

        LvmCoordinator::new(&executor)
            .configure(&volume(), false, true)
            .await
            .unwrap();

        assert_eq!(
            executor.commands(),
            vec![LVS_COMMAND, LOCK_STATUS_COMMAND, "vgchange --lockstop job1_vg"]
        );
    }

    #[tokio::test]
    async fn test_deactivate_without_lock_skips_lockstop() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(false));
        executor.respond(LOCK_STATUS_COMMAND, "VG other_vg lock_type=sanlock\n");

        LvmCoordinator::new(&executor)
            .configure(&volume(), false, true)
            .await
            .unwrap();

        assert_eq!(executor.commands(), vec![LVS_COMMAND, LOCK_STATUS_COMMAND]);
    }

    #[tokio::test]
    async fn test_deactivate_missing_is_success() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, "  other_lv|other_vg|1\n");
        executor.set_paths(vec!["/dev/nvme0".into()]);

        LvmCoordinator::new(&executor)
            .configure(&volume(), false, true)
            .await
            .unwrap();

        assert_eq!(executor.commands(), vec![LVS_COMMAND]);
    }

    #[tokio::test]
    async fn test_activate_missing_rescans_then_fails() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, "  other_lv|other_vg|1\n");
        executor.set_paths(vec!["/dev/nvme0".into(), "/dev/nvme0n1".into()]);

        let err = LvmCoordinator::new(&executor)
            .configure(&volume(), true, false)
            .await
            .unwrap_err();

        assert_matches!(err, Error::VolumeNotFound { .. });
        assert!(!err.is_fatal());
        assert_eq!(
            executor.commands(),
            vec![LVS_COMMAND, "nvme ns-rescan /dev/nvme0"]
        );
    }

    #[tokio::test]
    async fn test_inventory_failure_is_fatal() {
        let executor = RecordingExecutor::new();
        executor.fail(LVS_COMMAND, "  WARNING: lvmlockd process is not running.");

        let err = LvmCoordinator::new(&executor)
            .configure(&volume(), true, false)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.user_message(), "Client could not list storage");
    }

    #[tokio::test]
    async fn test_activation_failure_is_reported() {
        let executor = RecordingExecutor::new();
        executor.respond(LVS_COMMAND, inventory(false));
        executor.fail("vgchange --lockstart job1_vg", "lockstart failed");

        let err = LvmCoordinator::new(&executor)
            .configure(&volume(), true, true)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::Inventory);
        assert_eq!(err.user_message(), "Client could not access storage");
        assert_eq!(err.command_output(), Some("lockstart failed"));
        // Activation never attempted without the lock
        assert_eq!(executor.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_trusts_nothing_after_inventory() {
        let executor = RecordingExecutor::dry_run();

        LvmCoordinator::new(&executor)
            .configure(&volume(), true, true)
            .await
            .unwrap();

        assert_eq!(executor.commands(), vec![LVS_COMMAND]);
    }
}
