//! `DiskProvider` backed by cryptsetup, LVM, and the mount tooling.

use crate::command::{CommandRunner, Executor, SystemExecutor};
use crate::inventory;
use coffer_core::config::HostPaths;
use coffer_core::{CofferError, CofferResult};
use coffer_provider::{Disk, DiskDetail, DiskProvider, UnlockedDisk, VolumeTopology};
use log::{debug, warn};
use std::thread;
use std::time::Duration;

const VG_NAME: &str = "coffer_vg";
const LV_NAME: &str = "coffer_lv";
const LV_PATH: &str = "/dev/coffer_vg/coffer_lv";

/// cryptsetup exits with 2 when the supplied passphrase does not match
/// any keyslot.
const CRYPTSETUP_BAD_PASSPHRASE: i32 = 2;

/// `cryptsetup status` exits with 4 when the mapping is inactive; so does
/// `luksClose` when there is nothing to close.
const CRYPTSETUP_INACTIVE: i32 = 4;

const OPEN_POLL_ATTEMPTS: u32 = 25;
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Provider that shells out to the host storage stack.
#[derive(Debug, Clone)]
pub struct SystemDiskProvider<E = SystemExecutor> {
    runner: CommandRunner<E>,
    paths: HostPaths,
}

impl SystemDiskProvider<SystemExecutor> {
    pub fn system(paths: HostPaths) -> Self {
        Self::new(CommandRunner::system(), paths)
    }
}

impl<E: Executor> SystemDiskProvider<E> {
    pub fn new(runner: CommandRunner<E>, paths: HostPaths) -> Self {
        Self { runner, paths }
    }

    pub fn runner(&self) -> &CommandRunner<E> {
        &self.runner
    }

    fn mount_point(&self) -> String {
        self.paths.mount_root.to_string_lossy().into_owned()
    }

    /// Wait for the plaintext mapping to appear after `luksOpen`. The kernel
    /// publishes the device asynchronously, so the open call returning is
    /// not enough on its own.
    fn wait_for_mapping(&self, mapping: &str) -> CofferResult<()> {
        for attempt in 0..OPEN_POLL_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(OPEN_POLL_INTERVAL);
            }
            let out = self.runner.run_expecting(
                "await mapping",
                "cryptsetup",
                &["status", mapping],
                &[CRYPTSETUP_INACTIVE],
            )?;
            if out.success() {
                debug!("mapping {mapping} active after {attempt} retries");
                return Ok(());
            }
        }
        Err(CofferError::Provision(format!(
            "mapping {mapping} did not become active"
        )))
    }
}

fn auth_on_bad_passphrase(err: CofferError) -> CofferError {
    match err {
        CofferError::Command { exit_code, .. } if exit_code == CRYPTSETUP_BAD_PASSPHRASE => {
            CofferError::Auth
        }
        other => other,
    }
}

impl<E: Executor> DiskProvider for SystemDiskProvider<E> {
    type Error = CofferError;

    fn list_candidate_disks(&self) -> CofferResult<Vec<Disk>> {
        inventory::list_candidate_disks(&self.runner)
    }

    fn query_encryption_state(&self, disk: &Disk) -> CofferResult<Disk> {
        inventory::query_encryption_state(&self.runner, disk)
    }

    fn disk_details(&self) -> CofferResult<Vec<DiskDetail>> {
        inventory::disk_details(&self.runner)
    }

    fn encrypt_disk(&self, disk: &Disk, secret: &[u8]) -> CofferResult<()> {
        self.runner.run_with_secret(
            "encrypt disk",
            "cryptsetup",
            &[
                "--batch-mode",
                "luksFormat",
                &disk.device_path(),
                "--key-file",
                "-",
            ],
            secret,
        )?;
        Ok(())
    }

    fn open_disk(&self, disk: &Disk, secret: &[u8]) -> CofferResult<UnlockedDisk> {
        let mapping = disk.mapping_name();
        self.runner
            .run_with_secret(
                "open disk",
                "cryptsetup",
                &[
                    "luksOpen",
                    &disk.device_path(),
                    &mapping,
                    "--key-file",
                    "-",
                ],
                secret,
            )
            .map_err(auth_on_bad_passphrase)?;
        self.wait_for_mapping(&mapping)?;
        Ok(UnlockedDisk {
            name: disk.name.clone(),
            mapped_path: format!("/dev/mapper/{mapping}"),
        })
    }

    fn close_disk(&self, disk: &Disk) -> CofferResult<()> {
        self.runner.run_expecting(
            "close disk",
            "cryptsetup",
            &["luksClose", &disk.mapping_name()],
            &[CRYPTSETUP_INACTIVE],
        )?;
        Ok(())
    }

    fn create_volume(
        &self,
        members: &[UnlockedDisk],
        topology: VolumeTopology,
    ) -> CofferResult<()> {
        for member in members {
            self.runner
                .run("prepare member", "pvcreate", &[&member.mapped_path])?;
        }
        let mut vgcreate: Vec<&str> = vec![VG_NAME];
        vgcreate.extend(members.iter().map(|m| m.mapped_path.as_str()));
        self.runner
            .run("create volume group", "vgcreate", &vgcreate)?;

        let lvcreate: Vec<&str> = match topology {
            VolumeTopology::Mirrored => vec![
                "--type", "raid1", "--mirrors", "1", "-l", "100%FREE", "-n", LV_NAME, VG_NAME,
            ],
            VolumeTopology::Linear => vec!["-l", "100%FREE", "-n", LV_NAME, VG_NAME],
        };
        self.runner
            .run("create logical volume", "lvcreate", &lvcreate)?;
        Ok(())
    }

    fn extend_volume(&self, members: &[UnlockedDisk]) -> CofferResult<()> {
        for member in members {
            self.runner
                .run("prepare member", "pvcreate", &[&member.mapped_path])?;
        }
        let mut vgextend: Vec<&str> = vec![VG_NAME];
        vgextend.extend(members.iter().map(|m| m.mapped_path.as_str()));
        self.runner
            .run("extend volume group", "vgextend", &vgextend)?;
        self.runner.run(
            "extend logical volume",
            "lvextend",
            &["-l", "+100%FREE", LV_PATH],
        )?;
        self.runner
            .run("grow filesystem", "resize2fs", &[LV_PATH])?;
        Ok(())
    }

    fn volume_topology(&self) -> CofferResult<VolumeTopology> {
        let out = self.runner.run(
            "query topology",
            "lvs",
            &["--noheadings", "-o", "segtype", &format!("{VG_NAME}/{LV_NAME}")],
        )?;
        if out.stdout.contains("raid1") {
            Ok(VolumeTopology::Mirrored)
        } else {
            Ok(VolumeTopology::Linear)
        }
    }

    fn format_volume(&self) -> CofferResult<()> {
        self.runner.run(
            "format volume",
            "mkfs.ext4",
            &[
                "-F",
                "-E",
                "lazy_itable_init=1,lazy_journal_init=1",
                LV_PATH,
            ],
        )?;
        Ok(())
    }

    fn mount_volume(&self) -> CofferResult<()> {
        self.runner
            .run("activate volume group", "vgchange", &["-ay", VG_NAME])?;
        std::fs::create_dir_all(&self.paths.mount_root)?;
        self.runner
            .run("mount volume", "mount", &[LV_PATH, &self.mount_point()])?;
        Ok(())
    }

    fn is_mounted(&self) -> CofferResult<bool> {
        let out = self.runner.run_expecting(
            "mount probe",
            "findmnt",
            &["-rn", &self.mount_point()],
            &[1],
        )?;
        Ok(out.success())
    }

    fn unmount_volume(&self) -> CofferResult<()> {
        if !self.is_mounted()? {
            return Ok(());
        }
        self.runner
            .run("unmount volume", "umount", &[&self.mount_point()])?;
        Ok(())
    }

    fn deactivate_volume(&self) -> CofferResult<()> {
        self.runner
            .run("deactivate volume group", "vgchange", &["-an", VG_NAME])?;
        Ok(())
    }

    fn erase_disk(&self, disk: &Disk) -> CofferResult<()> {
        let mapping = disk.mapping_name();
        let mapped_path = format!("/dev/mapper/{mapping}");
        // intermediate teardown is best-effort; the disk may already be
        // partially dismantled from an earlier attempt
        self.runner
            .run_bypass("erase disk", "pvremove", &["-ff", "-y", &mapped_path]);
        self.runner
            .run_bypass("erase disk", "cryptsetup", &["luksClose", &mapping]);
        if self
            .runner
            .run_bypass(
                "erase disk",
                "cryptsetup",
                &["--batch-mode", "luksErase", &disk.device_path()],
            )
            .is_none()
        {
            warn!("container header erase failed for {}", disk.name);
        }
        // zero the leading bytes so nothing recognises a stale header.
        // unlike the steps above this one is fatal: a disk whose header
        // could not be overwritten must show up in the reset report
        self.runner.run(
            "erase disk",
            "dd",
            &[
                "if=/dev/zero",
                &format!("of={}", disk.device_path()),
                "bs=1M",
                "count=32",
                "conv=fsync",
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeExecutor;
    use tempfile::tempdir;

    fn provider(executor: FakeExecutor) -> SystemDiskProvider<FakeExecutor> {
        let dir = tempdir().unwrap();
        SystemDiskProvider::new(
            CommandRunner::new(executor),
            HostPaths::new(dir.path().join("state"), dir.path().join("mnt")),
        )
    }

    #[test]
    fn bad_passphrase_surfaces_as_auth_failure() {
        let executor = FakeExecutor::new();
        executor.respond(
            "cryptsetup luksOpen /dev/sda encrypted_sda --key-file -",
            2,
            "",
            "No key available with this passphrase.",
        );
        let provider = provider(executor);

        let err = provider
            .open_disk(&Disk::new("sda"), b"wrong")
            .unwrap_err();
        assert!(matches!(err, CofferError::Auth));
    }

    #[test]
    fn open_waits_for_the_mapping_and_returns_its_path() {
        // the unscripted status probe answers exit 0, i.e. active
        let provider = provider(FakeExecutor::new());

        let unlocked = provider.open_disk(&Disk::new("sdb"), b"digest").unwrap();
        assert_eq!(unlocked.name, "sdb");
        assert_eq!(unlocked.mapped_path, "/dev/mapper/encrypted_sdb");

        let ran = provider.runner().executor.ran();
        assert_eq!(
            ran,
            [
                "cryptsetup luksOpen /dev/sdb encrypted_sdb --key-file -",
                "cryptsetup status encrypted_sdb",
            ]
        );
    }

    #[test]
    fn mirrored_volume_creation_orders_pv_vg_lv() {
        let provider = provider(FakeExecutor::new());
        let members = vec![
            UnlockedDisk {
                name: "sda".into(),
                mapped_path: "/dev/mapper/encrypted_sda".into(),
            },
            UnlockedDisk {
                name: "sdb".into(),
                mapped_path: "/dev/mapper/encrypted_sdb".into(),
            },
        ];

        provider
            .create_volume(&members, VolumeTopology::Mirrored)
            .unwrap();

        let ran = provider.runner().executor.ran();
        assert_eq!(
            ran,
            [
                "pvcreate /dev/mapper/encrypted_sda",
                "pvcreate /dev/mapper/encrypted_sdb",
                "vgcreate coffer_vg /dev/mapper/encrypted_sda /dev/mapper/encrypted_sdb",
                "lvcreate --type raid1 --mirrors 1 -l 100%FREE -n coffer_lv coffer_vg",
            ]
        );
    }

    #[test]
    fn topology_is_read_from_the_segment_type() {
        let executor = FakeExecutor::new();
        executor.respond(
            "lvs --noheadings -o segtype coffer_vg/coffer_lv",
            0,
            "  raid1\n",
            "",
        );
        let provider = provider(executor);
        assert_eq!(provider.volume_topology().unwrap(), VolumeTopology::Mirrored);
    }

    #[test]
    fn unmount_is_a_no_op_when_nothing_is_mounted() {
        let provider = provider(FakeExecutor::new());
        let probe = format!("findmnt -rn {}", provider.mount_point());
        provider.runner().executor.respond(&probe, 1, "", "");

        provider.unmount_volume().unwrap();
        assert_eq!(provider.runner().executor.ran(), [probe]);
    }

    #[test]
    fn erase_tolerates_missing_intermediate_state() {
        let executor = FakeExecutor::new();
        executor.respond(
            "pvremove -ff -y /dev/mapper/encrypted_sda",
            5,
            "",
            "not a physical volume",
        );
        executor.respond("cryptsetup luksClose encrypted_sda", 4, "", "not active");
        let provider = provider(executor);

        provider.erase_disk(&Disk::new("sda")).unwrap();

        let ran = provider.runner().executor.ran();
        assert_eq!(ran.len(), 4);
        assert!(ran[3].starts_with("dd if=/dev/zero of=/dev/sda"));
    }
}
