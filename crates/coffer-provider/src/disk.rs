//! Provider contract for encrypted block storage.
//!
//! A Coffer appliance pools one or more LUKS-wrapped physical disks into a
//! single logical volume. Implementations wrap the host tooling
//! (`cryptsetup`, LVM, `mkfs`); test doubles record the requested
//! operations instead.

use serde::Serialize;
use std::error::Error;

/// Transient view of one physical disk, rebuilt on every inventory query.
///
/// `encrypted`/`unlocked` are `None` when the corresponding probe could not
/// determine an answer. A disk never reports `unlocked` without also
/// reporting `encrypted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Kernel device name, e.g. `sda`.
    pub name: String,
    pub encrypted: Option<bool>,
    pub unlocked: Option<bool>,
}

impl Disk {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encrypted: None,
            unlocked: None,
        }
    }

    /// Raw device path under `/dev`.
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    /// Deterministic mapping name used once the container is opened.
    pub fn mapping_name(&self) -> String {
        format!("encrypted_{}", self.name)
    }
}

/// Proof that a disk's encryption container is open.
///
/// Volume operations only accept `UnlockedDisk` values, so a caller cannot
/// hand an unopened device to `create_volume` by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedDisk {
    /// Kernel device name of the underlying disk.
    pub name: String,
    /// Plaintext mapped device, e.g. `/dev/mapper/encrypted_sda`.
    pub mapped_path: String,
}

/// Layout of the logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTopology {
    /// Linear concatenation; capacity is the sum of member disks.
    Linear,
    /// One-copy mirror; capacity is the smaller member, requires exactly two.
    Mirrored,
}

/// Hardware metadata surfaced to the setup app, best-effort.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDetail {
    pub name: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// Abstraction over disk encryption and volume management.
///
/// Ordering contract (enforced by callers, aided by `UnlockedDisk`):
/// encrypt → open → create/extend volume → format (first time) → mount.
pub trait DiskProvider {
    type Error: Error + Send + Sync + 'static;

    /// Enumerate candidate data disks (boot/system media excluded).
    fn list_candidate_disks(&self) -> Result<Vec<Disk>, Self::Error>;

    /// Probe whether `disk` holds an encryption container and whether its
    /// mapping is currently active. Probe failures degrade to `false`.
    fn query_encryption_state(&self, disk: &Disk) -> Result<Disk, Self::Error>;

    /// Hardware details for the setup UI.
    fn disk_details(&self) -> Result<Vec<DiskDetail>, Self::Error>;

    /// Initialise an encryption container on the raw device. The caller must
    /// have verified the disk is blank.
    fn encrypt_disk(&self, disk: &Disk, secret: &[u8]) -> Result<(), Self::Error>;

    /// Open the container and wait for the mapped device to appear.
    fn open_disk(&self, disk: &Disk, secret: &[u8]) -> Result<UnlockedDisk, Self::Error>;

    /// Close an active mapping; succeeds if the mapping is already gone.
    fn close_disk(&self, disk: &Disk) -> Result<(), Self::Error>;

    /// Create the volume group and logical volume over the given members.
    fn create_volume(
        &self,
        members: &[UnlockedDisk],
        topology: VolumeTopology,
    ) -> Result<(), Self::Error>;

    /// Add members to the existing linear volume and grow it.
    fn extend_volume(&self, members: &[UnlockedDisk]) -> Result<(), Self::Error>;

    /// Report the current topology of the logical volume.
    fn volume_topology(&self) -> Result<VolumeTopology, Self::Error>;

    fn format_volume(&self) -> Result<(), Self::Error>;

    fn mount_volume(&self) -> Result<(), Self::Error>;

    fn is_mounted(&self) -> Result<bool, Self::Error>;

    fn unmount_volume(&self) -> Result<(), Self::Error>;

    /// Deactivate the volume group ahead of disk erasure.
    fn deactivate_volume(&self) -> Result<(), Self::Error>;

    /// Best-effort secure wipe of one disk: close mapping, drop PV metadata,
    /// erase the container header, zero the leading raw bytes.
    fn erase_disk(&self, disk: &Disk) -> Result<(), Self::Error>;
}

/// `disks.len() > 0` and every disk reports an encryption container.
pub fn all_encrypted(disks: &[Disk]) -> bool {
    !disks.is_empty() && disks.iter().all(|d| d.encrypted == Some(true))
}

/// `disks.len() > 0` and every container is open.
pub fn all_unlocked(disks: &[Disk]) -> bool {
    !disks.is_empty() && disks.iter().all(|d| d.unlocked == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_disk_set_is_neither_encrypted_nor_unlocked() {
        assert!(!all_encrypted(&[]));
        assert!(!all_unlocked(&[]));
    }

    #[test]
    fn aggregate_predicates_require_every_disk() {
        let mut a = Disk::new("sda");
        a.encrypted = Some(true);
        a.unlocked = Some(true);
        let mut b = Disk::new("sdb");
        b.encrypted = Some(true);
        b.unlocked = Some(false);

        let disks = vec![a.clone(), b];
        assert!(all_encrypted(&disks));
        assert!(!all_unlocked(&disks));
        assert!(all_unlocked(std::slice::from_ref(&a)));
    }

    #[test]
    fn mapping_name_is_derived_from_device_name() {
        let disk = Disk::new("sdb");
        assert_eq!(disk.mapping_name(), "encrypted_sdb");
        assert_eq!(disk.device_path(), "/dev/sdb");
    }
}
