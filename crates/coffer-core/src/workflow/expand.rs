//! Capacity expansion: encrypt newly attached disks and grow the volume.
//!
//! The secret is consumed from the login-time cache; it is never accepted
//! in the request body. Topology is checked before anything destructive
//! runs: a mirrored volume cannot be extended linearly without silently
//! losing redundancy, so the request is refused outright.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::error::{CofferError, CofferResult};
use crate::lifecycle::{derive_phase, LifecycleState};
use crate::secret::SecretCache;
use crate::store::AccessStore;
use coffer_provider::{Disk, DiskProvider, UnlockedDisk, VolumeTopology};
use regex::Regex;

/// Payload of a `POST /expand-disks` request.
#[derive(Debug, Clone)]
pub struct ExpandRequest {
    /// Kernel device names of the disks to add.
    pub disks: Vec<String>,
}

/// Encrypt the new disks and extend the logical volume over them.
pub fn expand_disks<P>(
    provider: &P,
    store: &AccessStore,
    lifecycle: &LifecycleState,
    cache: &SecretCache,
    request: &ExpandRequest,
) -> CofferResult<WorkflowReport>
where
    P: DiskProvider<Error = CofferError>,
{
    if !store.paths().setup_complete() {
        return Err(CofferError::Validation(
            "setup has not been completed on this appliance".into(),
        ));
    }
    if store.paths().update_in_progress() {
        return Err(CofferError::Validation(
            "an update is in progress; retry once it completes".into(),
        ));
    }
    if request.disks.is_empty() {
        return Err(CofferError::Validation("no disks to add".into()));
    }
    let disk_name = Regex::new(r"^sd[a-z]$").unwrap();
    for name in &request.disks {
        if !disk_name.is_match(name) {
            return Err(CofferError::Validation(format!("invalid disk name {name:?}")));
        }
    }

    // topology guard before any destructive step
    if provider.volume_topology()? == VolumeTopology::Mirrored {
        return Err(CofferError::Provision(
            "the existing volume is mirrored; adding capacity requires a mirror \
             conversion, not a linear extend"
                .into(),
        ));
    }

    let secret = cache.take().ok_or(CofferError::Auth)?;

    let mut events: Vec<WorkflowEvent> = Vec::new();
    let mut members: Vec<UnlockedDisk> = Vec::new();
    for name in &request.disks {
        let disk = provider.query_encryption_state(&Disk::new(name.clone()))?;
        if disk.encrypted == Some(true) {
            return Err(CofferError::Provision(format!(
                "disk {name} already holds an encryption container"
            )));
        }
        provider.encrypt_disk(&disk, secret.as_bytes())?;
        let member = provider.open_disk(&disk, secret.as_bytes())?;
        events.push(event(
            WorkflowLevel::Success,
            format!("encrypted and opened {name} at {}", member.mapped_path),
        ));
        members.push(member);
    }

    provider.extend_volume(&members)?;
    events.push(event(
        WorkflowLevel::Success,
        format!("extended volume over {} new disk(s)", members.len()),
    ));

    // a blank disk outside the requested set keeps the phase at NewDisk
    let mut inventory = Vec::new();
    for disk in provider.list_candidate_disks()? {
        inventory.push(provider.query_encryption_state(&disk)?);
    }
    lifecycle.set(derive_phase(&inventory, true, false));
    Ok(WorkflowReport {
        title: "disk expansion".into(),
        events,
    })
}
