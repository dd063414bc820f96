//! Initial provisioning: owner account, disk encryption, volume assembly.
//!
//! The setup marker is claimed before any work starts and acts as the
//! mutual-exclusion lock; a failure on any later step removes it again so
//! the appliance can retry instead of staying wedged half-provisioned.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::config::{Config, Session};
use crate::error::{CofferError, CofferResult};
use crate::lifecycle::{LifecycleState, Phase};
use crate::secret::derive_disk_secret;
use crate::store::AccessStore;
use coffer_provider::{
    AccountProvider, Disk, DiskProvider, PasswordVerifier, UnlockedDisk, VolumeTopology,
};
use regex::Regex;

/// Payload of a `POST /setup` request.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub full_name: String,
    pub password: String,
    pub session_key: String,
    pub session_name: String,
    pub session_platform: String,
    /// Kernel device names, e.g. `["sda", "sdb"]`.
    pub disks: Vec<String>,
    pub mirrored: bool,
}

/// Provision the appliance end-to-end and flip the phase to `Unlocked`.
pub fn initial_setup<P, A, V>(
    provider: &P,
    accounts: &A,
    verifier: &V,
    store: &AccessStore,
    lifecycle: &LifecycleState,
    serial: Option<&str>,
    request: &SetupRequest,
) -> CofferResult<WorkflowReport>
where
    P: DiskProvider<Error = CofferError>,
    A: AccountProvider<Error = CofferError>,
    V: PasswordVerifier<Error = CofferError>,
{
    if store.paths().update_in_progress() {
        return Err(CofferError::Validation(
            "an update is in progress; retry once it completes".into(),
        ));
    }
    validate_request(request)?;

    // marker-as-lock: claimed before provisioning, removed on failure
    store.paths().claim_setup_marker()?;
    match provision(provider, accounts, verifier, store, lifecycle, serial, request) {
        Ok(report) => Ok(report),
        Err(err) => {
            if let Err(cleanup) = store.paths().clear_setup_marker() {
                log::error!("failed to clear setup marker after aborted setup: {cleanup}");
            }
            Err(err)
        }
    }
}

fn provision<P, A, V>(
    provider: &P,
    accounts: &A,
    verifier: &V,
    store: &AccessStore,
    lifecycle: &LifecycleState,
    serial: Option<&str>,
    request: &SetupRequest,
) -> CofferResult<WorkflowReport>
where
    P: DiskProvider<Error = CofferError>,
    A: AccountProvider<Error = CofferError>,
    V: PasswordVerifier<Error = CofferError>,
{
    let mut events: Vec<WorkflowEvent> = Vec::new();

    let first_name = request
        .full_name
        .split_whitespace()
        .next()
        .unwrap_or_default();
    let username = derive_username(first_name)?;

    accounts.create_user(&username, &request.full_name)?;
    let hash = verifier.hash_password(&request.password)?;
    accounts.set_password_hash(&username, &hash)?;
    accounts.make_admin(&username)?;
    events.push(event(
        WorkflowLevel::Success,
        format!("created owner account {username}"),
    ));

    let secret = derive_disk_secret(&request.password);
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

    let topology = if request.mirrored {
        VolumeTopology::Mirrored
    } else {
        VolumeTopology::Linear
    };
    provider.create_volume(&members, topology)?;
    provider.format_volume()?;
    provider.mount_volume()?;
    events.push(event(
        WorkflowLevel::Success,
        format!("assembled {topology:?} volume over {} disk(s)", members.len()),
    ));

    let config = Config {
        owner: username.clone(),
        device_name: derive_device_name(first_name, serial),
        sessions: vec![Session {
            user: username.clone(),
            key: request.session_key.clone(),
            name: request.session_name.clone(),
            platform: request.session_platform.clone(),
        }],
        ..Config::default()
    };
    store.persist_unchecked(&config)?;
    store.paths().write_owner(&username)?;
    lifecycle.set(Phase::Unlocked);
    events.push(event(WorkflowLevel::Info, "initial setup complete"));

    Ok(WorkflowReport {
        title: "initial setup".into(),
        events,
    })
}

fn validate_request(request: &SetupRequest) -> CofferResult<()> {
    if request.full_name.trim().is_empty() || request.password.is_empty() {
        return Err(CofferError::Validation("missing full name or password".into()));
    }
    if request.session_key.is_empty()
        || request.session_name.is_empty()
        || request.session_platform.is_empty()
    {
        return Err(CofferError::Validation(
            "missing session key, name, or platform".into(),
        ));
    }
    if request.disks.is_empty() {
        return Err(CofferError::Validation(
            "one or more disks are required to complete setup".into(),
        ));
    }
    let disk_name = Regex::new(r"^sd[a-z]$").unwrap();
    for name in &request.disks {
        if !disk_name.is_match(name) {
            return Err(CofferError::Validation(format!("invalid disk name {name:?}")));
        }
    }
    if request.mirrored && request.disks.len() != 2 {
        return Err(CofferError::Provision("mirroring requires exactly 2 disks".into()));
    }
    Ok(())
}

/// Lowercased first name stripped to `[a-z0-9]`, validated as a unix
/// username.
fn derive_username(first_name: &str) -> CofferResult<String> {
    let username: String = first_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    let valid = Regex::new(r"^[a-z][a-z0-9_-]{0,29}$").unwrap();
    if !valid.is_match(&username) {
        return Err(CofferError::Validation(
            "your full name must start with a standard character (A-Z)".into(),
        ));
    }
    Ok(username)
}

/// Display name shown in the apps, e.g. `Ada's Coffer (af01)`.
fn derive_device_name(first_name: &str, serial: Option<&str>) -> String {
    let possessive = if first_name.ends_with('s') || first_name.ends_with('S') {
        format!("{first_name}'")
    } else {
        format!("{first_name}'s")
    };
    match serial {
        Some(serial) if serial.len() >= 4 => {
            format!("{possessive} Coffer ({})", &serial[serial.len() - 4..])
        }
        _ => format!("{possessive} Coffer"),
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn username_derivation_strips_and_validates() {
        assert_eq!(derive_username("Ada").unwrap(), "ada");
        assert_eq!(derive_username("J0sé").unwrap(), "j0s");
        assert!(derive_username("!!!").is_err());
        assert!(derive_username("9lives").is_err());
    }

    #[test]
    fn device_name_uses_serial_tail_and_possessive() {
        assert_eq!(
            derive_device_name("Ada", Some("b827ebaf0123")),
            "Ada's Coffer (0123)"
        );
        assert_eq!(derive_device_name("Silas", None), "Silas' Coffer");
    }
}
