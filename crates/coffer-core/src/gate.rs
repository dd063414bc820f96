//! Credential gate: password and one-time-password logins, plus the owner
//! unlock flow that opens the encryption containers.
//!
//! The gate validates credentials against the system credential hash and,
//! for an owner logging into a still-locked appliance, drives the
//! provisioner through open-each-disk → mount → phase flip. Failures never
//! reveal which factor was wrong, and a partial unlock leaves the phase
//! exactly where it was.

use crate::config::Session;
use crate::error::{CofferError, CofferResult};
use crate::lifecycle::{LifecycleState, Phase};
use crate::secret::{derive_disk_secret, SecretCache};
use crate::store::AccessStore;
use chrono::Utc;
use coffer_provider::{Disk, DiskProvider, PasswordVerifier};
use log::{info, warn};

/// Fields every login request must carry.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
    pub session_key: String,
    pub session_name: String,
    pub session_platform: String,
}

impl LoginRequest {
    fn validate(&self) -> CofferResult<()> {
        if self.user.is_empty() || self.password.is_empty() {
            return Err(CofferError::Validation("missing username or password".into()));
        }
        if self.session_key.is_empty()
            || self.session_name.is_empty()
            || self.session_platform.is_empty()
        {
            return Err(CofferError::Validation(
                "missing session key, name, or platform".into(),
            ));
        }
        Ok(())
    }

    fn session(&self) -> Session {
        Session {
            user: self.user.clone(),
            key: self.session_key.clone(),
            name: self.session_name.clone(),
            platform: self.session_platform.clone(),
        }
    }
}

/// Authenticate a password login, unlocking storage when an owner logs in
/// against a locked appliance. Returns the created session.
pub fn login<P, V>(
    provider: &P,
    verifier: &V,
    store: &AccessStore,
    lifecycle: &LifecycleState,
    cache: &SecretCache,
    request: &LoginRequest,
) -> CofferResult<Session>
where
    P: DiskProvider<Error = CofferError>,
    V: PasswordVerifier<Error = CofferError>,
{
    request.validate()?;

    let hash = verifier
        .shadow_hash(&request.user)?
        .ok_or(CofferError::Auth)?;
    if !verifier.check_password(&request.password, &hash)? {
        return Err(CofferError::Auth);
    }

    let phase = lifecycle.current();
    let is_owner = store
        .paths()
        .read_owner()?
        .map(|owner| owner == request.user)
        .unwrap_or(false);

    if is_owner && matches!(phase, Phase::Locked | Phase::NewDisk) {
        unlock_storage(provider, lifecycle, cache, &request.password)?;
    }

    let session = request.session();
    persist_session(store, lifecycle, session.clone())?;
    info!("login for {} [{}]", session.user, session.name);
    Ok(session)
}

/// Redeem a one-time password. Consumes the entry (single use) and creates
/// a session for its bound user without touching disk state.
pub fn login_with_otp(
    store: &AccessStore,
    otp: &str,
    session_key: &str,
    session_name: &str,
    session_platform: &str,
) -> CofferResult<Session> {
    if session_key.is_empty() || session_name.is_empty() || session_platform.is_empty() {
        return Err(CofferError::Validation(
            "missing session key, name, or platform".into(),
        ));
    }
    let user = store.consume_otp(otp, Utc::now())?;
    let session = Session {
        user,
        key: session_key.to_string(),
        name: session_name.to_string(),
        platform: session_platform.to_string(),
    };
    store.add_session(session.clone())?;
    info!("one-time-password login for {}", session.user);
    Ok(session)
}

/// Open every encrypted container with the secret derived from `password`,
/// mount the volume, and advance the phase. Blank disks keep the phase at
/// `NewDisk` and leave the derived secret cached for a follow-up expand.
fn unlock_storage<P>(
    provider: &P,
    lifecycle: &LifecycleState,
    cache: &SecretCache,
    password: &str,
) -> CofferResult<()>
where
    P: DiskProvider<Error = CofferError>,
{
    let secret = derive_disk_secret(password);

    let mut disks = Vec::new();
    for disk in provider.list_candidate_disks()? {
        disks.push(provider.query_encryption_state(&disk)?);
    }
    if disks.is_empty() {
        return Err(CofferError::Provision("no disks present to unlock".into()));
    }

    for disk in disks.iter().filter(|d| d.encrypted == Some(true)) {
        if disk.unlocked == Some(true) {
            continue;
        }
        // propagate without flipping the phase; the appliance stays locked
        provider.open_disk(disk, secret.as_bytes()).map_err(|err| {
            warn!("unlock of {} failed: {err}", disk.name);
            err
        })?;
    }

    if !provider.is_mounted()? {
        provider.mount_volume()?;
    }

    let blank: Vec<&Disk> = disks.iter().filter(|d| d.encrypted != Some(true)).collect();
    if blank.is_empty() {
        lifecycle.set(Phase::Unlocked);
    } else {
        info!(
            "{} blank disk(s) present; caching derived secret for expand",
            blank.len()
        );
        cache.store(secret);
        lifecycle.set(Phase::NewDisk);
    }
    Ok(())
}

/// Store the session. While the appliance sits in `NewDisk` the volume is
/// mounted but the derived phase is not `Unlocked`, so the checked write
/// path would refuse; this is the one sanctioned bypass.
fn persist_session(
    store: &AccessStore,
    lifecycle: &LifecycleState,
    session: Session,
) -> CofferResult<()> {
    match lifecycle.current() {
        Phase::Unlocked => store.add_session(session),
        Phase::NewDisk => {
            let mut config = store.load_unchecked()?;
            if config.sessions.iter().any(|s| s.key == session.key) {
                return Err(CofferError::Validation(
                    "session key already registered".into(),
                ));
            }
            config.sessions.push(session);
            store.persist_unchecked(&config)
        }
        _ => Err(CofferError::Locked),
    }
}
