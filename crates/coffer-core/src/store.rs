//! Session & access store: CRUD over the durable config record.
//!
//! Every write path checks the lifecycle phase first. The record lives on
//! the encrypted volume, so writing while anything but `Unlocked` would
//! land on an unmounted path; callers get `CofferError::Locked` instead.

use crate::config::{Config, Group, HostPaths, OneTimePassword, Session, Share};
use crate::error::{CofferError, CofferResult};
use crate::lifecycle::LifecycleState;
use chrono::{DateTime, Duration, Utc};
use coffer_provider::AccountProvider;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Validity window for one-time passwords.
pub const OTP_TTL_MINUTES: i64 = 10;

/// Length of generated bearer/one-time credentials.
const CREDENTIAL_LEN: usize = 21;

/// Handle used by the gate, workflows, and HTTP layer to read and mutate
/// the config record. Exclusively owns persistence of the record.
pub struct AccessStore {
    paths: HostPaths,
    lifecycle: Arc<LifecycleState>,
}

impl AccessStore {
    pub fn new(paths: HostPaths, lifecycle: Arc<LifecycleState>) -> Self {
        Self { paths, lifecycle }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    fn require_unlocked(&self) -> CofferResult<()> {
        if self.lifecycle.is_unlocked() {
            Ok(())
        } else {
            Err(CofferError::Locked)
        }
    }

    pub fn load(&self) -> CofferResult<Config> {
        self.require_unlocked()?;
        Config::load(&self.paths.config_file())
    }

    pub fn persist(&self, config: &Config) -> CofferResult<()> {
        self.require_unlocked()?;
        config.save(&self.paths.config_file())
    }

    /// Write without the phase check. Reserved for the gate and the setup
    /// workflow, which run in the window where the volume has just been
    /// mounted but the derived phase has not yet caught up.
    pub(crate) fn persist_unchecked(&self, config: &Config) -> CofferResult<()> {
        config.save(&self.paths.config_file())
    }

    pub(crate) fn load_unchecked(&self) -> CofferResult<Config> {
        Config::load(&self.paths.config_file())
    }

    pub fn add_session(&self, session: Session) -> CofferResult<()> {
        let mut config = self.load()?;
        if config.sessions.iter().any(|s| s.key == session.key) {
            return Err(CofferError::Validation(
                "session key already registered".into(),
            ));
        }
        config.sessions.push(session);
        self.persist(&config)
    }

    /// Revoke the session holding `key`; unknown keys are a validation error.
    pub fn remove_session(&self, key: &str) -> CofferResult<Session> {
        let mut config = self.load()?;
        let index = config
            .sessions
            .iter()
            .position(|s| s.key == key)
            .ok_or_else(|| CofferError::Validation("unknown session".into()))?;
        let removed = config.sessions.remove(index);
        self.persist(&config)?;
        Ok(removed)
    }

    pub fn sessions(&self) -> CofferResult<Vec<Session>> {
        Ok(self.load()?.sessions)
    }

    /// Mint a one-time password for `user`, valid for ten minutes.
    pub fn issue_otp(&self, user: &str) -> CofferResult<String> {
        let otp = random_credential();
        let mut config = self.load()?;
        config.one_time_passwords.push(OneTimePassword {
            user: user.to_string(),
            one_time_password: otp.clone(),
            date: Utc::now(),
        });
        self.persist(&config)?;
        Ok(otp)
    }

    /// Consume a matching unexpired OTP, returning its bound user. The
    /// entry is removed whether or not it had already expired.
    pub fn consume_otp(&self, otp: &str, now: DateTime<Utc>) -> CofferResult<String> {
        let mut config = self.load()?;
        let index = config
            .one_time_passwords
            .iter()
            .position(|entry| entry.one_time_password == otp)
            .ok_or(CofferError::Auth)?;
        let entry = config.one_time_passwords.remove(index);
        self.persist(&config)?;

        if now - entry.date > Duration::minutes(OTP_TTL_MINUTES) {
            return Err(CofferError::Auth);
        }
        Ok(entry.user)
    }

    /// Create or update the share covering `path`, materialising its OS
    /// group. Two shares with the same user set reuse one group.
    pub fn upsert_share<A>(
        &self,
        accounts: &A,
        name: &str,
        path: &str,
        users: Vec<String>,
    ) -> CofferResult<Share>
    where
        A: AccountProvider<Error = CofferError>,
    {
        if name.trim().is_empty() {
            return Err(CofferError::Validation("share name is required".into()));
        }
        let path = normalize_share_path(path)?;
        let group_name = derive_group_name(&users);

        let mut config = self.load()?;
        let share = match config.shares.iter_mut().find(|share| share.path == path) {
            Some(existing) => {
                existing.users = users.clone();
                existing.group_name = group_name.clone();
                existing.clone()
            }
            None => {
                let unique = disambiguate_name(name, &config.shares);
                let share = Share {
                    name: unique,
                    path,
                    users: users.clone(),
                    group_name: group_name.clone(),
                };
                config.shares.push(share.clone());
                share
            }
        };

        // lazily create the group on first use, then mirror membership
        accounts.ensure_group(&group_name, &users)?;
        match config
            .groups
            .iter_mut()
            .find(|group| group.group_name == group_name)
        {
            Some(group) => group.users = users,
            None => config.groups.push(Group { group_name, users }),
        }
        prune_orphan_groups(&mut config);

        self.persist(&config)?;
        Ok(share)
    }
}

/// Drop group entries no share references anymore.
fn prune_orphan_groups(config: &mut Config) {
    let Config { shares, groups, .. } = config;
    groups.retain(|group| shares.iter().any(|s| s.group_name == group.group_name));
}

/// Fixed-length one-way digest of the sorted user list, truncated to fit
/// the OS group-name limit.
pub fn derive_group_name(users: &[String]) -> String {
    let mut sorted: Vec<&str> = users.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let digest = Sha256::digest(sorted.join(",").as_bytes());
    format!("coffer-{}", &hex::encode(digest)[..10])
}

/// Share paths are stored with a trailing slash and must stay inside the
/// volume (no traversal segments).
pub fn normalize_share_path(path: &str) -> CofferResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed.contains("..") {
        return Err(CofferError::Validation(format!("invalid share path: {path:?}")));
    }
    let mut normalized = trimmed.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

fn disambiguate_name(requested: &str, existing: &[Share]) -> String {
    let taken = |candidate: &str| existing.iter().any(|share| share.name == candidate);
    if !taken(requested) {
        return requested.to_string();
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{requested}-{counter}");
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Random bearer-grade credential (sessions, OTPs).
pub fn random_credential() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}
