//! Durable configuration record, host paths, and setup markers.
//!
//! The config record is a single JSON document on the encrypted volume; it
//! is the source of truth for sessions, one-time passwords, and shares.
//! Markers are zero-byte files that live *outside* the volume so they are
//! readable while the disks are still locked.

use crate::error::{CofferError, CofferResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = "/etc/coffer";
pub const DEFAULT_MOUNT_ROOT: &str = "/coffer";

const SETUP_MARKER: &str = "setup-complete";
const UPDATE_MARKER: &str = "update-in-progress";
const OWNER_FILE: &str = "owner";
const CONFIG_FILE: &str = "config.json";

/// Filesystem locations the appliance operates on. Overridable so tests can
/// point everything at a tempdir.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// Unencrypted state directory holding the markers.
    pub state_dir: PathBuf,
    /// Mountpoint of the logical volume.
    pub mount_root: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
        }
    }
}

impl HostPaths {
    pub fn new(state_dir: impl Into<PathBuf>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            mount_root: mount_root.into(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.mount_root.join(CONFIG_FILE)
    }

    /// Root of user-visible files on the volume.
    pub fn files_root(&self) -> PathBuf {
        self.mount_root.join("files")
    }

    pub fn setup_marker(&self) -> PathBuf {
        self.state_dir.join(SETUP_MARKER)
    }

    pub fn update_marker(&self) -> PathBuf {
        self.state_dir.join(UPDATE_MARKER)
    }

    pub fn setup_complete(&self) -> bool {
        self.setup_marker().exists()
    }

    pub fn update_in_progress(&self) -> bool {
        self.update_marker().exists()
    }

    /// Create the setup marker, failing with `AlreadyComplete` if present.
    ///
    /// The marker doubles as the mutual-exclusion lock for setup: it is
    /// written before any provisioning work starts, and a failed setup must
    /// call `clear_setup_marker` on its way out or the appliance stays
    /// wedged in the completed state.
    pub fn claim_setup_marker(&self) -> CofferResult<()> {
        fs::create_dir_all(&self.state_dir)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.setup_marker())
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(CofferError::AlreadyComplete)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn clear_setup_marker(&self) -> CofferResult<()> {
        remove_if_present(&self.setup_marker())
    }

    pub fn clear_update_marker(&self) -> CofferResult<()> {
        remove_if_present(&self.update_marker())
    }

    /// The owner's username, kept outside the volume so the credential gate
    /// can recognise an owner login while the disks are still locked.
    pub fn owner_file(&self) -> PathBuf {
        self.state_dir.join(OWNER_FILE)
    }

    pub fn read_owner(&self) -> CofferResult<Option<String>> {
        match fs::read_to_string(self.owner_file()) {
            Ok(contents) => {
                let owner = contents.trim().to_string();
                Ok((!owner.is_empty()).then_some(owner))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write_owner(&self, user: &str) -> CofferResult<()> {
        fs::create_dir_all(&self.state_dir)?;
        fs::write(self.owner_file(), user)?;
        Ok(())
    }

    pub fn clear_owner(&self) -> CofferResult<()> {
        remove_if_present(&self.owner_file())
    }
}

fn remove_if_present(path: &Path) -> CofferResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Bearer session handed to the mobile/desktop app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: String,
    /// Bearer credential; unique within the record.
    pub key: String,
    pub name: String,
    pub platform: String,
}

/// Single-use, time-boxed credential bound to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePassword {
    pub user: String,
    pub one_time_password: String,
    pub date: DateTime<Utc>,
}

/// Access-control entry over a sub-path of the mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub name: String,
    /// Normalised to a trailing slash; unique within the record.
    pub path: String,
    pub users: Vec<String>,
    pub group_name: String,
}

/// Materialised OS-group mirror of the shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_name: String,
    pub users: Vec<String>,
}

/// The durable config record. Only ever written while the volume is
/// unlocked; see `AccessStore` for the enforcement point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub owner: String,
    pub device_name: String,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub one_time_passwords: Vec<OneTimePassword>,
    #[serde(default)]
    pub shares: Vec<Share>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Config {
    pub fn load(path: &Path) -> CofferResult<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|err| {
            CofferError::InvalidConfig(format!("{}: {err}", path.display()))
        })
    }

    /// Write the record atomically (temp file + rename in the same dir).
    pub fn save(&self, path: &Path) -> CofferResult<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| CofferError::InvalidConfig(err.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn session_for_key(&self, key: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.key == key)
    }

    pub fn is_owner(&self, user: &str) -> bool {
        !self.owner.is_empty() && self.owner == user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn claim_setup_marker_rejects_second_claim() {
        let dir = tempdir().unwrap();
        let paths = HostPaths::new(dir.path().join("state"), dir.path().join("mnt"));

        assert!(!paths.setup_complete());
        paths.claim_setup_marker().unwrap();
        assert!(paths.setup_complete());

        match paths.claim_setup_marker() {
            Err(CofferError::AlreadyComplete) => {}
            other => panic!("expected AlreadyComplete, got {other:?}"),
        }

        paths.clear_setup_marker().unwrap();
        assert!(!paths.setup_complete());
        // clearing an absent marker stays quiet
        paths.clear_setup_marker().unwrap();
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config {
            owner: "ada".into(),
            device_name: "Ada's Coffer (af01)".into(),
            sessions: vec![Session {
                user: "ada".into(),
                key: "k-1".into(),
                name: "Pixel".into(),
                platform: "android".into(),
            }],
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.is_owner("ada"));
        assert!(!loaded.is_owner("grace"));
        assert_eq!(loaded.session_for_key("k-1").unwrap().name, "Pixel");
    }

    #[test]
    fn config_accepts_records_without_optional_lists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"owner":"ada","deviceName":"box"}"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.sessions.is_empty());
        assert!(loaded.one_time_passwords.is_empty());
    }
}
