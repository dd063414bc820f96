//! Lifecycle state machine for the appliance's storage readiness.
//!
//! The phase is derived, never persisted: every evaluation rebuilds it from
//! the disk inventory and the marker files, so a reboot (or a crashed
//! process) recomputes the truth instead of trusting stale state.

use crate::config::HostPaths;
use crate::error::{CofferError, CofferResult};
use coffer_provider::{all_encrypted, all_unlocked, Disk, DiskProvider, ScreenLine, StatusScreen};
use log::{info, warn};
use serde::Serialize;
use std::sync::Mutex;

/// Storage readiness classification. Within one boot the phase only moves
/// forward, except `Locked → Unlocked` via the credential gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// A self-update is running; setup and reset requests are refused.
    Updating,
    /// No completed setup.
    Uninitialized,
    /// Setup complete but a newly attached disk is not yet encrypted.
    NewDisk,
    /// Setup complete, disks encrypted, not all containers open.
    Locked,
    /// All disks encrypted and open, volume mounted.
    Unlocked,
}

/// Decision table from inventory + markers. First match wins.
pub fn derive_phase(disks: &[Disk], setup_complete: bool, update_in_progress: bool) -> Phase {
    if update_in_progress {
        return Phase::Updating;
    }
    if !setup_complete {
        return Phase::Uninitialized;
    }
    if !all_encrypted(disks) {
        return Phase::NewDisk;
    }
    if !all_unlocked(disks) {
        return Phase::Locked;
    }
    Phase::Unlocked
}

/// Process-wide owner of the current phase. All transitions go through this
/// type so concurrent HTTP handlers observe a consistent value.
#[derive(Debug)]
pub struct LifecycleState {
    phase: Mutex<Phase>,
}

impl LifecycleState {
    pub fn new(initial: Phase) -> Self {
        Self {
            phase: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn set(&self, next: Phase) {
        let mut guard = self.phase.lock().unwrap();
        if *guard != next {
            info!("lifecycle phase {:?} -> {next:?}", *guard);
        }
        *guard = next;
    }

    pub fn is_unlocked(&self) -> bool {
        self.current() == Phase::Unlocked
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new(Phase::Uninitialized)
    }
}

/// Result of one phase evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub disks: Vec<Disk>,
}

/// Recompute the phase from the disk inventory and markers, mount the
/// volume when everything is open, and repaint the status screen.
///
/// Runs on boot and on every status poll, so it must stay idempotent.
pub fn evaluate<P>(
    provider: &P,
    paths: &HostPaths,
    state: &LifecycleState,
    screen: &dyn StatusScreen,
) -> CofferResult<PhaseSnapshot>
where
    P: DiskProvider<Error = CofferError>,
{
    let mut disks = Vec::new();
    for disk in provider.list_candidate_disks()? {
        disks.push(provider.query_encryption_state(&disk)?);
    }

    let phase = derive_phase(&disks, paths.setup_complete(), paths.update_in_progress());

    if phase == Phase::Unlocked {
        match provider.is_mounted() {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = provider.mount_volume() {
                    warn!("volume mount during evaluation failed: {err}");
                }
            }
            Err(err) => warn!("mount probe failed: {err}"),
        }
    }

    screen.render(&screen_lines(phase));
    state.set(phase);

    Ok(PhaseSnapshot { phase, disks })
}

/// Front-screen content for each phase.
pub fn screen_lines(phase: Phase) -> Vec<ScreenLine> {
    match phase {
        Phase::Uninitialized => vec![
            ScreenLine::new("Welcome to Coffer", "3C89C7", 36, 70),
            ScreenLine::new("Please use app\n to begin setup", "CCCCCC", 28, 170),
        ],
        Phase::Locked => vec![
            ScreenLine::new("Disks Locked", "3C89C7", 36, 55),
            ScreenLine::new("Please login\n as owner\n to unlock", "CCCCCC", 28, 150),
        ],
        Phase::NewDisk => vec![
            ScreenLine::new("New Disk Added", "3C89C7", 36, 70),
            ScreenLine::new("Continue setup\n on app", "CCCCCC", 28, 165),
        ],
        Phase::Updating => vec![
            ScreenLine::new("Updating", "3C89C7", 36, 70),
            ScreenLine::new("Please wait", "CCCCCC", 28, 165),
        ],
        Phase::Unlocked => vec![ScreenLine::new("Coffer Ready", "3C89C7", 36, 100)],
    }
}
