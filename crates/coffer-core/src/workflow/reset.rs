//! Factory reset: secure teardown of the volume, containers, and account.
//!
//! Every step runs regardless of earlier failures; errors are collected
//! into the report so a stuck disk cannot block config or account removal.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::error::{CofferError, CofferResult};
use crate::lifecycle::{LifecycleState, Phase};
use crate::secret::SecretCache;
use crate::store::AccessStore;
use coffer_provider::{AccountProvider, DiskProvider, ScreenLine};
use rand::Rng;
use std::sync::Mutex;

/// Characters that cannot be misread on the small front screen.
const RESET_CODE_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const RESET_CODE_LEN: usize = 8;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Default)]
struct ResetCodeInner {
    code: Option<String>,
    attempts: u32,
}

/// Out-of-band reset authorization: a short code shown on the device
/// screen, generated at most once per boot and rate-limited to three
/// verification attempts.
#[derive(Debug, Default)]
pub struct ResetCodes {
    inner: Mutex<ResetCodeInner>,
}

impl ResetCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the boot's reset code. A second call is refused; rebooting is
    /// the only way to get a fresh code.
    pub fn generate(&self) -> CofferResult<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.code.is_some() {
            return Err(CofferError::Validation(
                "reset code already generated; reboot the device to generate a new code".into(),
            ));
        }
        let mut rng = rand::thread_rng();
        let code: String = (0..RESET_CODE_LEN)
            .map(|_| RESET_CODE_ALPHABET[rng.gen_range(0..RESET_CODE_ALPHABET.len())] as char)
            .collect();
        inner.code = Some(code.clone());
        Ok(code)
    }

    /// Check `attempt` against the generated code. Attempts past the limit
    /// fail even when the code is correct.
    pub fn verify(&self, attempt: &str) -> CofferResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.attempts >= MAX_ATTEMPTS {
            return Err(CofferError::Auth);
        }
        inner.attempts += 1;
        match &inner.code {
            Some(code) if code == attempt => Ok(()),
            _ => Err(CofferError::Auth),
        }
    }
}

/// Screen layout for the reset code: two rows of four characters.
pub fn reset_code_lines(code: &str) -> Vec<ScreenLine> {
    let (line1, line2) = code.split_at(code.len().min(4));
    vec![
        ScreenLine::new("Reset Code:", "CCCCCC", 34, 55),
        ScreenLine::new(line1, "FF0000", 60, 130).bold(),
        ScreenLine::new(line2, "FF0000", 60, 190).bold(),
    ]
}

/// Tear down the appliance. The caller must have authorized the request
/// (owner session or verified reset code); `confirmed` is the explicit
/// "I understand this deletes data" flag and is checked before any
/// destructive command runs.
pub fn factory_reset<P, A>(
    provider: &P,
    accounts: &A,
    store: &AccessStore,
    lifecycle: &LifecycleState,
    cache: &SecretCache,
    confirmed: bool,
) -> CofferResult<WorkflowReport>
where
    P: DiskProvider<Error = CofferError>,
    A: AccountProvider<Error = CofferError>,
{
    if !confirmed {
        return Err(CofferError::Validation("missing confirmation".into()));
    }
    if store.paths().update_in_progress() {
        return Err(CofferError::Validation(
            "an update is in progress; retry once it completes".into(),
        ));
    }

    let paths = store.paths();
    let mut events: Vec<WorkflowEvent> = Vec::new();
    let owner = match paths.read_owner() {
        Ok(owner) => owner,
        Err(err) => {
            events.push(event(
                WorkflowLevel::Error,
                format!("could not read owner record: {err}"),
            ));
            None
        }
    };

    cache.clear();

    record(&mut events, "unmount volume", provider.unmount_volume());
    record(&mut events, "deactivate volume group", provider.deactivate_volume());

    match provider.list_candidate_disks() {
        Ok(disks) => {
            for disk in &disks {
                record(
                    &mut events,
                    &format!("erase disk {}", disk.name),
                    provider.erase_disk(disk),
                );
            }
        }
        Err(err) => events.push(event(
            WorkflowLevel::Error,
            format!("could not list disks for erasure: {err}"),
        )),
    }

    // the record lives on the (now destroyed) volume; removal of a stale
    // copy under the mountpoint is best-effort
    let config_file = paths.config_file();
    match std::fs::remove_file(&config_file) {
        Ok(()) => events.push(event(WorkflowLevel::Success, "deleted config record")),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => events.push(event(
            WorkflowLevel::Error,
            format!("could not delete config record: {err}"),
        )),
    }

    record(&mut events, "clear setup marker", paths.clear_setup_marker());
    record(&mut events, "clear update marker", paths.clear_update_marker());
    record(&mut events, "clear owner record", paths.clear_owner());

    match owner {
        Some(owner) => record(
            &mut events,
            &format!("remove owner account {owner}"),
            accounts.delete_user(&owner),
        ),
        None => events.push(event(WorkflowLevel::Info, "no owner account recorded")),
    }

    lifecycle.set(Phase::Uninitialized);
    events.push(event(WorkflowLevel::Security, "factory reset finished"));

    Ok(WorkflowReport {
        title: "factory reset".into(),
        events,
    })
}

fn record(events: &mut Vec<WorkflowEvent>, label: &str, result: CofferResult<()>) {
    match result {
        Ok(()) => events.push(event(WorkflowLevel::Success, label.to_string())),
        Err(err) => events.push(event(WorkflowLevel::Error, format!("{label}: {err}"))),
    }
}
