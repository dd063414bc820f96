//! Block-device inventory: candidate discovery and encryption-state probes.
//!
//! Probe failures are deliberately non-fatal. A disk that cannot be
//! identified as an encryption container is treated as blank, and a
//! container whose mapping cannot be queried is treated as locked; the
//! lifecycle machine then errs on the side of "not ready".

use crate::command::{CommandRunner, Executor};
use coffer_core::CofferResult;
use coffer_provider::{Disk, DiskDetail};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LsblkDoc {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SmartctlDoc {
    #[serde(default)]
    model_family: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
}

/// A candidate data disk is a whole `sd[a-z]` device; boot/system media
/// (`mmcblk*`, `nvme*`) never qualify.
fn is_candidate_name(name: &str) -> bool {
    let mut chars = name.chars();
    name.len() == 3
        && chars.next() == Some('s')
        && chars.next() == Some('d')
        && chars.next().is_some_and(|c| c.is_ascii_lowercase())
}

pub(crate) fn parse_candidates(lsblk_json: &str) -> CofferResult<Vec<(String, u64)>> {
    let doc: LsblkDoc = serde_json::from_str(lsblk_json).map_err(|err| {
        coffer_core::CofferError::Provision(format!("unparsable lsblk output: {err}"))
    })?;
    Ok(doc
        .blockdevices
        .into_iter()
        .filter(|device| is_candidate_name(&device.name))
        .map(|device| (device.name, device.size.unwrap_or(0)))
        .collect())
}

/// Enumerate candidate disks by name.
pub fn list_candidate_disks<E: Executor>(runner: &CommandRunner<E>) -> CofferResult<Vec<Disk>> {
    let out = runner.run("list disks", "lsblk", &["--json", "--bytes", "--nodeps"])?;
    Ok(parse_candidates(&out.stdout)?
        .into_iter()
        .map(|(name, _)| Disk::new(name))
        .collect())
}

/// Probe one disk's encryption container and mapping state.
pub fn query_encryption_state<E: Executor>(
    runner: &CommandRunner<E>,
    disk: &Disk,
) -> CofferResult<Disk> {
    let mut probed = Disk::new(&disk.name);

    let is_luks = runner.run_bypass(
        "probe container",
        "cryptsetup",
        &["isLuks", &disk.device_path()],
    );
    match is_luks {
        Some(out) if out.success() => probed.encrypted = Some(true),
        // probe error or non-zero exit: treat as a blank disk
        _ => {
            probed.encrypted = Some(false);
            return Ok(probed);
        }
    }

    let mapping = disk.mapping_name();
    let status = runner.run_bypass("probe mapping", "cryptsetup", &["status", &mapping]);
    let active = status
        .map(|out| {
            out.success() && out.stdout.contains(&format!("/dev/mapper/{mapping} is active"))
        })
        .unwrap_or(false);
    probed.unlocked = Some(active);
    Ok(probed)
}

/// Hardware metadata for the setup app, best-effort per disk.
pub fn disk_details<E: Executor>(runner: &CommandRunner<E>) -> CofferResult<Vec<DiskDetail>> {
    let out = runner.run("list disks", "lsblk", &["--json", "--bytes", "--nodeps"])?;
    let mut details = Vec::new();
    for (name, size) in parse_candidates(&out.stdout)? {
        let mut detail = DiskDetail {
            name: name.clone(),
            size_bytes: size,
            ..DiskDetail::default()
        };
        let device = format!("/dev/{name}");
        match runner.run_bypass("smart info", "smartctl", &["--json", "-i", &device]) {
            Some(out) if out.success() => {
                if let Ok(smart) = serde_json::from_str::<SmartctlDoc>(&out.stdout) {
                    detail.vendor = smart.model_family.or_else(|| {
                        smart
                            .model_name
                            .as_deref()
                            .and_then(|m| m.split(' ').next())
                            .map(str::to_string)
                    });
                    detail.model = smart.model_name;
                    detail.serial = smart.serial_number;
                }
            }
            _ => detail.vendor = Some("unknown".to_string()),
        }
        details.push(detail);
    }
    Ok(details)
}

/// Appliance serial: the MAC of the primary interface with colons removed.
pub fn system_serial<E: Executor>(runner: &CommandRunner<E>) -> Option<String> {
    let out = runner.run_bypass("read serial", "ip", &["link", "show", "eth0"])?;
    if !out.success() {
        return None;
    }
    let token = out
        .stdout
        .split_whitespace()
        .skip_while(|word| *word != "link/ether")
        .nth(1)?;
    Some(token.replace(':', ""))
}

/// Human-readable size, decimal units.
pub fn bytes_to_human(size: u64) -> String {
    if size == 0 {
        return "0 B".to_string();
    }
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let exponent = ((size as f64).log10() / 3.0).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = size as f64 / 1000f64.powi(exponent as i32);
    format!("{:.0} {}", value, UNITS[exponent])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeExecutor;

    const LSBLK: &str = r#"{"blockdevices":[
        {"name":"sda","size":1000204886016},
        {"name":"sdb","size":500107862016},
        {"name":"mmcblk0","size":31268536320},
        {"name":"nvme0n1","size":256060514304}
    ]}"#;

    #[test]
    fn boot_media_is_filtered_out() {
        let names = parse_candidates(LSBLK).unwrap();
        assert_eq!(
            names.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            ["sda", "sdb"]
        );
    }

    #[test]
    fn probe_errors_degrade_to_blank_or_locked() {
        let executor = FakeExecutor::new();
        executor.respond("cryptsetup isLuks /dev/sda", 1, "", "not a LUKS device");
        let runner = CommandRunner::new(executor);

        let probed = query_encryption_state(&runner, &Disk::new("sda")).unwrap();
        assert_eq!(probed.encrypted, Some(false));
        assert_eq!(probed.unlocked, None);

        let executor = FakeExecutor::new();
        executor.respond("cryptsetup isLuks /dev/sdb", 0, "", "");
        executor.respond("cryptsetup status encrypted_sdb", 4, "", "inactive");
        let runner = CommandRunner::new(executor);

        let probed = query_encryption_state(&runner, &Disk::new("sdb")).unwrap();
        assert_eq!(probed.encrypted, Some(true));
        assert_eq!(probed.unlocked, Some(false));
    }

    #[test]
    fn active_mapping_reports_unlocked() {
        let executor = FakeExecutor::new();
        executor.respond("cryptsetup isLuks /dev/sda", 0, "", "");
        executor.respond(
            "cryptsetup status encrypted_sda",
            0,
            "/dev/mapper/encrypted_sda is active and is in use.\n  type: LUKS2\n",
            "",
        );
        let runner = CommandRunner::new(executor);

        let probed = query_encryption_state(&runner, &Disk::new("sda")).unwrap();
        assert_eq!(probed.encrypted, Some(true));
        assert_eq!(probed.unlocked, Some(true));
    }

    #[test]
    fn serial_comes_from_the_ether_address() {
        let executor = FakeExecutor::new();
        executor.respond(
            "ip link show eth0",
            0,
            "2: eth0: <BROADCAST> mtu 1500\n    link/ether b8:27:eb:af:01:23 brd ff:ff:ff:ff:ff:ff\n",
            "",
        );
        let runner = CommandRunner::new(executor);
        assert_eq!(system_serial(&runner).unwrap(), "b827ebaf0123");
    }

    #[test]
    fn sizes_render_in_decimal_units() {
        assert_eq!(bytes_to_human(0), "0 B");
        assert_eq!(bytes_to_human(999), "999 B");
        assert_eq!(bytes_to_human(1000204886016), "1 TB");
        assert_eq!(bytes_to_human(500107862016), "500 GB");
    }
}
