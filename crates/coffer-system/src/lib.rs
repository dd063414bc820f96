//! Host-backed providers for the Coffer appliance.
//!
//! Everything here shells out: cryptsetup and LVM for storage, the user
//! and group tooling for accounts, `mkpasswd` for credential checks, and
//! the display daemon's unix socket for the front screen. The
//! [`command::Executor`] seam keeps all of it testable without a host.

pub mod accounts;
pub mod command;
pub mod inventory;
pub mod provision;
pub mod screen;

pub use accounts::{MkpasswdVerifier, SystemAccounts};
pub use command::{CmdOutput, CommandRunner, Executor, SystemExecutor};
pub use inventory::{bytes_to_human, system_serial};
pub use provision::SystemDiskProvider;
pub use screen::FramebufferScreen;
