#![forbid(unsafe_code)]

//! Provider contracts shared across Coffer.
//!
//! The rest of the workspace is free to define workflows and the HTTP
//! surface without depending on concrete system integrations.

pub mod disk;
pub mod host;

pub use disk::{all_encrypted, all_unlocked, Disk, DiskDetail, DiskProvider, UnlockedDisk, VolumeTopology};
pub use host::{AccountProvider, NullScreen, PasswordVerifier, ScreenLine, StatusScreen};
