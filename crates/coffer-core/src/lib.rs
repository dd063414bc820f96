//! Core building blocks shared by Coffer binaries.
//!
//! Lifecycle derivation, the credential gate, the access store, and the
//! provisioning workflows live here so the daemon can focus on its HTTP
//! surface instead of reimplementing orchestration.

pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod logging;
pub mod secret;
pub mod store;
pub mod workflow;

pub use config::{Config, Group, HostPaths, OneTimePassword, Session, Share};
pub use error::{CofferError, CofferResult};
pub use gate::{login, login_with_otp, LoginRequest};
pub use lifecycle::{derive_phase, evaluate, LifecycleState, Phase, PhaseSnapshot};
pub use secret::{derive_disk_secret, SecretCache};
pub use store::AccessStore;
pub use workflow::{
    expand_disks, factory_reset, initial_setup, ExpandRequest, ResetCodes, SetupRequest,
    WorkflowReport,
};
