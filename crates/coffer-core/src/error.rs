//! Error taxonomy shared by every Coffer crate.

use thiserror::Error;

pub type CofferResult<T> = Result<T, CofferError>;

/// Failure classes surfaced by storage, credential, and config operations.
///
/// `Auth` deliberately carries no detail about which factor failed.
#[derive(Debug, Error)]
pub enum CofferError {
    #[error("invalid credentials")]
    Auth,

    #[error("operation requires the volume to be unlocked")]
    Locked,

    #[error("[{label}] command failed with exit code {exit_code}: {stderr}")]
    Command {
        label: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("provisioning precondition violated: {0}")]
    Provision(String),

    #[error("{0}")]
    Validation(String),

    #[error("initial setup already completed")]
    AlreadyComplete,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CofferError {
    /// Build a `Command` error from captured process output.
    pub fn command(label: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::Command {
            label: label.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }
}
