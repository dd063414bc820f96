//! Contracts for host collaborators: credential checking, OS accounts, and
//! the on-device status screen.

use serde::Serialize;
use std::error::Error;

/// Verifies and produces system credential hashes.
///
/// Implementations must never place the plaintext password in a process
/// argument list; argv is visible to every local process.
pub trait PasswordVerifier {
    type Error: Error + Send + Sync + 'static;

    /// Check `plain` against a stored crypt hash.
    fn check_password(&self, plain: &str, hash: &str) -> Result<bool, Self::Error>;

    /// Produce a crypt hash suitable for `/etc/shadow`.
    fn hash_password(&self, plain: &str) -> Result<String, Self::Error>;

    /// Look up the stored hash for a system user, if the user exists.
    fn shadow_hash(&self, user: &str) -> Result<Option<String>, Self::Error>;
}

/// OS account and group management used by setup, sharing, and reset.
pub trait AccountProvider {
    type Error: Error + Send + Sync + 'static;

    /// Create a login account with the given GECOS full name.
    fn create_user(&self, user: &str, full_name: &str) -> Result<(), Self::Error>;

    /// Install a pre-hashed credential for `user`.
    fn set_password_hash(&self, user: &str, hash: &str) -> Result<(), Self::Error>;

    /// Grant administrative (sudo) rights.
    fn make_admin(&self, user: &str) -> Result<(), Self::Error>;

    /// Remove the account and its home directory; absent users succeed.
    fn delete_user(&self, user: &str) -> Result<(), Self::Error>;

    /// Create `group` if missing and set its member list exactly.
    fn ensure_group(&self, group: &str, users: &[String]) -> Result<(), Self::Error>;
}

/// One line of text on the appliance's front screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenLine {
    pub content: String,
    pub color: String,
    pub size: u32,
    pub y: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub bold: bool,
}

impl ScreenLine {
    pub fn new(content: impl Into<String>, color: &str, size: u32, y: u32) -> Self {
        Self {
            content: content.into(),
            color: color.to_string(),
            size,
            y,
            bold: false,
        }
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }
}

/// Renderer for the on-device display. Rendering is advisory: failures are
/// logged by implementations and never fail the calling operation.
pub trait StatusScreen: Send + Sync {
    fn render(&self, lines: &[ScreenLine]);
}

/// No-op screen for tests and headless development.
#[derive(Debug, Default, Clone)]
pub struct NullScreen;

impl StatusScreen for NullScreen {
    fn render(&self, _lines: &[ScreenLine]) {}
}
