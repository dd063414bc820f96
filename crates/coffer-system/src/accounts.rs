//! OS account management and mkpasswd-backed credential checks.
//!
//! Plaintext passwords travel to `mkpasswd` on stdin only. Hashes are
//! installed by rewriting the shadow file directly rather than through
//! `chpasswd`, so the plaintext never exists outside this process and
//! `mkpasswd`.

use crate::command::{CommandRunner, Executor, SystemExecutor};
use coffer_core::{CofferError, CofferResult};
use coffer_provider::{AccountProvider, PasswordVerifier};
use std::fs;
use std::path::PathBuf;

const SHADOW_FILE: &str = "/etc/shadow";

/// Account provider backed by the standard user/group tooling.
#[derive(Debug, Clone)]
pub struct SystemAccounts<E = SystemExecutor> {
    runner: CommandRunner<E>,
    shadow_path: PathBuf,
}

impl SystemAccounts<SystemExecutor> {
    pub fn system() -> Self {
        Self::new(CommandRunner::system(), SHADOW_FILE)
    }
}

impl<E: Executor> SystemAccounts<E> {
    pub fn new(runner: CommandRunner<E>, shadow_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            shadow_path: shadow_path.into(),
        }
    }

    pub fn runner(&self) -> &CommandRunner<E> {
        &self.runner
    }
}

/// Replace the hash field of `user`'s shadow entry, leaving every other
/// field untouched. Returns false when the user has no entry.
fn rewrite_shadow_entry(contents: &str, user: &str, hash: &str) -> Option<String> {
    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for line in contents.lines() {
        match line.split_once(':') {
            Some((name, rest)) if name == user => {
                found = true;
                let tail = rest.split_once(':').map(|(_, t)| t).unwrap_or("");
                lines.push(format!("{name}:{hash}:{tail}"));
            }
            _ => lines.push(line.to_string()),
        }
    }
    found.then(|| {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    })
}

fn shadow_entry_hash(contents: &str, user: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name != user {
            return None;
        }
        let hash = rest.split(':').next().unwrap_or("");
        Some(hash.to_string())
    })
}

impl<E: Executor> AccountProvider for SystemAccounts<E> {
    type Error = CofferError;

    fn create_user(&self, user: &str, full_name: &str) -> CofferResult<()> {
        self.runner.run(
            "create account",
            "useradd",
            &["-m", "-s", "/bin/bash", "--comment", full_name, user],
        )?;
        Ok(())
    }

    fn set_password_hash(&self, user: &str, hash: &str) -> CofferResult<()> {
        let contents = fs::read_to_string(&self.shadow_path)?;
        let rewritten = rewrite_shadow_entry(&contents, user, hash).ok_or_else(|| {
            CofferError::Provision(format!("no shadow entry for {user}"))
        })?;
        fs::write(&self.shadow_path, rewritten)?;
        Ok(())
    }

    fn make_admin(&self, user: &str) -> CofferResult<()> {
        self.runner
            .run("grant admin", "usermod", &["-aG", "sudo", user])?;
        Ok(())
    }

    fn delete_user(&self, user: &str) -> CofferResult<()> {
        match self
            .runner
            .run("delete account", "deluser", &["--remove-home", user])
        {
            Ok(_) => Ok(()),
            Err(CofferError::Command { stderr, .. }) if stderr.contains("does not exist") => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_group(&self, group: &str, users: &[String]) -> CofferResult<()> {
        self.runner
            .run("ensure group", "groupadd", &["-f", group])?;
        self.runner.run(
            "set group members",
            "gpasswd",
            &["-M", &users.join(","), group],
        )?;
        Ok(())
    }
}

/// Credential verifier that defers hashing to `mkpasswd` and reads stored
/// hashes from the shadow file.
#[derive(Debug, Clone)]
pub struct MkpasswdVerifier<E = SystemExecutor> {
    runner: CommandRunner<E>,
    shadow_path: PathBuf,
}

impl MkpasswdVerifier<SystemExecutor> {
    pub fn system() -> Self {
        Self::new(CommandRunner::system(), SHADOW_FILE)
    }
}

impl<E: Executor> MkpasswdVerifier<E> {
    pub fn new(runner: CommandRunner<E>, shadow_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            shadow_path: shadow_path.into(),
        }
    }
}

impl<E: Executor> PasswordVerifier for MkpasswdVerifier<E> {
    type Error = CofferError;

    /// Re-derive the hash with the stored hash as salt; crypt format embeds
    /// the method and salt, so equal output means the password matches.
    fn check_password(&self, plain: &str, hash: &str) -> CofferResult<bool> {
        let out = self.runner.run_with_secret(
            "check password",
            "mkpasswd",
            &["--stdin", "--salt", hash],
            plain.as_bytes(),
        );
        match out {
            Ok(out) => Ok(out.stdout.trim() == hash),
            // a malformed or locked hash can never match
            Err(CofferError::Command { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn hash_password(&self, plain: &str) -> CofferResult<String> {
        let out = self.runner.run_with_secret(
            "hash password",
            "mkpasswd",
            &["--stdin", "--method", "sha-512"],
            plain.as_bytes(),
        )?;
        Ok(out.stdout.trim().to_string())
    }

    fn shadow_hash(&self, user: &str) -> CofferResult<Option<String>> {
        let contents = fs::read_to_string(&self.shadow_path)?;
        Ok(shadow_entry_hash(&contents, user)
            .filter(|hash| !hash.is_empty() && !hash.starts_with('!') && !hash.starts_with('*')))
    }
}
