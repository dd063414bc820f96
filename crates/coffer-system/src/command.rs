//! Labelled execution wrapper for external system commands.
//!
//! Every side-effecting operation in the storage subsystem goes through
//! this type so each action is logged under a stable label. Secrets are
//! fed on stdin and withheld from logs; argv never carries a passphrase.

use coffer_core::{CofferError, CofferResult};
use log::{info, warn};
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process-spawning seam. Production code uses `SystemExecutor`; tests
/// substitute a recording fake so command sequences stay assertable.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> io::Result<CmdOutput>;
}

/// Runs commands on the host via `std::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> io::Result<CmdOutput> {
        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn()?;
        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(payload)?;
                pipe.flush().ok();
            }
            // dropping the pipe closes stdin so the child sees EOF
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }
        let status = child.wait()?;

        Ok(CmdOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Labelled command runner with fatal and best-effort ("bypass") modes.
#[derive(Debug, Clone)]
pub struct CommandRunner<E = SystemExecutor> {
    pub(crate) executor: E,
}

impl CommandRunner<SystemExecutor> {
    pub fn system() -> Self {
        Self::new(SystemExecutor)
    }
}

impl<E: Executor> CommandRunner<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Run a command, failing with `CofferError::Command` on non-zero exit.
    pub fn run(&self, label: &str, program: &str, args: &[&str]) -> CofferResult<CmdOutput> {
        info!("[{label}] running {program} {}", args.join(" "));
        self.dispatch(label, program, args, None)
    }

    /// Run a command with secret bytes on stdin. The arguments are logged
    /// but the payload never is.
    pub fn run_with_secret(
        &self,
        label: &str,
        program: &str,
        args: &[&str],
        secret: &[u8],
    ) -> CofferResult<CmdOutput> {
        info!("[{label}] running {program} {} (secret on stdin)", args.join(" "));
        self.dispatch(label, program, args, Some(secret))
    }

    /// Best-effort variant: failures are logged and swallowed. Used for
    /// cleanup steps where a missing intermediate state is expected.
    pub fn run_bypass(&self, label: &str, program: &str, args: &[&str]) -> Option<CmdOutput> {
        info!("[{label}] running {program} {} (bypass)", args.join(" "));
        match self.dispatch(label, program, args, None) {
            Ok(output) => Some(output),
            Err(err) => {
                warn!("[{label}] bypassed error: {err}");
                None
            }
        }
    }

    fn dispatch(
        &self,
        label: &str,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> CofferResult<CmdOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.executor.execute(program, &args, stdin)?;
        if output.success() {
            Ok(output)
        } else {
            Err(CofferError::command(
                label,
                output.exit_code,
                output.stderr.trim().to_string(),
            ))
        }
    }

    /// Like `run`, but a listed exit code is returned instead of failing.
    /// Probing commands (`findmnt`, `cryptsetup status`) use non-zero exit
    /// as an answer, not an error.
    pub fn run_expecting(
        &self,
        label: &str,
        program: &str,
        args: &[&str],
        tolerated: &[i32],
    ) -> CofferResult<CmdOutput> {
        info!("[{label}] running {program} {}", args.join(" "));
        let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.executor.execute(program, &args_owned, None)?;
        if output.success() || tolerated.contains(&output.exit_code) {
            Ok(output)
        } else {
            Err(CofferError::command(
                label,
                output.exit_code,
                output.stderr.trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted executor: maps a command line to a canned response and
    /// records everything it ran (plus whether stdin was supplied).
    #[derive(Default)]
    pub struct FakeExecutor {
        responses: Mutex<HashMap<String, CmdOutput>>,
        pub calls: Mutex<Vec<(String, bool)>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, command_line: &str, exit_code: i32, stdout: &str, stderr: &str) {
            self.responses.lock().unwrap().insert(
                command_line.to_string(),
                CmdOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code,
                },
            );
        }

        pub fn ran(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    impl Executor for FakeExecutor {
        fn execute(
            &self,
            program: &str,
            args: &[String],
            stdin: Option<&[u8]>,
        ) -> io::Result<CmdOutput> {
            let line = if args.is_empty() {
                program.to_string()
            } else {
                format!("{program} {}", args.join(" "))
            };
            self.calls
                .lock()
                .unwrap()
                .push((line.clone(), stdin.is_some()));
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or(CmdOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeExecutor;
    use super::*;

    #[test]
    fn non_zero_exit_becomes_command_error_with_label() {
        let executor = FakeExecutor::new();
        executor.respond("vgcreate coffer_vg", 5, "", "device busy");
        let runner = CommandRunner::new(executor);

        let err = runner
            .run("create volume group", "vgcreate", &["coffer_vg"])
            .unwrap_err();
        match err {
            CofferError::Command {
                label,
                exit_code,
                stderr,
            } => {
                assert_eq!(label, "create volume group");
                assert_eq!(exit_code, 5);
                assert_eq!(stderr, "device busy");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bypass_swallows_failures() {
        let executor = FakeExecutor::new();
        executor.respond("pvremove /dev/mapper/encrypted_sda", 5, "", "not a pv");
        let runner = CommandRunner::new(executor);

        assert!(runner
            .run_bypass("erase sda", "pvremove", &["/dev/mapper/encrypted_sda"])
            .is_none());
        assert_eq!(runner.executor.ran().len(), 1);
    }

    #[test]
    fn secrets_travel_on_stdin() {
        let executor = FakeExecutor::new();
        let runner = CommandRunner::new(executor);
        runner
            .run_with_secret(
                "format sda",
                "cryptsetup",
                &["luksFormat", "/dev/sda"],
                b"digest",
            )
            .unwrap();

        let calls = runner.executor.calls.lock().unwrap();
        assert_eq!(calls[0].0, "cryptsetup luksFormat /dev/sda");
        assert!(calls[0].1, "stdin payload expected");
    }

    #[test]
    fn tolerated_exit_codes_are_not_errors() {
        let executor = FakeExecutor::new();
        executor.respond("findmnt -rn /coffer", 1, "", "");
        let runner = CommandRunner::new(executor);

        let out = runner
            .run_expecting("mount probe", "findmnt", &["-rn", "/coffer"], &[1])
            .unwrap();
        assert_eq!(out.exit_code, 1);
    }
}
