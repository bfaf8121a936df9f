/// Child process lifecycle: re-spawn the program with the guard injected,
/// stdin/stdout passed straight through and stderr piped back to us, then
/// wait for it and turn its termination into a plain exit status.
use crate::error::WrapError;
use crate::guard::IdentityGuard;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, Command};

/// Exit status reported when the platform gives neither a code nor a signal.
pub const FALLBACK_EXIT_STATUS: i32 = 1;

/// A running supervised child.
#[derive(Debug)]
pub struct SupervisedChild {
    child: Child,
    pid: u32,
}

/// Spawn `program` with `args`, marking it as supervised via `guard`.
///
/// Returns the child together with the read end of its stderr pipe.
pub fn spawn(
    program: &Path,
    args: &[OsString],
    guard: &IdentityGuard,
) -> Result<(SupervisedChild, ChildStderr), WrapError> {
    tracing::info!(
        program = %program.display(),
        args = ?args,
        "spawning supervised child"
    );

    let mut child = Command::new(program)
        .args(args)
        .env(guard.key(), guard.value())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| WrapError::Spawn {
            program: program.to_path_buf(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    let stderr = child.stderr.take().ok_or_else(|| WrapError::Spawn {
        program: program.to_path_buf(),
        source: std::io::Error::other("child stderr was not piped"),
    })?;

    tracing::info!(pid, "supervised child started");
    Ok((SupervisedChild { child, pid }, stderr))
}

impl SupervisedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the child terminates and return its exit status.
    pub async fn wait(&mut self) -> Result<i32, WrapError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| WrapError::Supervise { source: e })?;
        let code = exit_status_code(status);
        tracing::info!(
            pid = self.pid,
            exit_status = code,
            success = status.success(),
            "supervised child exited"
        );
        Ok(code)
    }
}

/// Map a termination to a non-negative status.
///
/// Normal exits keep their code bit-for-bit. A signal death becomes
/// `128 + signo`, the convention shells use.
pub fn exit_status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    FALLBACK_EXIT_STATUS
}
