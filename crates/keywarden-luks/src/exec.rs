//! Execution helper for the external tools this crate shells out to.

use keywarden_core::error::{KeywardenError, KeywardenResult};
use std::ffi::OsStr;
use std::io::Write;
use std::process::{Command, Stdio};

/// Run a command and report only whether it exited successfully. Used for
/// probes whose answer is the exit status.
pub(crate) fn run_success<I, S>(binary: &OsStr, args: I) -> KeywardenResult<bool>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let status = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|err| {
            KeywardenError::Io(std::io::Error::other(format!(
                "spawn {}: {err}",
                binary.to_string_lossy()
            )))
        })?;
    Ok(status.success())
}

/// Run a command, feed `stdin_bytes` when given, and return stdout. A
/// non-zero exit turns into an error carrying the captured stderr.
pub(crate) fn run_checked<I, S>(
    binary: &OsStr,
    args: I,
    stdin_bytes: Option<&[u8]>,
) -> KeywardenResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(if stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| {
        KeywardenError::Io(std::io::Error::other(format!(
            "spawn {}: {err}",
            binary.to_string_lossy()
        )))
    })?;

    if let Some(bytes) = stdin_bytes {
        // stdin handle is present because we asked for a pipe above.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(bytes)?;
        }
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KeywardenError::Io(std::io::Error::other(format!(
            "{} exited with {}: {}",
            binary.to_string_lossy(),
            output.status,
            stderr.trim()
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
