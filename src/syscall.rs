// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process invocation.
//!
//! Every provisioning step ultimately shells out to some host binary, e.g.,
//! `dism.exe`, `wsl.exe`, or `powershell.exe`. These helpers wrap the three
//! ways the rest of the crate needs to call them: interactively with the
//! caller's terminal attached, non-interactively with output captured, and
//! as a plain status query whose exit code is inspected by the caller.
//!
//! # Console Encoding
//!
//! Some Windows binaries, most notably `wsl.exe`, write UTF-16LE to a pipe
//! instead of UTF-8. Captured output is always run through
//! [`decode_console_output`] before it reaches the caller.

use std::{
    ffi::OsStr,
    process::{Command, Stdio},
};
use tracing::{debug, instrument};

/// Captured result of an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    /// Exit code, or `None` if process was terminated by a signal.
    pub code: Option<i32>,

    /// Decoded standard output.
    pub stdout: String,

    /// Decoded standard error.
    pub stderr: String,
}

impl Captured {
    /// Check if process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Merge stdout and stderr into one chomped message.
    pub fn message(&self) -> String {
        let mut message = String::new();

        if !self.stdout.is_empty() {
            message.push_str(format!("stdout: {}", self.stdout).as_str());
        }

        if !self.stderr.is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(format!("stderr: {}", self.stderr).as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        message.trim_end_matches(['\r', '\n']).to_string()
    }
}

/// Run command with caller's terminal attached.
///
/// Blocks until the command exits.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
/// - Return [`SyscallError::Failed`] if command exits with non-zero status.
#[instrument(skip(cmd, args), level = "debug")]
pub fn syscall_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<()> {
    let mut command = Command::new(cmd.as_ref());
    command.args(args);
    debug!("run {command:?}");

    let status = command
        .stdin(Stdio::inherit())
        .spawn()
        .and_then(|mut child| child.wait())
        .map_err(|source| SyscallError::Spawn {
            command: display_command(&command),
            source,
        })?;

    if !status.success() {
        return Err(SyscallError::Failed {
            command: display_command(&command),
            code: status.code(),
            message: String::new(),
        });
    }

    Ok(())
}

/// Run command and capture its output.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
/// - Return [`SyscallError::Failed`] if command exits with non-zero status.
pub fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let mut command = Command::new(cmd.as_ref());
    command.args(args);
    let captured = capture(&mut command)?;

    if !captured.success() {
        return Err(SyscallError::Failed {
            command: display_command(&command),
            code: captured.code,
            message: captured.message(),
        });
    }

    Ok(captured.stdout)
}

/// Run command and return its captured output regardless of exit status.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
pub fn syscall_status(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<Captured> {
    let mut command = Command::new(cmd.as_ref());
    command.args(args);
    capture(&mut command)
}

fn capture(command: &mut Command) -> Result<Captured> {
    debug!("run {command:?}");

    // INVARIANT: Ask wsl.exe for UTF-8, decoding still handles older builds.
    let output = command
        .env("WSL_UTF8", "1")
        .stdin(Stdio::null())
        .output()
        .map_err(|source| SyscallError::Spawn {
            command: display_command(command),
            source,
        })?;

    Ok(Captured {
        code: output.status.code(),
        stdout: decode_console_output(&output.stdout),
        stderr: decode_console_output(&output.stderr),
    })
}

/// Decode raw console output into a string.
///
/// Detects UTF-16LE by a byte order mark, or by NUL bytes in every odd
/// position of the leading characters. Anything else is decoded as lossy
/// UTF-8. Carriage returns are normalized away.
pub fn decode_console_output(bytes: &[u8]) -> String {
    let text = if is_utf16le(bytes) {
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };

    text.trim_start_matches('\u{feff}').replace('\r', "")
}

fn is_utf16le(bytes: &[u8]) -> bool {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return false;
    }

    if bytes.starts_with(&[0xff, 0xfe]) {
        return true;
    }

    bytes
        .chunks_exact(2)
        .take(8)
        .all(|pair| pair[0] != 0 && pair[1] == 0)
}

fn display_command(command: &Command) -> String {
    let mut line = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        line.push(' ');
        line.push_str(arg.to_string_lossy().as_ref());
    }

    line
}

/// External process invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Command could not be spawned at all.
    #[error("failed to run {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exited with failure status.
    #[error("command {command:?} failed with exit code {code:?}\n{message}")]
    Failed {
        command: String,
        code: Option<i32>,
        message: String,
    },
}

/// Friendly result alias :3
type Result<T, E = SyscallError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn decode_utf8_output() {
        assert_eq!(decode_console_output(b"NixOS\r\nUbuntu\r\n"), "NixOS\nUbuntu\n");
    }

    #[test]
    fn decode_utf16le_output() {
        let bytes = utf16le("NixOS\r\nUbuntu-22.04\r\n");
        assert_eq!(decode_console_output(&bytes), "NixOS\nUbuntu-22.04\n");
    }

    #[test]
    fn decode_utf16le_output_with_bom() {
        let mut bytes = vec![0xff, 0xfe];
        bytes.extend(utf16le("Default Version: 2"));
        assert_eq!(decode_console_output(&bytes), "Default Version: 2");
    }

    #[test]
    fn decode_empty_output() {
        assert_eq!(decode_console_output(b""), "");
    }

    #[test]
    fn captured_message_merges_streams() {
        let captured = Captured {
            code: Some(1),
            stdout: "partial\n".into(),
            stderr: "boom\n".into(),
        };

        assert!(!captured.success());
        assert_eq!(captured.message(), "stdout: partial\n\nstderr: boom");
    }

    #[cfg(unix)]
    #[test]
    fn non_interactive_reports_failure() {
        let result = syscall_non_interactive("sh", ["-c", "echo nope >&2; exit 3"]);
        match result {
            Err(SyscallError::Failed { code, message, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(message, "stderr: nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_fails_to_spawn() {
        let result = syscall_status("definitely-not-a-real-binary-nixwsl", ["--version"]);
        assert!(matches!(result, Err(SyscallError::Spawn { .. })));
    }
}
