// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Guest distribution access.
//!
//! Once the distribution is imported, everything else happens inside of it
//! through shell commands. The [`GuestShell`] trait runs a script as some
//! guest user and fails on non-zero exit, while the [`SystemBuilder`] trait
//! absorbs the declarative rebuild of the guest system. The script builders
//! in this module produce the exact command lines those collaborators run.
//!
//! # Host Paths
//!
//! WSL mounts every host drive below `/mnt/<drive letter>`, so a host path
//! like `C:\Users\me\dotfiles` is visible in the guest at
//! `/mnt/c/Users/me/dotfiles`. See [`wsl_mount_path`].

use crate::syscall::{syscall_interactive, syscall_status, SyscallError};

use tracing::{debug, instrument};

/// Layer of indirection for running commands inside the guest.
pub trait GuestShell {
    /// Run script as user, capturing its output.
    fn run(&self, user: &str, script: &str) -> Result<String>;

    /// Run script as user with output streamed to the terminal.
    fn run_streaming(&self, user: &str, script: &str) -> Result<()>;

    /// Run script as user, reporting whether it exited successfully.
    fn test(&self, user: &str, script: &str) -> Result<bool>;
}

/// Layer of indirection for declarative rebuilds of the guest system.
pub trait SystemBuilder {
    /// Rebuild and activate guest system from configuration source directory,
    /// selecting named build target.
    fn rebuild(&self, source: &str, target: &str) -> Result<()>;
}

/// Guest shell through `wsl.exe`.
#[derive(Debug, Clone)]
pub struct WslShell {
    distribution: String,
}

impl WslShell {
    /// Construct new guest shell for distribution.
    pub fn new(distribution: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
        }
    }

    fn args<'a>(&'a self, user: &'a str, script: &'a str) -> [&'a str; 8] {
        [
            "--distribution",
            self.distribution.as_str(),
            "--user",
            user,
            "--exec",
            "/bin/sh",
            "-lc",
            script,
        ]
    }
}

impl GuestShell for WslShell {
    #[instrument(skip(self, script), level = "debug")]
    fn run(&self, user: &str, script: &str) -> Result<String> {
        debug!("run in guest: {script}");
        let captured = syscall_status("wsl.exe", self.args(user, script))?;
        if !captured.success() {
            return Err(GuestError::Failed {
                script: script.to_string(),
                code: captured.code,
                message: captured.message(),
            });
        }

        Ok(captured.stdout)
    }

    #[instrument(skip(self, script), level = "debug")]
    fn run_streaming(&self, user: &str, script: &str) -> Result<()> {
        debug!("run in guest: {script}");
        syscall_interactive("wsl.exe", self.args(user, script)).map_err(|err| match err {
            SyscallError::Failed { code, message, .. } => GuestError::Failed {
                script: script.to_string(),
                code,
                message,
            },
            err => GuestError::Syscall(err),
        })
    }

    fn test(&self, user: &str, script: &str) -> Result<bool> {
        Ok(syscall_status("wsl.exe", self.args(user, script))?.success())
    }
}

/// Declarative rebuild through `nixos-rebuild`.
#[derive(Debug, Clone)]
pub struct NixosRebuild<S>
where
    S: GuestShell,
{
    shell: S,
}

impl<S> NixosRebuild<S>
where
    S: GuestShell,
{
    /// Construct new rebuilder issuing commands through guest shell.
    pub fn new(shell: S) -> Self {
        Self { shell }
    }
}

impl<S> SystemBuilder for NixosRebuild<S>
where
    S: GuestShell,
{
    fn rebuild(&self, source: &str, target: &str) -> Result<()> {
        self.shell.run_streaming("root", &rebuild_script(source, target))
    }
}

/// Quote string for safe use as one POSIX shell word.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Translate host path into path of WSL's drive mount.
///
/// Paths that are already absolute POSIX paths are assumed to be reachable
/// as is, and are returned unchanged.
///
/// # Errors
///
/// - Return [`GuestError::UntranslatablePath`] if path neither starts with
///   a drive letter nor is an absolute POSIX path.
pub fn wsl_mount_path(host_path: &str) -> Result<String> {
    if host_path.starts_with('/') {
        return Ok(host_path.to_string());
    }

    let path = host_path.strip_prefix(r"\\?\").unwrap_or(host_path);
    let mut chars = path.chars();
    let (Some(drive), Some(':')) = (chars.next(), chars.next()) else {
        return Err(GuestError::UntranslatablePath(host_path.to_string()));
    };
    if !drive.is_ascii_alphabetic() {
        return Err(GuestError::UntranslatablePath(host_path.to_string()));
    }

    let rest = chars
        .as_str()
        .split(['\\', '/'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    let mut mounted = format!("/mnt/{}", drive.to_ascii_lowercase());
    for part in rest {
        mounted.push('/');
        mounted.push_str(part);
    }

    Ok(mounted)
}

/// Script copying configuration source tree, minus Git metadata, into
/// destination directory.
pub fn materialize_script(source: &str, dest: &str) -> String {
    format!(
        "set -eu; (set -o pipefail) 2>/dev/null && set -o pipefail; \
         mkdir -p {dest}; tar -C {source} --exclude=.git -cf - . | tar -C {dest} -xf -",
        source = shell_quote(source),
        dest = shell_quote(dest),
    )
}

/// Script rebuilding and switching to the guest system from flake source.
pub fn rebuild_script(source: &str, target: &str) -> String {
    format!(
        "NIX_CONFIG='experimental-features = nix-command flakes' \
         nixos-rebuild switch --flake {}",
        shell_quote(&format!("{source}#{target}"))
    )
}

/// Script handing ownership of user's home directory back to user.
pub fn chown_home_script(user: &str) -> String {
    format!(
        "chown -R {owner} {home}",
        owner = shell_quote(&format!("{user}:users")),
        home = shell_quote(&format!("/home/{user}")),
    )
}

/// Script setting login password of user.
pub fn password_script(user: &str, password: &str) -> String {
    format!(
        "printf '%s\\n' {} | chpasswd",
        shell_quote(&format!("{user}:{password}"))
    )
}

/// Script removing stale per-user profile generations and garbage
/// collection roots left behind by the bootstrap rebuild.
pub fn cleanup_script(user: &str) -> String {
    let paths = [
        format!("/nix/var/nix/profiles/per-user/{user}"),
        format!("/nix/var/nix/gcroots/per-user/{user}"),
        format!("/home/{user}/.local/state/nix/profiles"),
        format!("/home/{user}/.nix-profile"),
    ];

    let quoted = paths
        .iter()
        .map(|path| shell_quote(path))
        .collect::<Vec<_>>()
        .join(" ");
    format!("rm -rf {quoted}")
}

/// Script replacing directory with fresh clone of repository.
pub fn clone_script(url: &str, dir: &str) -> String {
    format!(
        "rm -rf {dir} && git clone {url} {dir}",
        url = shell_quote(url),
        dir = shell_quote(dir),
    )
}

/// Script checking whether directory holds a Git clone.
pub fn is_clone_script(dir: &str) -> String {
    format!("test -d {}", shell_quote(&format!("{dir}/.git")))
}

/// Guest access errors.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    /// Guest command could not be started.
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    /// Guest script exited with failure status.
    #[error("guest command {script:?} failed with exit code {code:?}\n{message}")]
    Failed {
        script: String,
        code: Option<i32>,
        message: String,
    },

    /// Host path has no mount point inside the guest.
    #[error("host path {0:?} cannot be reached from inside WSL")]
    UntranslatablePath(String),
}

/// Friendly result alias :3
type Result<T, E = GuestError> = std::result::Result<T, E>;
