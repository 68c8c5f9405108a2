// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Provisioning steps.
//!
//! Each [`Step`] names exactly one operation against an external system. A
//! gated step first asks the external system whether the operation is
//! already satisfied, and skips the operation if it is. The gate can be
//! evaluated on its own through [`Step::is_satisfied`] without performing
//! the operation.

use crate::{
    guest::{
        chown_home_script, cleanup_script, clone_script, is_clone_script, materialize_script,
        password_script, wsl_mount_path,
    },
    provision::{Context, ProvisionError, StepOutcome},
    wsl::WindowsFeature,
    wslconfig::WslConfigDrafter,
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
};
use tracing::{info, instrument};

/// Source tree copied into the guest's system configuration directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    /// Host-side clone, reached through WSL's drive mount.
    HostClone,

    /// Guest-side clone in the guest user's home directory.
    GuestClone,
}

/// Configuration source a declarative rebuild is performed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSource {
    /// Guest's system configuration directory.
    ConfigDir,

    /// Guest-side clone in the guest user's home directory.
    GuestClone,
}

/// Named provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Validate network reachability of release host.
    CheckNetwork,

    /// Validate hardware virtualization is enabled in firmware.
    CheckVirtualization,

    /// Ensure optional Windows feature is enabled.
    EnableFeature(WindowsFeature),

    /// Make WSL 2 the default for new distributions.
    SetDefaultVersion,

    /// Inject required kernel command line option into `.wslconfig`.
    PatchWslConfig,

    /// Ensure WSL runtime is installed.
    InstallWslRuntime,

    /// Remove previous distribution of same name.
    UnregisterDistribution,

    /// Download root filesystem image.
    DownloadImage,

    /// Clone or fast-forward host-side configuration repository.
    SyncConfigRepository,

    /// Import root filesystem image as distribution.
    ImportDistribution,

    /// Mark distribution as default.
    SetDefaultDistribution,

    /// Copy configuration into guest's system configuration directory.
    Materialize(Staging),

    /// Rebuild guest system declaratively.
    Rebuild(BuildSource),

    /// Shut down WSL to restart guest's init system.
    ShutdownWsl,

    /// Hand ownership of guest user's home back to guest user.
    FixHomeOwnership,

    /// Set default login password of guest user.
    SetPassword,

    /// Delete stale profile generations and garbage collection roots.
    RemoveStaleState,

    /// Clone configuration repository inside guest.
    CloneGuestRepository,

    /// Replace guest-side clone with fresh clone.
    ReplaceGuestRepository,
}

impl Step {
    /// Full provisioning plan in required order.
    ///
    /// Configuration is applied in three phases: a bootstrap rebuild from
    /// the host-side clone, a rebuild from the guest-side clone, and a final
    /// rebuild straight from a fresh guest-side clone.
    pub fn plan() -> Vec<Step> {
        vec![
            Step::CheckNetwork,
            Step::CheckVirtualization,
            Step::EnableFeature(WindowsFeature::SubsystemLinux),
            Step::EnableFeature(WindowsFeature::VirtualMachinePlatform),
            Step::SetDefaultVersion,
            Step::PatchWslConfig,
            Step::InstallWslRuntime,
            Step::UnregisterDistribution,
            Step::DownloadImage,
            Step::SyncConfigRepository,
            Step::ImportDistribution,
            Step::SetDefaultDistribution,
            Step::Materialize(Staging::HostClone),
            Step::Rebuild(BuildSource::ConfigDir),
            Step::ShutdownWsl,
            Step::FixHomeOwnership,
            Step::SetPassword,
            Step::RemoveStaleState,
            Step::CloneGuestRepository,
            Step::Materialize(Staging::GuestClone),
            Step::Rebuild(BuildSource::ConfigDir),
            Step::ReplaceGuestRepository,
            Step::Rebuild(BuildSource::GuestClone),
        ]
    }

    /// Check if step has an idempotence gate.
    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            Step::EnableFeature(_)
                | Step::PatchWslConfig
                | Step::InstallWslRuntime
                | Step::UnregisterDistribution
                | Step::DownloadImage
                | Step::CloneGuestRepository
        )
    }

    /// Query external state to check if step is already satisfied.
    ///
    /// Ungated steps are never satisfied. Performs no mutating action.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError`] if external state cannot be queried.
    pub fn is_satisfied(&self, ctx: &Context<'_>) -> Result<bool, ProvisionError> {
        let config = ctx.config;
        let tools = ctx.tools;

        let satisfied = match self {
            Step::EnableFeature(feature) => tools.wsl.feature_enabled(*feature)?,
            Step::PatchWslConfig => WslConfigDrafter::new(&config.host.wslconfig)
                .is_patched(&config.host.kernel_command_line)?,
            Step::InstallWslRuntime => tools.wsl.runtime_installed()?,
            Step::UnregisterDistribution => !tools.wsl.is_registered(&config.distribution)?,
            Step::DownloadImage => config.image_path().is_file(),
            Step::CloneGuestRepository => tools
                .guest
                .test(&config.guest.user, &is_clone_script(&config.guest_clone_dir()))?,
            _ => false,
        };

        Ok(satisfied)
    }

    /// Run step, skipping its action if its gate is already satisfied.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError`] if gate query or action fails.
    pub fn run(&self, ctx: &Context<'_>) -> Result<StepOutcome, ProvisionError> {
        if self.is_gated() && self.is_satisfied(ctx)? {
            return Ok(StepOutcome::Skipped);
        }

        self.apply(ctx)?;
        Ok(StepOutcome::Applied)
    }

    /// Perform step's action unconditionally.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError`] if action fails.
    #[instrument(skip(ctx), level = "debug")]
    pub fn apply(&self, ctx: &Context<'_>) -> Result<(), ProvisionError> {
        let config = ctx.config;
        let tools = ctx.tools;
        let user = config.guest.user.as_str();

        match self {
            Step::CheckNetwork => {
                let url = config.host.probe_url.as_str();
                tools
                    .http
                    .probe(url)
                    .map_err(|source| ProvisionError::Unreachable {
                        url: url.to_string(),
                        source,
                    })?;
            }
            Step::CheckVirtualization => {
                if !tools.wsl.virtualization_enabled()? {
                    return Err(ProvisionError::VirtualizationDisabled);
                }
            }
            Step::EnableFeature(feature) => tools.wsl.enable_feature(*feature)?,
            Step::SetDefaultVersion => tools.wsl.set_default_version(2)?,
            Step::PatchWslConfig => {
                WslConfigDrafter::new(&config.host.wslconfig)
                    .patch(&config.host.kernel_command_line)?;
            }
            Step::InstallWslRuntime => tools.wsl.install_runtime()?,
            Step::UnregisterDistribution => tools.wsl.unregister(&config.distribution)?,
            Step::DownloadImage => download_image(ctx)?,
            Step::SyncConfigRepository => sync_config_repository(ctx)?,
            Step::ImportDistribution => {
                let install_dir = config.distribution_dir();
                create_dir(&install_dir)?;
                tools
                    .wsl
                    .import(&config.distribution, &install_dir, &config.image_path())?;
            }
            Step::SetDefaultDistribution => tools.wsl.set_default(&config.distribution)?,
            Step::Materialize(staging) => {
                let source = match staging {
                    Staging::HostClone => wsl_mount_path(
                        config.local_repository_dir().to_string_lossy().as_ref(),
                    )?,
                    Staging::GuestClone => config.guest_clone_dir(),
                };
                tools
                    .guest
                    .run("root", &materialize_script(&source, &config.guest.config_dir))?;
            }
            Step::Rebuild(source) => {
                let source = match source {
                    BuildSource::ConfigDir => config.guest.config_dir.clone(),
                    BuildSource::GuestClone => config.guest_clone_dir(),
                };
                tools.builder.rebuild(&source, &config.guest.build_target)?;
            }
            Step::ShutdownWsl => tools.wsl.shutdown()?,
            Step::FixHomeOwnership => {
                tools.guest.run("root", &chown_home_script(user))?;
            }
            Step::SetPassword => {
                tools
                    .guest
                    .run("root", &password_script(user, &config.guest.password))?;
            }
            Step::RemoveStaleState => {
                tools.guest.run("root", &cleanup_script(user))?;
            }
            Step::CloneGuestRepository | Step::ReplaceGuestRepository => {
                tools.guest.run(
                    user,
                    &clone_script(&config.repository.url, &config.guest_clone_dir()),
                )?;
            }
        }

        Ok(())
    }
}

impl Display for Step {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Step::CheckNetwork => fmt.write_str("check-network"),
            Step::CheckVirtualization => fmt.write_str("check-virtualization"),
            Step::EnableFeature(feature) => write!(fmt, "enable-feature {feature}"),
            Step::SetDefaultVersion => fmt.write_str("set-default-version"),
            Step::PatchWslConfig => fmt.write_str("patch-wslconfig"),
            Step::InstallWslRuntime => fmt.write_str("install-wsl-runtime"),
            Step::UnregisterDistribution => fmt.write_str("unregister-distribution"),
            Step::DownloadImage => fmt.write_str("download-image"),
            Step::SyncConfigRepository => fmt.write_str("sync-config-repository"),
            Step::ImportDistribution => fmt.write_str("import-distribution"),
            Step::SetDefaultDistribution => fmt.write_str("set-default-distribution"),
            Step::Materialize(Staging::HostClone) => fmt.write_str("materialize host-clone"),
            Step::Materialize(Staging::GuestClone) => fmt.write_str("materialize guest-clone"),
            Step::Rebuild(BuildSource::ConfigDir) => fmt.write_str("rebuild config-dir"),
            Step::Rebuild(BuildSource::GuestClone) => fmt.write_str("rebuild guest-clone"),
            Step::ShutdownWsl => fmt.write_str("shutdown-wsl"),
            Step::FixHomeOwnership => fmt.write_str("fix-home-ownership"),
            Step::SetPassword => fmt.write_str("set-password"),
            Step::RemoveStaleState => fmt.write_str("remove-stale-state"),
            Step::CloneGuestRepository => fmt.write_str("clone-guest-repository"),
            Step::ReplaceGuestRepository => fmt.write_str("replace-guest-repository"),
        }
    }
}

fn download_image(ctx: &Context<'_>) -> Result<(), ProvisionError> {
    let config = ctx.config;
    let url = config.image_url();
    let dest = config.image_path();
    create_dir(&config.install_root)?;

    let policy = config.retry_policy();
    policy
        .run(
            |attempt| {
                info!("download attempt {attempt}/{}", policy.attempts());
                ctx.tools.http.download(&url, &dest)
            },
            ctx.tools.sleep,
        )
        .map_err(|exhausted| ProvisionError::DownloadExhausted {
            url: url.clone(),
            attempts: exhausted.attempts,
            source: exhausted.last,
        })?;

    Ok(())
}

fn sync_config_repository(ctx: &Context<'_>) -> Result<(), ProvisionError> {
    let config = ctx.config;
    let path = config.local_repository_dir();

    if path.exists() {
        let update = ctx.tools.repository.fast_forward(&path)?;
        info!("{:?}: {update:?}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    ctx.tools
        .repository
        .clone_remote(&config.repository.url, &path)?;

    Ok(())
}

fn create_dir(path: &Path) -> Result<(), ProvisionError> {
    mkdirp::mkdirp(path).map_err(|source| ProvisionError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plan_keeps_required_order() {
        let names = Step::plan().iter().map(ToString::to_string).collect::<Vec<_>>();

        assert_eq!(
            names,
            vec![
                "check-network",
                "check-virtualization",
                "enable-feature Microsoft-Windows-Subsystem-Linux",
                "enable-feature VirtualMachinePlatform",
                "set-default-version",
                "patch-wslconfig",
                "install-wsl-runtime",
                "unregister-distribution",
                "download-image",
                "sync-config-repository",
                "import-distribution",
                "set-default-distribution",
                "materialize host-clone",
                "rebuild config-dir",
                "shutdown-wsl",
                "fix-home-ownership",
                "set-password",
                "remove-stale-state",
                "clone-guest-repository",
                "materialize guest-clone",
                "rebuild config-dir",
                "replace-guest-repository",
                "rebuild guest-clone",
            ]
        );
    }

    #[test]
    fn gates_cover_idempotent_steps_only() {
        let gated = Step::plan()
            .into_iter()
            .filter(Step::is_gated)
            .map(|step| step.to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            gated,
            vec![
                "enable-feature Microsoft-Windows-Subsystem-Linux",
                "enable-feature VirtualMachinePlatform",
                "patch-wslconfig",
                "install-wsl-runtime",
                "unregister-distribution",
                "download-image",
                "clone-guest-repository",
            ]
        );
    }

    #[test]
    fn configuration_is_rebuilt_three_times() {
        let rebuilds = Step::plan()
            .into_iter()
            .filter(|step| matches!(step, Step::Rebuild(_)))
            .count();
        let materializations = Step::plan()
            .into_iter()
            .filter(|step| matches!(step, Step::Materialize(_)))
            .count();

        assert_eq!(rebuilds, 3);
        assert_eq!(materializations, 2);
    }
}
