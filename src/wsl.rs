// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Host WSL control plane.
//!
//! All operating system feature management and distribution lifecycle calls
//! go through the [`WslControl`] trait. The provisioning sequencer only ever
//! needs to invoke one of these operations and observe whether it succeeded,
//! so the trait is kept small and object safe. [`SystemWsl`] implements it
//! on top of `dism.exe`, `powershell.exe`, and `wsl.exe`.

use crate::syscall::{syscall_non_interactive, syscall_status, SyscallError};

use std::{
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
};
use tracing::{debug, info, instrument, warn};

/// Optional Windows features WSL depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowsFeature {
    /// The Windows Subsystem for Linux itself.
    SubsystemLinux,

    /// Hypervisor platform backing WSL 2 virtual machines.
    VirtualMachinePlatform,
}

impl WindowsFeature {
    /// Feature name as understood by DISM.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubsystemLinux => "Microsoft-Windows-Subsystem-Linux",
            Self::VirtualMachinePlatform => "VirtualMachinePlatform",
        }
    }
}

impl Display for WindowsFeature {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.name())
    }
}

/// Layer of indirection for the host's WSL control plane.
pub trait WslControl {
    /// Check if hardware virtualization is enabled in firmware.
    fn virtualization_enabled(&self) -> Result<bool>;

    /// Check if optional Windows feature is enabled.
    fn feature_enabled(&self, feature: WindowsFeature) -> Result<bool>;

    /// Enable optional Windows feature.
    fn enable_feature(&self, feature: WindowsFeature) -> Result<()>;

    /// Set default WSL version for new distributions.
    fn set_default_version(&self, version: u8) -> Result<()>;

    /// Check if WSL runtime itself is installed.
    fn runtime_installed(&self) -> Result<bool>;

    /// Install WSL runtime without any distribution.
    fn install_runtime(&self) -> Result<()>;

    /// List names of registered distributions.
    fn registered_distributions(&self) -> Result<Vec<String>>;

    /// Unregister distribution, deleting its disk.
    fn unregister(&self, name: &str) -> Result<()>;

    /// Import root filesystem image as new distribution.
    fn import(&self, name: &str, install_dir: &Path, image: &Path) -> Result<()>;

    /// Mark distribution as default.
    fn set_default(&self, name: &str) -> Result<()>;

    /// Shut down WSL virtual machine and every running distribution.
    fn shutdown(&self) -> Result<()>;

    /// Check if distribution is registered.
    ///
    /// Distribution names are compared case-insensitively, matching how WSL
    /// itself treats them.
    fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self
            .registered_distributions()?
            .iter()
            .any(|registered| registered.eq_ignore_ascii_case(name)))
    }
}

/// WSL control through host binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWsl;

const WSL: &str = "wsl.exe";
const DISM: &str = "dism.exe";
const POWERSHELL: &str = "powershell.exe";

/// Exit code DISM returns when a change needs a reboot to take effect.
const DISM_REBOOT_REQUIRED: i32 = 3010;

const VIRTUALIZATION_QUERY: &str = "if ((Get-CimInstance Win32_ComputerSystem).HypervisorPresent) \
    { 'True' } else { (Get-CimInstance Win32_Processor | Select-Object -First 1).VirtualizationFirmwareEnabled }";

impl WslControl for SystemWsl {
    #[instrument(skip(self), level = "debug")]
    fn virtualization_enabled(&self) -> Result<bool> {
        let output =
            syscall_non_interactive(POWERSHELL, ["-NoProfile", "-Command", VIRTUALIZATION_QUERY])?;
        parse_powershell_bool(&output)
    }

    #[instrument(skip(self), level = "debug")]
    fn feature_enabled(&self, feature: WindowsFeature) -> Result<bool> {
        let output = syscall_non_interactive(
            DISM,
            [
                "/online",
                "/get-featureinfo",
                format!("/featurename:{}", feature.name()).as_str(),
            ],
        )?;

        let state = parse_feature_state(&output).ok_or_else(|| WslError::UnexpectedOutput {
            query: format!("state of feature {feature}"),
            output: output.clone(),
        })?;
        debug!("feature {feature} is in state {state:?}");

        Ok(state.is_satisfied())
    }

    #[instrument(skip(self), level = "debug")]
    fn enable_feature(&self, feature: WindowsFeature) -> Result<()> {
        info!("enable Windows feature {feature}");
        let captured = syscall_status(
            DISM,
            [
                "/online",
                "/enable-feature",
                format!("/featurename:{}", feature.name()).as_str(),
                "/all",
                "/norestart",
            ],
        )?;

        match captured.code {
            Some(0) => Ok(()),
            Some(DISM_REBOOT_REQUIRED) => {
                warn!("feature {feature} enabled, but Windows must be restarted for it to take effect");
                Ok(())
            }
            code => Err(WslError::Syscall(SyscallError::Failed {
                command: format!("{DISM} /enable-feature {feature}"),
                code,
                message: captured.message(),
            })),
        }
    }

    fn set_default_version(&self, version: u8) -> Result<()> {
        info!("set default WSL version to {version}");
        syscall_non_interactive(WSL, ["--set-default-version", version.to_string().as_str()])?;
        Ok(())
    }

    fn runtime_installed(&self) -> Result<bool> {
        match syscall_status(WSL, ["--version"]) {
            Ok(captured) => Ok(captured.success()),
            Err(SyscallError::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn install_runtime(&self) -> Result<()> {
        info!("install WSL runtime");
        syscall_non_interactive(WSL, ["--install", "--no-distribution"])?;
        Ok(())
    }

    fn registered_distributions(&self) -> Result<Vec<String>> {
        let captured = syscall_status(WSL, ["--list", "--quiet"])?;

        // INVARIANT: WSL exits non-zero when nothing is registered yet.
        if !captured.success() {
            debug!("no distributions listed: {}", captured.message());
            return Ok(Vec::new());
        }

        Ok(parse_distribution_list(&captured.stdout))
    }

    fn unregister(&self, name: &str) -> Result<()> {
        info!("unregister distribution {name:?}");
        syscall_non_interactive(WSL, ["--unregister", name])?;
        Ok(())
    }

    fn import(&self, name: &str, install_dir: &Path, image: &Path) -> Result<()> {
        info!(
            "import {:?} as distribution {name:?} into {:?}",
            image.display(),
            install_dir.display()
        );
        syscall_non_interactive(
            WSL,
            [
                OsStr::new("--import"),
                OsStr::new(name),
                install_dir.as_os_str(),
                image.as_os_str(),
                OsStr::new("--version"),
                OsStr::new("2"),
            ],
        )?;
        Ok(())
    }

    fn set_default(&self, name: &str) -> Result<()> {
        info!("set default distribution to {name:?}");
        syscall_non_interactive(WSL, ["--set-default", name])?;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        info!("shut down WSL");
        syscall_non_interactive(WSL, ["--shutdown"])?;
        Ok(())
    }
}

/// State of an optional Windows feature as reported by DISM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureState {
    Enabled,
    EnablePending,
    Disabled,
    DisablePending,
    Other(String),
}

impl FeatureState {
    /// Check if state means nothing more has to be done to enable feature.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Enabled | Self::EnablePending)
    }
}

/// Extract feature state from `dism /get-featureinfo` output.
pub fn parse_feature_state(output: &str) -> Option<FeatureState> {
    let value = output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "State").then(|| value.trim().to_string())
    })?;

    let state = match value.to_ascii_lowercase().as_str() {
        "enabled" => FeatureState::Enabled,
        "enable pending" => FeatureState::EnablePending,
        "disabled" => FeatureState::Disabled,
        "disable pending" => FeatureState::DisablePending,
        _ => FeatureState::Other(value),
    };

    Some(state)
}

/// Extract distribution names from `wsl --list --quiet` output.
pub fn parse_distribution_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_powershell_bool(output: &str) -> Result<bool> {
    match output.trim() {
        value if value.eq_ignore_ascii_case("true") => Ok(true),
        value if value.eq_ignore_ascii_case("false") => Ok(false),
        value => Err(WslError::UnexpectedOutput {
            query: "firmware virtualization".into(),
            output: value.to_string(),
        }),
    }
}

/// WSL control plane errors.
#[derive(Debug, thiserror::Error)]
pub enum WslError {
    /// Host binary failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    /// Host binary produced output that could not be understood.
    #[error("unexpected output while querying {query}: {output:?}")]
    UnexpectedOutput { query: String, output: String },
}

/// Friendly result alias :3
type Result<T, E = WslError> = std::result::Result<T, E>;
