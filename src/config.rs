// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the provisioning configuration file to simplify the
//! process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! # Immutability
//!
//! A [`ProvisionConfig`] is constructed exactly once at startup, either from
//! a configuration file or from defaults, and then frozen. Every provisioning
//! step receives it through a shared borrow, so no step can alter the paths
//! or identifiers that later steps rely on.

use crate::retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Longest accepted download backoff base, one hour.
pub const MAX_BACKOFF_SECS: u64 = 3600;

/// Provisioning configuration layout.
///
/// Every field is optional in the configuration file. Missing fields fall
/// back to defaults that install the upstream NixOS-WSL image under
/// `~/NixOS`.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Host directory holding the image, the distribution disk, and logs.
    pub install_root: PathBuf,

    /// Name of the WSL distribution instance to register.
    pub distribution: String,

    /// Root filesystem image to download.
    pub image: ImageSettings,

    /// Download retry behaviour.
    pub download: DownloadSettings,

    /// Configuration repository to apply inside the guest.
    pub repository: RepositorySettings,

    /// Host-side settings.
    pub host: HostSettings,

    /// Guest-side settings.
    pub guest: GuestSettings,
}

impl ProvisionConfig {
    /// Check that the configuration can drive a full provisioning run.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Invalid`] if a required field is empty or out
    ///   of range.
    pub fn validate(&self) -> Result<()> {
        if self.repository.url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "repository.url",
                reason: "no configuration repository given".into(),
            });
        }

        if self.distribution.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "distribution",
                reason: "distribution name cannot be empty".into(),
            });
        }

        if self.download.attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "download.attempts",
                reason: "at least one download attempt is required".into(),
            });
        }

        if self.download.backoff_secs > MAX_BACKOFF_SECS {
            return Err(ConfigError::Invalid {
                field: "download.backoff_secs",
                reason: format!("backoff cannot exceed {MAX_BACKOFF_SECS} seconds"),
            });
        }

        if self.guest.build_target.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "guest.build_target",
                reason: "build target cannot be empty".into(),
            });
        }

        Ok(())
    }

    /// Release URL of the root filesystem image.
    pub fn image_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.image.base_url.trim_end_matches('/'),
            self.image.release,
            self.image.asset
        )
    }

    /// Local path the root filesystem image is downloaded to.
    pub fn image_path(&self) -> PathBuf {
        self.install_root.join(&self.image.asset)
    }

    /// Directory WSL stores the imported distribution's virtual disk in.
    pub fn distribution_dir(&self) -> PathBuf {
        self.install_root.join(&self.distribution)
    }

    /// Directory log files are written to.
    pub fn log_dir(&self) -> PathBuf {
        self.install_root.join("logs")
    }

    /// Name of configuration repository derived from its URL.
    ///
    /// Falls back to "dotfiles" if the URL has no usable final component.
    pub fn repository_name(&self) -> String {
        self.repository
            .url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .map(|name| name.trim_end_matches(".git"))
            .filter(|name| !name.is_empty())
            .unwrap_or("dotfiles")
            .to_string()
    }

    /// Host directory the configuration repository is cloned into.
    pub fn local_repository_dir(&self) -> PathBuf {
        match &self.repository.local_dir {
            Some(path) => path.clone(),
            None => self.install_root.join(self.repository_name()),
        }
    }

    /// Guest directory holding the guest-side clone of the configuration
    /// repository.
    pub fn guest_clone_dir(&self) -> String {
        match &self.guest.clone_dir {
            Some(path) => path.clone(),
            None => format!("/home/{}/{}", self.guest.user, self.repository_name()),
        }
    }

    /// Retry policy for the image download.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.download.attempts,
            Duration::from_secs(self.download.backoff_secs),
        )
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("~/NixOS"),
            distribution: "NixOS".into(),
            image: ImageSettings::default(),
            download: DownloadSettings::default(),
            repository: RepositorySettings::default(),
            host: HostSettings::default(),
            guest: GuestSettings::default(),
        }
    }
}

impl FromStr for ProvisionConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: ProvisionConfig =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every host path field.
        config.install_root = expand_path(&config.install_root)?;
        config.host.wslconfig = expand_path(&config.host.wslconfig)?;
        if let Some(path) = &config.repository.local_dir {
            config.repository.local_dir = Some(expand_path(path)?);
        }

        Ok(config)
    }
}

impl Display for ProvisionConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Root filesystem image settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Release tag to download the image from.
    pub release: String,

    /// File name of release asset.
    pub asset: String,

    /// Base URL that release tags are resolved against.
    pub base_url: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            release: "2505.7.0".into(),
            asset: "nixos.wsl".into(),
            base_url: "https://github.com/nix-community/NixOS-WSL/releases/download".into(),
        }
    }
}

/// Image download settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Maximum number of download attempts.
    pub attempts: u32,

    /// Base delay in seconds, multiplied by the failed attempt number.
    pub backoff_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_secs: 5,
        }
    }
}

/// Configuration repository settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Remote URL to clone configuration repository from.
    pub url: String,

    /// Host directory to clone into. Defaults to a directory named after the
    /// repository under the install root.
    pub local_dir: Option<PathBuf>,
}

/// Host-side settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostSettings {
    /// URL probed to validate network reachability.
    pub probe_url: String,

    /// Path to WSL's global configuration file.
    pub wslconfig: PathBuf,

    /// Guest kernel command line option injected into `.wslconfig`.
    pub kernel_command_line: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            probe_url: "https://github.com".into(),
            wslconfig: PathBuf::from("~/.wslconfig"),
            kernel_command_line: "cgroup_no_v1=all".into(),
        }
    }
}

/// Guest-side settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuestSettings {
    /// Login user of the guest.
    pub user: String,

    /// Default login password set for the guest user.
    pub password: String,

    /// Directory the declarative system configuration is materialized in.
    pub config_dir: String,

    /// Guest-side clone directory of configuration repository.
    pub clone_dir: Option<String>,

    /// Named build target passed to the declarative rebuild.
    pub build_target: String,
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            user: "nixos".into(),
            password: "nixos".into(),
            config_dir: "/etc/nixos".into(),
            clone_dir: None,
            build_target: "nixos".into(),
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();

    Ok(PathBuf::from(expanded))
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Configuration cannot drive a provisioning run.
    #[error("invalid configuration field {field:?}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
