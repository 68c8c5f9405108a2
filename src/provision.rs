// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Provisioning sequencer.
//!
//! Provisioning installs NixOS as a WSL distribution and applies the
//! configuration repository to it. It is a strictly linear chain of named
//! [`Step`]s, each one operating on some external system: the Windows
//! feature manager, the WSL control plane, an HTTP release host, the
//! configuration repository's remote, or a shell inside the guest.
//!
//! # Stage Lifecycle
//!
//! Every step moves through [`StageState::Pending`], then
//! [`StageState::Running`], and ends up either succeeded or failed. The first
//! failure is fatal for the whole run: no later step starts, and nothing that
//! already happened is rolled back. Re-running the sequence is the recovery
//! path, which is safe because every mutating step is either idempotent by
//! nature or guarded by a gate that checks whether its work is already done.
//!
//! # Retries
//!
//! Only the image download is retried, see [`crate::retry`]. Every other
//! failure is fatal on first occurrence.
//!
//! # Collaborators
//!
//! All external systems are reached through the trait objects of a
//! [`Toolkit`], so the sequencer can be driven headlessly with fakes in
//! tests. Failures are reported to a [`FailureNotifier`] before the run
//! stops, which lets the binary pause for operator acknowledgment. The same
//! notifier hears about errors raised before the first step, see
//! [`install`].

pub mod install;
pub mod notify;
pub mod step;

pub use install::install;
pub use notify::{failure_message, FailureNotifier, PauseNotifier, SilentNotifier};
pub use step::{BuildSource, Staging, Step};

use crate::{
    config::ProvisionConfig,
    fetch::{FetchError, HttpSource, ReqwestSource},
    guest::{GuestShell, NixosRebuild, SystemBuilder, WslShell},
    repo::{ConfigRepository, Git2Repository},
    wsl::{SystemWsl, WslControl},
};

use std::{error::Error as StdError, path::PathBuf, thread, time::Duration};
use tracing::{error, info, instrument};

/// Collaborators every step reaches external systems through.
pub struct Toolkit {
    /// Release host access.
    pub http: Box<dyn HttpSource>,

    /// Host WSL control plane.
    pub wsl: Box<dyn WslControl>,

    /// Host-side configuration repository access.
    pub repository: Box<dyn ConfigRepository>,

    /// Shell inside the guest.
    pub guest: Box<dyn GuestShell>,

    /// Declarative rebuild inside the guest.
    pub builder: Box<dyn SystemBuilder>,

    /// Wait between download attempts.
    pub sleep: fn(Duration),
}

impl Toolkit {
    /// Construct toolkit operating on the real host.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::Fetch`] if HTTP client cannot be built.
    pub fn system(config: &ProvisionConfig, progress: bool) -> Result<Self> {
        let shell = WslShell::new(&config.distribution);

        Ok(Self {
            http: Box::new(ReqwestSource::new(progress)?),
            wsl: Box::new(SystemWsl),
            repository: Box::new(Git2Repository::new(progress)),
            guest: Box::new(shell.clone()),
            builder: Box::new(NixosRebuild::new(shell)),
            sleep: thread::sleep,
        })
    }
}

/// Everything a step gets to work with.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a ProvisionConfig,
    pub tools: &'a Toolkit,
}

/// Successful outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Action was performed.
    Applied,

    /// Gate reported step as already satisfied, action was skipped.
    Skipped,
}

/// Lifecycle state of one stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Succeeded(StepOutcome),
    Failed,
}

/// Result of evaluating a step's gate without running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// Gate reports nothing to do.
    Satisfied,

    /// Gate reports action is needed.
    Pending,

    /// Step has no gate.
    AlwaysRuns,

    /// Gate could not be evaluated.
    Unknown(String),
}

/// Per stage record of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    stages: Vec<(Step, StageState)>,
}

impl Report {
    fn new(steps: &[Step]) -> Self {
        Self {
            stages: steps
                .iter()
                .map(|step| (*step, StageState::Pending))
                .collect(),
        }
    }

    fn set(&mut self, index: usize, state: StageState) {
        if let Some(stage) = self.stages.get_mut(index) {
            stage.1 = state;
        }
    }

    /// Every stage with its final state.
    pub fn stages(&self) -> &[(Step, StageState)] {
        &self.stages
    }

    /// Steps whose action was performed, in order.
    pub fn applied(&self) -> Vec<Step> {
        self.with_state(StageState::Succeeded(StepOutcome::Applied))
    }

    /// Steps skipped because their gate was satisfied, in order.
    pub fn skipped(&self) -> Vec<Step> {
        self.with_state(StageState::Succeeded(StepOutcome::Skipped))
    }

    /// Check if every stage succeeded.
    pub fn is_complete(&self) -> bool {
        self.stages
            .iter()
            .all(|(_, state)| matches!(state, StageState::Succeeded(_)))
    }

    fn with_state(&self, wanted: StageState) -> Vec<Step> {
        self.stages
            .iter()
            .filter(|(_, state)| *state == wanted)
            .map(|(step, _)| *step)
            .collect()
    }
}

/// Linear provisioning sequencer.
pub struct Sequencer<'a> {
    context: Context<'a>,
    notifier: &'a dyn FailureNotifier,
}

impl<'a> Sequencer<'a> {
    /// Construct new sequencer.
    pub fn new(
        config: &'a ProvisionConfig,
        tools: &'a Toolkit,
        notifier: &'a dyn FailureNotifier,
    ) -> Self {
        Self {
            context: Context { config, tools },
            notifier,
        }
    }

    /// Run steps in order, halting on first failure.
    ///
    /// Logs a summary followed by "Setup complete." once every step
    /// succeeded.
    ///
    /// # Errors
    ///
    /// - Return [`RunError`] naming failed step. The failure notifier has
    ///   already been told about it.
    #[instrument(skip(self, steps), level = "debug")]
    pub fn run(&self, steps: &[Step]) -> Result<Report, RunError> {
        let total = steps.len();
        let mut report = Report::new(steps);

        for (index, step) in steps.iter().enumerate() {
            info!("[{}/{total}] {step}", index + 1);
            report.set(index, StageState::Running);

            match step.run(&self.context) {
                Ok(StepOutcome::Skipped) => {
                    info!("{step}: already satisfied, skipping");
                    report.set(index, StageState::Succeeded(StepOutcome::Skipped));
                }
                Ok(StepOutcome::Applied) => {
                    info!("{step}: done");
                    report.set(index, StageState::Succeeded(StepOutcome::Applied));
                }
                Err(source) => {
                    error!("{step} failed: {}", error_chain(&source));
                    report.set(index, StageState::Failed);
                    let failure = RunError {
                        step: *step,
                        position: index + 1,
                        report,
                        source,
                    };
                    self.notifier.notify(&failure);
                    return Err(failure);
                }
            }
        }

        info!(
            "{} steps applied, {} already satisfied",
            report.applied().len(),
            report.skipped().len()
        );
        info!("Setup complete.");
        Ok(report)
    }

    /// Evaluate gate of every step without performing any action.
    pub fn status(&self, steps: &[Step]) -> Vec<(Step, GateStatus)> {
        steps
            .iter()
            .map(|step| {
                let status = if !step.is_gated() {
                    GateStatus::AlwaysRuns
                } else {
                    match step.is_satisfied(&self.context) {
                        Ok(true) => GateStatus::Satisfied,
                        Ok(false) => GateStatus::Pending,
                        Err(error) => GateStatus::Unknown(error_chain(&error)),
                    }
                };
                (*step, status)
            })
            .collect()
    }
}

/// Render error with all of its sources on one line.
pub fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(cause.to_string().as_str());
        source = cause.source();
    }

    message
}

/// Fatal failure of a provisioning run.
#[derive(Debug, thiserror::Error)]
#[error("step {position} ({step}) failed")]
pub struct RunError {
    /// Step that failed.
    pub step: Step,

    /// 1-based position of failed step in run.
    pub position: usize,

    /// Stage states at time of failure.
    pub report: Report,

    /// Cause of failure.
    #[source]
    pub source: ProvisionError,
}

/// Provisioning step errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Release host cannot be reached.
    #[error("cannot reach {url}")]
    Unreachable {
        url: String,
        #[source]
        source: FetchError,
    },

    /// Hardware virtualization is switched off in firmware.
    #[error("hardware virtualization is disabled in firmware, enable it in the UEFI/BIOS setup")]
    VirtualizationDisabled,

    /// Every image download attempt failed.
    #[error("download of {url} failed after {attempts} attempts")]
    DownloadExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// Host directory could not be created.
    #[error("failed to create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Wsl(#[from] crate::wsl::WslError),

    #[error(transparent)]
    WslConfig(#[from] crate::wslconfig::WslConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Repo(#[from] crate::repo::RepoError),

    #[error(transparent)]
    Guest(#[from] crate::guest::GuestError),
}

/// Friendly result alias :3
type Result<T, E = ProvisionError> = std::result::Result<T, E>;
