// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Failure notification.
//!
//! Provisioning is usually started by double-clicking a shortcut, so the
//! console window closes as soon as the process exits. The default notifier
//! therefore holds the window open until the operator acknowledges the
//! failure.

use crate::provision::{error_chain, RunError};

use inquire::Text;
use tracing::debug;

/// Get told about fatal failure of a run before it stops.
pub trait FailureNotifier {
    /// Report fatal error described by `message` and wait until it was seen.
    fn acknowledge(&self, message: &str);

    /// Report failed step of a sequencer run.
    fn notify(&self, failure: &RunError) {
        self.acknowledge(&failure_message(failure));
    }
}

/// One line description of failed step.
pub fn failure_message(failure: &RunError) -> String {
    format!(
        "Setup failed at {}: {}",
        failure.step,
        error_chain(&failure.source)
    )
}

/// Wait for operator to press enter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PauseNotifier;

impl FailureNotifier for PauseNotifier {
    fn acknowledge(&self, message: &str) {
        let prompt = format!("{message}. Press enter to exit");
        if let Err(err) = Text::new(&prompt).prompt() {
            debug!("cannot wait for acknowledgment: {err}");
        }
    }
}

/// Do nothing, for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl FailureNotifier for SilentNotifier {
    fn acknowledge(&self, _: &str) {}
}
