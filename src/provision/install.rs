// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Complete install run, from configuration loading to last step.

use crate::{
    config::ProvisionConfig,
    logging::LogFile,
    provision::{FailureNotifier, Report, RunError, Sequencer, Step, Toolkit},
};

use anyhow::Result;
use tracing::{info, warn};

/// Load configuration, attach log file, build toolkit, then run full plan.
///
/// The log file is attached under the install root as soon as the
/// configuration is known. If it cannot be created, the run goes on with
/// console output only. On success, the last logged line is
/// "Setup complete.".
///
/// # Errors
///
/// - Return error of `load` if configuration cannot be loaded.
/// - Return error of `connect` if toolkit cannot be built.
/// - Return [`RunError`] if a step fails.
///
/// Every error is reported to `notifier` exactly once before returning.
pub fn install<L, C>(
    load: L,
    connect: C,
    log_file: &LogFile,
    notifier: &dyn FailureNotifier,
) -> Result<Report>
where
    L: FnOnce() -> Result<ProvisionConfig>,
    C: FnOnce(&ProvisionConfig) -> Result<Toolkit>,
{
    let result = prepare_and_run(load, connect, log_file, notifier);

    // INVARIANT: Sequencer already notified about its own failures.
    if let Err(error) = &result {
        if error.downcast_ref::<RunError>().is_none() {
            notifier.acknowledge(&format!("Setup failed: {error:#}"));
        }
    }

    result
}

fn prepare_and_run<L, C>(
    load: L,
    connect: C,
    log_file: &LogFile,
    notifier: &dyn FailureNotifier,
) -> Result<Report>
where
    L: FnOnce() -> Result<ProvisionConfig>,
    C: FnOnce(&ProvisionConfig) -> Result<Toolkit>,
{
    let config = load()?;

    match log_file.attach(&config.log_dir()) {
        Ok(path) => info!("log file: {:?}", path.display()),
        Err(err) => warn!(
            "cannot create log file in {:?}, logging to console only: {err}",
            config.log_dir().display()
        ),
    }

    let tools = connect(&config)?;
    let report = Sequencer::new(&config, &tools, notifier).run(&Step::plan())?;

    Ok(report)
}
