// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration repository synchronization.
//!
//! The configuration repository holds the declarative system configuration
//! applied to the guest. On the host it is either cloned fresh, or updated
//! in place when a previous run already cloned it.
//!
//! # Fast-Forward Only
//!
//! Updates never merge. The checked out branch is only moved forward if its
//! local history is a strict prefix of the remote's. Diverged local history
//! is reported as [`RepoError::Diverged`] so the operator can sort it out by
//! hand instead of having provisioning silently pick a side.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, FetchOptions, RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use inquire::{Password, Text};
use std::{
    path::{Path, PathBuf},
    time,
};
use tracing::{info, instrument};

/// Result of updating an existing clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Local branch already contains remote history.
    UpToDate,

    /// Local branch was moved forward to remote commit.
    FastForwarded { from: String, to: String },
}

/// Layer of indirection for configuration repository access.
pub trait ConfigRepository {
    /// Clone remote repository into path.
    fn clone_remote(&self, url: &str, path: &Path) -> Result<()>;

    /// Fast-forward checked out branch of existing clone to its remote.
    fn fast_forward(&self, path: &Path) -> Result<Update>;
}

/// Configuration repository access through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Repository {
    progress: bool,
}

impl Git2Repository {
    /// Construct new libgit2 repository access.
    ///
    /// Draws transfer progress bars if `progress` is set.
    pub fn new(progress: bool) -> Self {
        Self { progress }
    }

    fn progress_bar(&self, message: impl Into<String>) -> Result<ProgressBar> {
        let bar = ProgressBar::no_length();
        if !self.progress {
            bar.set_draw_target(ProgressDrawTarget::hidden());
            return Ok(bar);
        }

        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(message.into());
        bar.enable_steady_tick(time::Duration::from_millis(100));

        Ok(bar)
    }
}

impl ConfigRepository for Git2Repository {
    /// Clone remote repository into path.
    ///
    /// Progress is displayed through a progress bar. If the remote needs
    /// credentials, the user is prompted for them, blocking the progress bar
    /// for input.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    #[instrument(skip(self, path), level = "debug")]
    fn clone_remote(&self, url: &str, path: &Path) -> Result<()> {
        info!("clone {url} into {:?}", path.display());
        let bar = self.progress_bar(url)?;
        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = Config::open_default()?;

        let fo = fetch_options(&authenticator, &config, &bar);
        RepoBuilder::new().fetch_options(fo).clone(url, path)?;
        bar.finish_and_clear();

        Ok(())
    }

    /// Fast-forward checked out branch of existing clone to its remote.
    ///
    /// Fetches the checked out branch from "origin". The working tree is
    /// checked out safely before the branch reference moves, so local edits
    /// that would be overwritten abort the update.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::DetachedHead`] if no branch is checked out.
    /// - Return [`RepoError::Diverged`] if local history is not a prefix of
    ///   the remote's.
    /// - Return [`RepoError::Git2`] if libgit2 operations fail.
    #[instrument(skip(self, path), level = "debug")]
    fn fast_forward(&self, path: &Path) -> Result<Update> {
        let repository = Repository::open(path)?;
        let head = repository.head()?;
        if !head.is_branch() {
            return Err(RepoError::DetachedHead {
                path: path.to_path_buf(),
            });
        }
        let branch = head.shorthand().unwrap_or("HEAD").to_string();
        let local = head.peel_to_commit()?.id();

        info!("fetch {branch:?} for {:?}", path.display());
        let bar = self.progress_bar(format!("origin/{branch}"))?;
        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = Config::open_default()?;
        let mut fo = fetch_options(&authenticator, &config, &bar);
        repository
            .find_remote("origin")?
            .fetch(&[branch.as_str()], Some(&mut fo), None)?;
        bar.finish_and_clear();

        let fetch_head = repository.find_reference("FETCH_HEAD")?;
        let incoming = repository.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repository.merge_analysis(&[&incoming])?;

        if analysis.is_up_to_date() {
            info!("{:?} already up to date", path.display());
            return Ok(Update::UpToDate);
        }

        if !analysis.is_fast_forward() {
            return Err(RepoError::Diverged {
                path: path.to_path_buf(),
                branch,
            });
        }

        // INVARIANT: Update working tree first, then move the branch.
        let target = repository.find_object(incoming.id(), None)?;
        repository.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
        let refname = format!("refs/heads/{branch}");
        repository
            .find_reference(&refname)?
            .set_target(incoming.id(), "fast-forward")?;
        repository.set_head(&refname)?;

        info!("fast-forward {branch:?} from {local} to {}", incoming.id());
        Ok(Update::FastForwarded {
            from: local.to_string(),
            to: incoming.id().to_string(),
        })
    }
}

fn fetch_options<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
    bar: &'a ProgressBar,
) -> FetchOptions<'a> {
    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(config));
    rc.transfer_progress(move |progress| {
        let stats = progress.to_owned();
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            bar.set_length(stats.total_objects() as u64);
            bar.set_position(stats.received_objects() as u64);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    fo
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Configuration repository errors.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Local branch history cannot be fast-forwarded to remote.
    #[error("branch {branch:?} of {path:?} has diverged from its remote, refusing non fast-forward update")]
    Diverged { path: PathBuf, branch: String },

    /// No branch checked out to update.
    #[error("{path:?} has a detached HEAD, cannot determine branch to update")]
    DetachedHead { path: PathBuf },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = RepoError> = std::result::Result<T, E>;
