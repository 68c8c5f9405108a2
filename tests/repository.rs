// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod common;

use common::RepoFixture;
use nixwsl::repo::{ConfigRepository, Git2Repository, RepoError, Update};

use anyhow::Result;
use pretty_assertions::assert_eq;

fn remote_with_flake(root: &std::path::Path) -> Result<RepoFixture> {
    let remote = RepoFixture::new(root.join("remote"))?;
    remote.stage_and_commit("flake.nix", "{ outputs = _: { }; }")?;
    Ok(remote)
}

#[test]
fn clone_checks_out_remote_branch() -> Result<()> {
    let root = tempfile::tempdir()?;
    let remote = remote_with_flake(root.path())?;
    let local_path = root.path().join("local");

    Git2Repository::new(false).clone_remote(&remote.url(), &local_path)?;

    let local = RepoFixture::open(&local_path)?;
    assert_eq!(local.head()?, remote.head()?);
    assert_eq!(
        std::fs::read_to_string(local_path.join("flake.nix"))?,
        "{ outputs = _: { }; }"
    );

    Ok(())
}

#[test]
fn fresh_clone_is_up_to_date() -> Result<()> {
    let root = tempfile::tempdir()?;
    let remote = remote_with_flake(root.path())?;
    let local_path = root.path().join("local");
    let repository = Git2Repository::new(false);

    repository.clone_remote(&remote.url(), &local_path)?;
    assert_eq!(repository.fast_forward(&local_path)?, Update::UpToDate);

    Ok(())
}

#[test]
fn fast_forward_moves_branch_and_working_tree() -> Result<()> {
    let root = tempfile::tempdir()?;
    let remote = remote_with_flake(root.path())?;
    let local_path = root.path().join("local");
    let repository = Git2Repository::new(false);
    repository.clone_remote(&remote.url(), &local_path)?;
    let before = remote.head()?;

    remote.stage_and_commit("home.nix", "{ ... }: { }")?;
    let update = repository.fast_forward(&local_path)?;

    assert_eq!(
        update,
        Update::FastForwarded {
            from: before,
            to: remote.head()?,
        }
    );
    assert_eq!(RepoFixture::open(&local_path)?.head()?, remote.head()?);
    assert!(local_path.join("home.nix").is_file());

    Ok(())
}

#[test]
fn local_commits_ahead_of_remote_are_kept() -> Result<()> {
    let root = tempfile::tempdir()?;
    let remote = remote_with_flake(root.path())?;
    let local_path = root.path().join("local");
    let repository = Git2Repository::new(false);
    repository.clone_remote(&remote.url(), &local_path)?;

    let local = RepoFixture::open(&local_path)?;
    local.stage_and_commit("local.nix", "{ }")?;
    let ahead = local.head()?;

    assert_eq!(repository.fast_forward(&local_path)?, Update::UpToDate);
    assert_eq!(local.head()?, ahead);

    Ok(())
}

#[test]
fn diverged_history_is_rejected() -> Result<()> {
    let root = tempfile::tempdir()?;
    let remote = remote_with_flake(root.path())?;
    let local_path = root.path().join("local");
    let repository = Git2Repository::new(false);
    repository.clone_remote(&remote.url(), &local_path)?;

    let local = RepoFixture::open(&local_path)?;
    local.stage_and_commit("local.nix", "{ }")?;
    remote.stage_and_commit("remote.nix", "{ }")?;
    let local_head = local.head()?;

    let result = repository.fast_forward(&local_path);

    assert!(matches!(
        result,
        Err(RepoError::Diverged { ref branch, .. }) if branch == "main"
    ));
    assert_eq!(local.head()?, local_head);

    Ok(())
}

#[test]
fn detached_head_is_rejected() -> Result<()> {
    let root = tempfile::tempdir()?;
    let remote = remote_with_flake(root.path())?;
    let local_path = root.path().join("local");
    let repository = Git2Repository::new(false);
    repository.clone_remote(&remote.url(), &local_path)?;

    let git = git2::Repository::open(&local_path)?;
    let head = git.head()?.peel_to_commit()?.id();
    git.set_head_detached(head)?;

    assert!(matches!(
        repository.fast_forward(&local_path),
        Err(RepoError::DetachedHead { .. })
    ));

    Ok(())
}
