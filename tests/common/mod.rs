// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

#![allow(dead_code)]

use nixwsl::{
    config::ProvisionConfig,
    fetch::{FetchError, HttpSource},
    guest::{GuestError, GuestShell, SystemBuilder},
    provision::Toolkit,
    repo::{ConfigRepository, RepoError, Update},
    wsl::{WindowsFeature, WslControl, WslError},
};

use anyhow::Result;
use git2::{IndexEntry, IndexTime, Repository, RepositoryInitOptions};
use std::{
    cell::RefCell,
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

/// Configuration confining every host path to scratch directory.
pub(crate) fn scratch_config(root: &Path) -> ProvisionConfig {
    let mut config = ProvisionConfig::default();
    config.install_root = root.join("NixOS");
    config.repository.url = "https://example.com/awkless/dotfiles.git".into();
    config.repository.local_dir = Some(root.join("dotfiles"));
    config.host.wslconfig = root.join(".wslconfig");
    config.download.backoff_secs = 0;
    config
}

/// Observable state of fake host, shared by all fake collaborators.
#[derive(Debug, Default)]
pub(crate) struct HostState {
    pub virtualization_disabled: bool,
    pub features: Vec<WindowsFeature>,
    pub runtime_installed: bool,
    pub registered: Vec<String>,
    pub download_failures: u32,
    pub download_attempts: u32,
    pub diverged: bool,
    pub guest_clone: bool,
    pub calls: Vec<String>,
}

/// Fake host recording every mutating call made against it.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeHost {
    state: Rc<RefCell<HostState>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_state(self, edit: impl FnOnce(&mut HostState)) -> Self {
        edit(&mut self.state.borrow_mut());
        self
    }

    pub(crate) fn toolkit(&self) -> Toolkit {
        Toolkit {
            http: Box::new(self.clone()),
            wsl: Box::new(self.clone()),
            repository: Box::new(self.clone()),
            guest: Box::new(self.clone()),
            builder: Box::new(self.clone()),
            sleep: |_| {},
        }
    }

    pub(crate) fn toolkit_with_repository(
        &self,
        repository: impl ConfigRepository + 'static,
    ) -> Toolkit {
        Toolkit {
            repository: Box::new(repository),
            ..self.toolkit()
        }
    }

    pub(crate) fn state(&self) -> std::cell::Ref<'_, HostState> {
        self.state.borrow()
    }

    pub(crate) fn edit(&self, edit: impl FnOnce(&mut HostState)) {
        edit(&mut self.state.borrow_mut());
    }

    /// Take calls recorded so far.
    pub(crate) fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().calls)
    }

    fn record(&self, call: impl Into<String>) {
        self.state.borrow_mut().calls.push(call.into());
    }
}

impl HttpSource for FakeHost {
    fn probe(&self, _: &str) -> Result<(), FetchError> {
        Ok(())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut state = self.state.borrow_mut();
        state.download_attempts += 1;
        state.calls.push(format!("download {url}"));

        if state.download_failures > 0 {
            state.download_failures -= 1;
            return Err(FetchError::Write {
                source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"),
                path: dest.to_path_buf(),
            });
        }

        std::fs::write(dest, b"rootfs").map_err(|source| FetchError::Write {
            source,
            path: dest.to_path_buf(),
        })?;
        Ok(6)
    }
}

impl WslControl for FakeHost {
    fn virtualization_enabled(&self) -> Result<bool, WslError> {
        Ok(!self.state.borrow().virtualization_disabled)
    }

    fn feature_enabled(&self, feature: WindowsFeature) -> Result<bool, WslError> {
        Ok(self.state.borrow().features.contains(&feature))
    }

    fn enable_feature(&self, feature: WindowsFeature) -> Result<(), WslError> {
        self.record(format!("enable-feature {feature}"));
        self.state.borrow_mut().features.push(feature);
        Ok(())
    }

    fn set_default_version(&self, version: u8) -> Result<(), WslError> {
        self.record(format!("set-default-version {version}"));
        Ok(())
    }

    fn runtime_installed(&self) -> Result<bool, WslError> {
        Ok(self.state.borrow().runtime_installed)
    }

    fn install_runtime(&self) -> Result<(), WslError> {
        self.record("install-runtime");
        self.state.borrow_mut().runtime_installed = true;
        Ok(())
    }

    fn registered_distributions(&self) -> Result<Vec<String>, WslError> {
        Ok(self.state.borrow().registered.clone())
    }

    fn unregister(&self, name: &str) -> Result<(), WslError> {
        self.record(format!("unregister {name}"));
        self.state
            .borrow_mut()
            .registered
            .retain(|registered| registered != name);
        Ok(())
    }

    fn import(&self, name: &str, _: &Path, image: &Path) -> Result<(), WslError> {
        assert!(image.is_file(), "image should be downloaded before import");
        self.record(format!("import {name}"));
        self.state.borrow_mut().registered.push(name.to_string());
        Ok(())
    }

    fn set_default(&self, name: &str) -> Result<(), WslError> {
        self.record(format!("set-default {name}"));
        Ok(())
    }

    fn shutdown(&self) -> Result<(), WslError> {
        self.record("shutdown");
        Ok(())
    }
}

impl ConfigRepository for FakeHost {
    fn clone_remote(&self, url: &str, path: &Path) -> Result<(), RepoError> {
        self.record(format!("clone {url}"));
        std::fs::create_dir_all(path).map_err(|err| git2::Error::from_str(&err.to_string()))?;
        Ok(())
    }

    fn fast_forward(&self, path: &Path) -> Result<Update, RepoError> {
        self.record("fast-forward");
        if self.state.borrow().diverged {
            return Err(RepoError::Diverged {
                path: path.to_path_buf(),
                branch: "main".into(),
            });
        }

        Ok(Update::UpToDate)
    }
}

impl GuestShell for FakeHost {
    fn run(&self, user: &str, script: &str) -> Result<String, GuestError> {
        self.record(format!("{user}$ {script}"));
        if script.contains("git clone") {
            self.state.borrow_mut().guest_clone = true;
        }
        Ok(String::new())
    }

    fn run_streaming(&self, user: &str, script: &str) -> Result<(), GuestError> {
        self.run(user, script).map(|_| ())
    }

    fn test(&self, _: &str, _: &str) -> Result<bool, GuestError> {
        Ok(self.state.borrow().guest_clone)
    }
}

impl SystemBuilder for FakeHost {
    fn rebuild(&self, source: &str, target: &str) -> Result<(), GuestError> {
        self.record(format!("rebuild {source}#{target}"));
        Ok(())
    }
}

pub(crate) struct RepoFixture {
    repo: Repository,
}

impl RepoFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;
        let fixture = Self { repo };
        fixture.set_identity()?;

        Ok(fixture)
    }

    pub(crate) fn open(path: impl AsRef<Path>) -> Result<Self> {
        let fixture = Self {
            repo: Repository::open(path.as_ref())?,
        };
        fixture.set_identity()?;

        Ok(fixture)
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.repo
            .workdir()
            .unwrap_or_else(|| self.repo.path())
            .to_path_buf()
    }

    pub(crate) fn url(&self) -> String {
        self.path().to_string_lossy().into_owned()
    }

    pub(crate) fn head(&self) -> Result<String> {
        Ok(self.repo.head()?.peel_to_commit()?.id().to_string())
    }

    fn set_identity(&self) -> Result<()> {
        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = self.repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(())
    }

    pub(crate) fn stage_and_commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<()> {
        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: contents.as_ref().len() as u32,
            id: self.repo.blob(contents.as_ref().as_bytes())?,
            flags: 0,
            flags_extended: 0,
            path: filename
                .as_ref()
                .as_os_str()
                .to_string_lossy()
                .into_owned()
                .into_bytes(),
        };

        // INVARIANT: Always use new tree produced by index after staging new entry.
        let mut index = self.repo.index()?;
        index.add_frombuffer(&entry, contents.as_ref().as_bytes())?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Some(parent) = self.repo.head().ok().and_then(|head| head.target()) {
            parents.push(self.repo.find_commit(parent)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            format!("chore: add {:?}", filename.as_ref()).as_ref(),
            &tree,
            &parents,
        )?;

        Ok(())
    }
}
