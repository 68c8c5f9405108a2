// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Install NixOS into WSL and apply a configuration repository to it.
//!
//! Provisioning runs a fixed, linear sequence of idempotent steps: validate
//! the host, enable the Windows features WSL needs, download the NixOS-WSL
//! root filesystem image, import it as a distribution, and rebuild the guest
//! declaratively from a configuration repository ("dotfiles").
//!
//! Re-running a provisioning that failed half way through is always safe.
//! Steps that would repeat destructive work check first whether their work
//! is already done.
//!
//! # See Also
//!
//! 1. [NixOS-WSL](https://github.com/nix-community/NixOS-WSL)
//! 2. [`provision`]

pub mod config;
pub mod fetch;
pub mod guest;
pub mod logging;
pub mod path;
pub mod provision;
pub mod repo;
pub mod retry;
pub mod syscall;
pub mod wsl;
pub mod wslconfig;
