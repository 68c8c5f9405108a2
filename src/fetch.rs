// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! HTTP access to remote resources.
//!
//! Provisioning needs two things from the network: confirmation that the
//! release host is reachable at all, and the root filesystem image itself.
//! Both are modeled by the [`HttpSource`] trait so the sequencer can be
//! driven without a network in tests.
//!
//! # Partial Downloads
//!
//! Images are streamed into a sibling `.part` file, and only renamed to the
//! final path once the whole body has been written. An interrupted download
//! therefore never leaves a file behind that the "already downloaded" check
//! would mistake for a complete image.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use reqwest::blocking::Client;
use std::{
    fs::{remove_file, rename, File},
    io::{copy, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument};

/// Layer of indirection for HTTP access.
pub trait HttpSource {
    /// Check that URL answers at all.
    fn probe(&self, url: &str) -> Result<()>;

    /// Download URL into destination file, returning number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// HTTP access through reqwest's blocking client.
#[derive(Debug, Clone)]
pub struct ReqwestSource {
    client: Client,
    progress: bool,
}

impl ReqwestSource {
    /// Construct new HTTP source.
    ///
    /// Draws a progress bar during downloads if `progress` is set.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Client`] if HTTP client cannot be built.
    pub fn new(progress: bool) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            // INVARIANT: Images are large, so only bound connection setup.
            .timeout(None)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self { client, progress })
    }

    fn progress_bar(&self, url: &str, length: Option<u64>) -> Result<ProgressBar> {
        let bar = match length {
            Some(length) => ProgressBar::new(length),
            None => ProgressBar::no_length(),
        };

        if !self.progress {
            bar.set_draw_target(ProgressDrawTarget::hidden());
            return Ok(bar);
        }

        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<30}  [{wide_bar:.yellow/blue}] {bytes}/{total_bytes}",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(file_name_of(url));

        Ok(bar)
    }
}

impl HttpSource for ReqwestSource {
    #[instrument(skip(self), level = "debug")]
    fn probe(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .head(url)
            .timeout(Duration::from_secs(15))
            .send()
            .map_err(|err| FetchError::Request {
                url: url.to_string(),
                source: err,
            })?;

        // INVARIANT: Any HTTP answer proves reachability, even an error status.
        debug!("{url} answered with {}", response.status());
        Ok(())
    }

    #[instrument(skip(self, dest), level = "debug")]
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        info!("download {url} to {:?}", dest.display());
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| FetchError::Request {
                url: url.to_string(),
                source: err,
            })?;

        let partial = partial_path(dest);
        let bar = self.progress_bar(url, response.content_length())?;
        let written = write_body(bar.wrap_read(response), &partial).inspect_err(|_| {
            let _ = remove_file(&partial);
        })?;
        bar.finish_and_clear();

        rename(&partial, dest).map_err(|err| FetchError::Write {
            source: err,
            path: dest.to_path_buf(),
        })?;

        info!("downloaded {written} bytes to {:?}", dest.display());
        Ok(written)
    }
}

fn write_body(mut body: impl std::io::Read, partial: &Path) -> Result<u64> {
    let file = File::create(partial).map_err(|err| FetchError::Write {
        source: err,
        path: partial.to_path_buf(),
    })?;

    let mut writer = BufWriter::new(file);
    let written = copy(&mut body, &mut writer).map_err(|err| FetchError::Write {
        source: err,
        path: partial.to_path_buf(),
    })?;
    writer.flush().map_err(|err| FetchError::Write {
        source: err,
        path: partial.to_path_buf(),
    })?;

    Ok(written)
}

/// Path of in-progress download for given destination.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn file_name_of(url: &str) -> String {
    url.rsplit('/')
        .next()
        .and_then(|name| name.split('?').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(url)
        .to_string()
}

/// HTTP access errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP client could not be constructed.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    /// Request failed or answered with error status.
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Response body could not be written to disk.
    #[error("failed to write download to {path:?}")]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),
}

/// Friendly result alias :3
type Result<T, E = FetchError> = std::result::Result<T, E>;
