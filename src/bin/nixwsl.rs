// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use nixwsl::{
    config::ProvisionConfig,
    logging::{self, LogFile},
    path::default_config_file,
    provision::{
        install, FailureNotifier, GateStatus, PauseNotifier, Sequencer, SilentNotifier, Step,
        Toolkit,
    },
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    fs::{read_to_string, write},
    io::ErrorKind,
    path::PathBuf,
    process::exit,
};
use tracing::{error, info};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "nixwsl [options] <nixwsl-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self, log_file: &LogFile) -> Result<()> {
        match self.command {
            Command::Install(opts) => run_install(opts, log_file),
            Command::Status(opts) => run_status(opts),
            Command::Init(opts) => run_init(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Install NixOS into WSL and apply configuration repository.
    #[command(override_usage = "nixwsl install [options]")]
    Install(InstallOptions),

    /// Show which provisioning steps are already satisfied.
    #[command(override_usage = "nixwsl status [options]")]
    Status(StatusOptions),

    /// Write default configuration file.
    #[command(override_usage = "nixwsl init [options]")]
    Init(InitOptions),
}

#[derive(Args, Clone, Debug)]
struct ConfigOptions {
    /// Path to configuration file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// URL of configuration repository to apply.
    #[arg(short, long, value_name = "url")]
    pub repo: Option<String>,

    /// Build target to rebuild guest system with.
    #[arg(short, long, value_name = "target")]
    pub target: Option<String>,

    /// NixOS-WSL release tag to download image from.
    #[arg(long, value_name = "tag")]
    pub release: Option<String>,

    /// Name of distribution to register.
    #[arg(short, long, value_name = "name")]
    pub distribution: Option<String>,
}

impl ConfigOptions {
    /// Load configuration file, apply command line overrides, and freeze it.
    fn load(self) -> Result<ProvisionConfig> {
        let path = match self.config {
            Some(path) => path,
            None => default_config_file()?,
        };

        let mut config: ProvisionConfig = match read_to_string(&path) {
            Ok(data) => data
                .parse()
                .with_context(|| format!("invalid configuration file {:?}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no configuration at {:?}, using defaults", path.display());
                "".parse()?
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot read configuration file {:?}", path.display()))
            }
        };

        if let Some(url) = self.repo {
            config.repository.url = url;
        }
        if let Some(target) = self.target {
            config.guest.build_target = target;
        }
        if let Some(release) = self.release {
            config.image.release = release;
        }
        if let Some(distribution) = self.distribution {
            config.distribution = distribution;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InstallOptions {
    #[command(flatten)]
    pub config: ConfigOptions,

    /// Exit right away on failure instead of waiting for acknowledgment.
    #[arg(long)]
    pub no_pause: bool,

    /// Do not draw progress bars.
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    #[command(flatten)]
    pub config: ConfigOptions,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Path to write configuration file to.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// URL of configuration repository to apply.
    #[arg(short, long, value_name = "url")]
    pub repo: Option<String>,

    /// Overwrite existing configuration file.
    #[arg(short, long)]
    pub force: bool,
}

fn main() {
    let log_file = LogFile::new();
    logging::init(&log_file);

    if let Err(error) = run(&log_file) {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run(log_file: &LogFile) -> Result<()> {
    Cli::parse().run(log_file)
}

fn run_install(opts: InstallOptions, log_file: &LogFile) -> Result<()> {
    let InstallOptions {
        config,
        no_pause,
        quiet,
    } = opts;
    let notifier: &dyn FailureNotifier = if no_pause {
        &SilentNotifier
    } else {
        &PauseNotifier
    };

    install(
        move || config.load(),
        |config| Ok(Toolkit::system(config, !quiet)?),
        log_file,
        notifier,
    )?;

    Ok(())
}

fn run_status(opts: StatusOptions) -> Result<()> {
    let config = opts.config.load()?;
    let tools = Toolkit::system(&config, false)?;
    let sequencer = Sequencer::new(&config, &tools, &SilentNotifier);

    for (position, (step, status)) in sequencer.status(&Step::plan()).into_iter().enumerate() {
        let status = match status {
            GateStatus::Satisfied => "satisfied".to_string(),
            GateStatus::Pending => "pending".to_string(),
            GateStatus::AlwaysRuns => "always runs".to_string(),
            GateStatus::Unknown(reason) => format!("unknown ({reason})"),
        };
        info!("{:>2}. {step:<50} {status}", position + 1);
    }

    Ok(())
}

fn run_init(opts: InitOptions) -> Result<()> {
    let path = match opts.config {
        Some(path) => path,
        None => default_config_file()?,
    };

    if path.exists() && !opts.force {
        bail!(
            "configuration file {:?} already exists, use --force to overwrite it",
            path.display()
        );
    }

    let mut config = ProvisionConfig::default();
    config.repository.url = match opts.repo {
        Some(url) => url,
        None => "<put url to configuration repository here>".into(),
    };

    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent)
            .with_context(|| format!("cannot create directory {:?}", parent.display()))?;
    }
    write(&path, config.to_string())
        .with_context(|| format!("cannot write configuration file {:?}", path.display()))?;
    info!("wrote configuration file {:?}", path.display());

    Ok(())
}
