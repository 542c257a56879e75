use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, ValueEnum};

/// Label-driven supervisor for Docker containers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Validate the configuration and exit.
    #[arg(short, long)]
    pub test: bool,

    /// Path to the pid file.
    #[arg(short, long, default_value = "guerite.pid")]
    pub pid_file: PathBuf,

    /// Send a signal to the running guerite instance.
    #[arg(short, long)]
    pub signal: Option<Signal>,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum Signal {
    /// Trigger an immediate cycle.
    Trigger,
    /// Stop after the current cycle.
    Stop,
}

impl From<Signal> for nix::sys::signal::Signal {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Trigger => nix::sys::signal::Signal::SIGHUP,
            Signal::Stop => nix::sys::signal::Signal::SIGINT,
        }
    }
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
