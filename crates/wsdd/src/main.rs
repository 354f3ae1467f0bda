// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! wsdd daemon entry point.
//!
//! Parses the command line, merges the optional TOML configuration file,
//! builds the immutable configuration snapshot and runs serve cycles until
//! termination. SIGHUP ends the current cycle with a graceful Bye and
//! starts a fresh one from a re-read configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use wsdd::config::{AddressFamily, Config, FileConfig, Options};
use wsdd::runtime::{self, DaemonStatus, RunOutcome};
use wsdd::{logging, VERSION};

/// WS-Discovery responder - make this host visible in Windows Network browsing
#[derive(Parser, Debug)]
#[command(name = "wsdd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve only on this interface (repeatable)
    #[arg(short, long = "interface")]
    interface: Vec<String>,

    /// Serve IPv4 addresses only
    #[arg(short = '4', long, conflicts_with = "ipv6only")]
    ipv4only: bool,

    /// Serve IPv6 addresses only
    #[arg(short = '6', long, conflicts_with = "ipv4only")]
    ipv6only: bool,

    /// Multicast hop limit (default 1)
    #[arg(long)]
    hoplimit: Option<u32>,

    /// Source port for outgoing multicast (0 = ephemeral)
    #[arg(long)]
    source_port: Option<u16>,

    /// Endpoint UUID override (derived from the host name by default)
    #[arg(long)]
    uuid: Option<String>,

    /// Hostname to advertise (":NETBIOS:" for the uppercased simple name)
    #[arg(short = 'H', long)]
    hostname: Option<String>,

    /// Advertise membership in this workgroup
    #[arg(short = 'W', long, conflicts_with = "domain")]
    workgroup: Option<String>,

    /// Advertise membership in this domain
    #[arg(short = 'D', long, conflicts_with = "workgroup")]
    domain: Option<String>,

    /// Metadata template file (XML)
    #[arg(short, long)]
    metadata: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log file (stderr when absent)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// PID file path
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Account to run under
    #[arg(short = 'U', long)]
    user: Option<String>,

    /// Directory to chroot into
    #[arg(short = 'r', long)]
    chroot: Option<PathBuf>,
}

impl Args {
    fn to_options(&self) -> Options {
        let address_family = if self.ipv4only {
            Some(AddressFamily::IPv4)
        } else if self.ipv6only {
            Some(AddressFamily::IPv6)
        } else {
            None
        };
        Options {
            interfaces: self.interface.clone(),
            address_family,
            hoplimit: self.hoplimit,
            source_port: self.source_port,
            uuid: self.uuid.clone(),
            hostname: self.hostname.clone(),
            workgroup: self.workgroup.clone(),
            domain: self.domain.clone(),
            metadata: self.metadata.clone(),
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
            pid_file: self.pid_file.clone(),
            user: self.user.clone(),
            chroot: self.chroot.clone(),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    // Retransmission jitter source, owned here and lent to the loop.
    let mut rng = fastrand::Rng::new();

    loop {
        let mut opts = args.to_options();
        if let Some(path) = &args.config {
            match FileConfig::load(path) {
                Ok(file) => opts.overlay_file(file),
                Err(err) => {
                    eprintln!("wsdd: {}", err);
                    return ExitCode::FAILURE;
                }
            }
        }

        let config = match Config::build(&opts) {
            Ok(config) => Arc::new(config),
            Err(err) => {
                eprintln!("wsdd: {}", err);
                return ExitCode::FAILURE;
            }
        };

        if let Err(err) = logging::init(config.log_level, config.log_file.as_deref()) {
            eprintln!("wsdd: cannot open log output: {}", err);
            return ExitCode::FAILURE;
        }

        log::info!("wsdd {} starting", VERSION);
        runtime::notify(DaemonStatus::Ready);

        match runtime::serve(Arc::clone(&config), &mut rng) {
            Ok(RunOutcome::Terminated) => {
                runtime::notify(DaemonStatus::Stopping);
                return ExitCode::SUCCESS;
            }
            Ok(RunOutcome::ReloadRequested) => {
                runtime::notify(DaemonStatus::Reloading);
                log::info!("Reloading configuration");
            }
            Err(err) => {
                log::error!("{}", err);
                return ExitCode::FAILURE;
            }
        }
    }
}
