// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;

use vlease::{Daemon, DaemonConfig};

const DEFAULT_CONFIG_FILE: &str = "/etc/vlease.conf";

/// DHCPv4 relay/requester daemon for VPN concentrators.
#[derive(Debug, Parser)]
#[command(name = "vleased", version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Activate debug logging
    #[arg(long)]
    debug: bool,
}

extern "C" fn handle_sigterm(_signum: libc::c_int) {
    vlease::request_stop();
}

fn install_signal_handlers() {
    let handler = handle_sigterm as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter(Some("vlease"), level)
        .filter(Some("vleased"), level)
        .init();

    let config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let mut daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    install_signal_handlers();

    if let Err(e) = daemon.run() {
        log::error!("Daemon loop failed: {e}");
        std::process::exit(1);
    }
}
