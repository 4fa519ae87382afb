// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implements the `run` command (i.e., running the server).

use std::fmt::Write;
use std::iter;
use std::path::Path;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use rootward::io::BlockingIoProvider;
use rootward::server::Server;
use rootward::thread::ThreadGroup;

use crate::args::RunArgs;
use crate::config::{self, OverrideConfig};

/// Runs the server.
pub fn run(args: RunArgs) {
    env_logger::init_from_env(Env::new().default_filter_or("warn"));

    if let Err(e) = try_running(args) {
        let mut message = String::from("Failed to run:");
        for (i, cause) in e.chain().enumerate() {
            write!(message, "\n[{}] {}", i + 1, cause).unwrap();
        }
        message.push_str("\nExiting with failure.");
        error!("{}", message);
        process::exit(1);
    }
    info!("Exiting with success.");
}

fn try_running(run_args: RunArgs) -> Result<()> {
    info!(
        "Rootward daemon v{}.{}.{} starting.",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    // Get the configuration, either from the file system or from the
    // command line arguments, as appropriate.
    let (config, reload_source) = if let Some(ref config_path) = run_args.config {
        info!("Loading the configuration from {}.", config_path.display());
        let config = config::load_from_path(config_path, false)
            .context("failed to load the configuration")?;
        let reload_source = ReloadSource::Config(config_path.as_path());
        (config, reload_source)
    } else {
        info!("Loading the configuration from the command line.");
        let config = config::load_from_args(run_args);
        let reload_source = ReloadSource::Args(config.overrides.clone());
        (config, reload_source)
    };

    // Create/bind the I/O provider and set up the server.
    let io_provider = BlockingIoProvider::bind(
        config::make_io_config(&config),
        iter::once(config.bind),
        iter::once(config.bind),
    )
    .context("failed to bind sockets")?;
    let overrides =
        config::make_override_table(&config.overrides).context("invalid override table")?;
    let server = Arc::new(Server::new(overrides));

    // Set up signal handling.
    let mut signals = set_up_signal_handling().context("failed to set up signal handling")?;

    // Start the I/O provider.
    info!("Set-up is complete; starting the server.");
    let thread_group = ThreadGroup::new();
    io_provider
        .start(&server, &thread_group)
        .context("failed to start the I/O provider")?;

    // Process incoming signals.
    for signal in signals.forever() {
        match signal {
            s @ (SIGINT | SIGTERM) => {
                let name = match s {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    _ => unreachable!(),
                };
                info!("Received {}; shutting down.", name);
                break;
            }
            SIGHUP => {
                info!("Received SIGHUP; reloading the override table.");
                if let Err(e) = reload_overrides(&reload_source, &server) {
                    let mut message = String::from("Failed to reload the override table:");
                    for (i, cause) in e.chain().enumerate() {
                        write!(message, "\n[{}] {}", i + 1, cause).unwrap();
                    }
                    error!("{}", message);
                }
            }
            _ => unreachable!(),
        }
    }

    // Shut down the server.
    thread_group.shut_down();
    thread_group.await_shutdown();
    info!("Shutdown complete.");
    Ok(())
}

fn set_up_signal_handling() -> Result<Signals> {
    let all_signals = &[SIGHUP, SIGINT, SIGTERM];
    let term_signals = &[SIGINT, SIGTERM];
    let already_terminating = Arc::new(AtomicBool::new(false));

    // This sets up signal handlers to exit immediately if a second
    // termination signal arrives before the process finishes shutting
    // down gracefully.
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    Signals::new(all_signals).map_err(Into::into)
}

enum ReloadSource<'a> {
    Args(Vec<OverrideConfig>),
    Config(&'a Path),
}

fn reload_overrides(reload_source: &ReloadSource, server: &Server) -> Result<()> {
    let override_configs = match reload_source {
        ReloadSource::Args(override_configs) => override_configs.clone(),
        ReloadSource::Config(path) => {
            let config =
                config::load_from_path(path, true).context("failed to reload the configuration")?;
            config.overrides
        }
    };
    let new_overrides = config::make_override_table(&override_configs)
        .context("invalid override table")?;
    server.set_overrides(new_overrides);
    Ok(())
}
