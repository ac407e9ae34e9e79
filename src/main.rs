// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thin binary entry point. Construction of a real [`Config`] (reading a
//! config file, a CLI, a management API, whatever a given deployment
//! wants) lives outside this crate; this binary just wires a default
//! configuration into a [`Daemon`] and runs it to completion.

use lispd::{Config, Daemon};

fn main() {
    env_logger::init();

    let config = Config::default();

    let mut daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            log::error!("failed to start: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = daemon.run() {
        log::error!("daemon exited with error: {err}");
        std::process::exit(1);
    }
}
