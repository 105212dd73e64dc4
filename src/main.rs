/*
 * This file is part of bootmeta.
 *
 * Copyright (C) 2025 bootmeta contributors
 *
 * bootmeta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * bootmeta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with bootmeta. If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::Context;
use clap::Parser;
use tracing::{debug, warn};

use bootmeta::cli::{run_cli, Cli, Commands};
use bootmeta::config::load_effective_settings;
use bootmeta::logger;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = load_effective_settings(cli.config.as_deref()).context("loading settings")?;

    // --log-level beats RUST_LOG beats the settings file
    let log_level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| settings.log_level.clone());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .with_writer(std::io::stderr)
        .init();

    if cli.logging {
        logger::init_logging();
        logger::log_event("startup", serde_json::json!({
            "args": std::env::args().collect::<Vec<_>>(),
            "policy": settings.policy,
        }));
    }

    // Mounting volumes and reading some DMI fields needs root
    let needs_root = matches!(cli.command, Commands::Detect | Commands::Fetch { .. });
    if needs_root && unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root; firmware and volume checks may be incomplete");
    }
    debug!(log_level = %log_level, "Starting bootmeta");

    if let Err(err) = run_cli(&cli, &settings) {
        eprintln!("error: {:#}", err);
        if cli.logging {
            logger::log_event("fatal_error", serde_json::json!({ "error": format!("{:#}", err) }));
        }
        std::process::exit(1);
    }

    Ok(())
}
