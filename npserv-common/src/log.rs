// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::{Config, LogMethod};
use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber according to the runtime config.
///
/// Diagnostics only; protocol bytes (prompts, broadcasts, proxy log records)
/// are written to their mandated descriptors directly and never go through
/// here.
pub fn enable_logging() -> anyhow::Result<()> {
    let config = Config::get();
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.log_method {
        LogMethod::Disabled => return Ok(()),
        LogMethod::Stdout => builder
            .with_writer(io::stdout)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?,
        LogMethod::Stderr => builder
            .with_writer(io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?,
        LogMethod::File(path) => {
            let file = OpenOptions::new().append(true).create(true).open(path)?;
            builder
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?
        }
    }
    tracing::debug!("logging initialized via {}", config.log_method);
    Ok(())
}
