// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// How log lines are rendered.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Rotation cadence for a log file; absent means one growing file.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
}

/// Logging knobs for the client. Lines go to stderr unless a file is
/// configured; file output is drained by a background writer thread,
/// so keep the returned guard alive for the process lifetime.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggerOptions {
    /// An EnvFilter directive set ("info", "resp_client_rs=debug", ...).
    /// `RUST_LOG` wins when the directive does not parse.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub rotate: Option<LogRotation>,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
            file: None,
            rotate: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggerYaml {
    logging: LoggerOptions,
}

/// Reads a `logging:` section from YAML and installs the subscriber.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("cannot read logger config {config_path}"))?;
    let parsed: LoggerYaml = serde_yaml::from_str(&raw)
        .with_context(|| format!("logger config {config_path} is not valid YAML"))?;
    init_with(&parsed.logging)
}

/// Installs the global tracing subscriber from in-memory options.
pub fn init_with(opts: &LoggerOptions) -> Result<WorkerGuard> {
    let (writer, guard) = match &opts.file {
        Some(file) => {
            let dir = file.parent().unwrap_or_else(|| Path::new("."));
            let name = file.file_name().unwrap_or_default();
            let cadence = match opts.rotate {
                Some(LogRotation::Minutely) => Rotation::MINUTELY,
                Some(LogRotation::Hourly) => Rotation::HOURLY,
                Some(LogRotation::Daily) => Rotation::DAILY,
                None => Rotation::NEVER,
            };
            tracing_appender::non_blocking(RollingFileAppender::new(cadence, dir, name))
        },
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let filter = EnvFilter::try_new(&opts.filter)
        .or_else(|_| EnvFilter::try_from_default_env())
        .with_context(|| format!("logger filter {:?} does not parse", opts.filter))?;

    let base = fmt::layer().with_writer(writer).with_ansi(false);
    match opts.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(
                Registry::default().with(filter).with(base),
            )
            .context("a global tracing subscriber is already installed")?;
        },
        LogFormat::Json => {
            tracing::subscriber::set_global_default(
                Registry::default().with(filter).with(base.json()),
            )
            .context("a global tracing subscriber is already installed")?;
        },
    }

    Ok(guard)
}
