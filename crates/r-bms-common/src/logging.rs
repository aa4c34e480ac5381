//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Tracing bootstrap with per-component levels and an optional rotating log file."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! The daemon runs three long-lived threads (`bms-poller`, `esc-bridge`,
//! `datalog-writer`). Their verbosity is set per component in `[logging]`:
//!
//! ```toml
//! [logging]
//! level = "info"
//! rotation = "hourly"
//!
//! [logging.components]
//! protocol = "trace"   # frame hex dumps
//! bridge = "debug"     # unanswered ESC requests
//! ```
//!
//! `R_BMS_LOG` (then `RUST_LOG`) replaces the whole directive when set.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_BMS_LOG";

/// Stdout line format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
    /// One short line per event, for a serial console.
    Compact,
}

/// How often the log file is rolled over. `Off` disables the file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
    Off,
}

impl LogRotation {
    fn rotation(self) -> Option<Rotation> {
        match self {
            Self::Hourly => Some(Rotation::HOURLY),
            Self::Daily => Some(Rotation::DAILY),
            Self::Never => Some(Rotation::NEVER),
            Self::Off => None,
        }
    }
}

/// Level overrides for the link components. `None` inherits the base level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentLevels {
    pub poller: Option<String>,
    pub bridge: Option<String>,
    pub writer: Option<String>,
    /// Frame codec and driver. `trace` adds hex dumps of every frame.
    pub protocol: Option<String>,
}

impl ComponentLevels {
    fn targets(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("r_bms_core::poller", self.poller.as_deref()),
            ("r_bms_core::bridge", self.bridge.as_deref()),
            ("r_bms_persistence::writer", self.writer.as_deref()),
            ("r_bms_protocol", self.protocol.as_deref()),
        ]
    }
}

/// Filter directive built from `[logging]`, e.g.
/// `info,r_bms_core::bridge=debug,r_bms_protocol=trace`.
pub fn directive(config: &LoggingConfig) -> String {
    let mut directive = config.level.clone();
    for (target, level) in config.components.targets() {
        if let Some(level) = level {
            let _ = write!(directive, ",{target}={level}");
        }
    }
    directive
}

/// Filter from the environment when set, otherwise from the configuration.
///
/// An unparsable environment directive is reported and ignored.
pub fn resolve_filter(config: &LoggingConfig, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(raw) = env {
        match EnvFilter::try_new(raw) {
            Ok(filter) => return Ok(filter),
            Err(err) => eprintln!("ignoring invalid {LOG_ENV} directive {raw:?}: {err}"),
        }
    }
    let directive = directive(config);
    EnvFilter::try_new(&directive).with_context(|| format!("invalid logging directive {directive:?}"))
}

/// Keeps the non-blocking writers flushing. Drop it last, on exit.
#[must_use = "log lines are lost once the guard is dropped"]
#[derive(Debug)]
pub struct LogGuard {
    _stdout: WorkerGuard,
    _file: Option<WorkerGuard>,
    pub file: Option<PathBuf>,
}

fn stdout_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
        LogFormat::Compact => layer.with_target(false).compact().boxed(),
    }
}

/// Install the global subscriber for `service`.
///
/// Stdout always receives events; a JSON file named after the service is
/// added under `directory` unless rotation is `off`. Calling this twice keeps
/// the first subscriber.
pub fn init_tracing(service: &str, config: &LoggingConfig) -> Result<LogGuard> {
    let env = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let filter = resolve_filter(config, env.as_deref())?;

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let (file_layer, file_guard, file) = match config.rotation.rotation() {
        Some(rotation) => {
            std::fs::create_dir_all(&config.directory).with_context(|| {
                format!("unable to create log directory {}", config.directory.display())
            })?;
            let prefix = config.file_prefix.as_deref().unwrap_or(service);
            let appender = RollingFileAppender::new(rotation, &config.directory, format!("{prefix}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_thread_names(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard), Some(config.directory.join(format!("{prefix}.log"))))
        }
        None => (None, None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer(config.format, stdout_writer))
        .with(file_layer)
        .try_init()
        .is_ok();

    info!(
        service,
        installed,
        directive = %env.unwrap_or_else(|| directive(config)),
        log_file = ?file,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(LogGuard {
        _stdout: stdout_guard,
        _file: file_guard,
        file,
    })
}
