// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::{
        Once,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::{self, LevelFilter, Targets},
    fmt::MakeWriter,
    layer::{Layered, SubscriberExt},
    reload,
};

/// Filter used when neither the options nor `RUST_LOG` name one.
pub const DEFAULT_LOG_TARGETS: &str = "info";

const DEFAULT_UT_LOG_TARGETS: &str = "debug,zqueue_common_worker=info";

type FilteredRegistry = Layered<reload::Layer<Targets, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Swaps the level filter after [`init_global_logging`].
pub static RELOAD_HANDLE: OnceCell<reload::Handle<Targets, Registry>> = OnceCell::new();

static INITIALIZED: AtomicBool = AtomicBool::new(false);

static UT_LOG_GUARDS: Lazy<Mutex<Vec<WorkerGuard>>> = Lazy::new(|| Mutex::new(Vec::new()));

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TelemetryError {
    #[snafu(display("Invalid log level filter '{level}'"))]
    InvalidLevel {
        level:  String,
        source: filter::ParseError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Cannot create rolling log file in {dir}"))]
    Appender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Cannot bridge `log` records into tracing"))]
    LogBridge {
        source: tracing_log::log::SetLoggerError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("A global tracing subscriber is already installed"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Logging has not been initialised"))]
    NotInitialized {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Failed to swap the log filter"))]
    Reload {
        source: reload::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

/// Deserialize `T`, mapping an empty string to `T::default()`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Ok(T::default());
    }
    T::deserialize(de::value::StrDeserializer::<de::value::Error>::new(&s))
        .map_err(|e| de::Error::custom(format!("invalid value '{s}': {e}")))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for hourly rolling log files. Empty disables file output.
    #[default = ""]
    #[builder(default, into)]
    pub dir: String,

    /// Filter such as `info` or `debug,zqueue_common_storage_log=trace`.
    /// Falls back to `RUST_LOG`, then to [`DEFAULT_LOG_TARGETS`].
    #[builder(into)]
    pub level: Option<String>,

    #[serde(deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log kind.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

/// Install the global subscriber.
///
/// Writes to stdout and, when `opts.dir` is set, to `<app_name>.*` and
/// `<app_name>-err.*` rolling files. Keep the returned guards alive for as
/// long as logs should be flushed. Only the first call in a process installs
/// anything; later calls return no guards.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>, TelemetryError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Ok(Vec::new());
    }

    let level = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_owned());
    let targets = parse_targets(&level)?;

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        layers.push(fmt_layer(opts.log_format, writer, std::io::stdout().is_terminal()));
    }

    if !opts.dir.is_empty() {
        let (writer, guard) = tracing_appender::non_blocking(rolling_appender(opts, app_name)?);
        guards.push(guard);
        layers.push(fmt_layer(opts.log_format, writer, false));

        let err_prefix = format!("{app_name}-err");
        let (writer, guard) = tracing_appender::non_blocking(rolling_appender(opts, &err_prefix)?);
        guards.push(guard);
        layers.push(
            fmt_layer(opts.log_format, writer, false)
                .with_filter(LevelFilter::ERROR)
                .boxed(),
        );
    }

    LogTracer::init().context(LogBridgeSnafu)?;

    let (dyn_filter, reload_handle) = reload::Layer::new(targets);
    // Only reachable once thanks to INITIALIZED.
    let _ = RELOAD_HANDLE.set(reload_handle);

    let subscriber = Registry::default().with(dyn_filter).with(layers);
    tracing::subscriber::set_global_default(subscriber).context(SetGlobalDefaultSnafu)?;

    tracing::info!(app = app_name, level = %level, dir = %opts.dir, "Logging initialised");
    Ok(guards)
}

/// Replace the active level filter.
pub fn reload_level(level: &str) -> Result<(), TelemetryError> {
    let targets = parse_targets(level)?;
    RELOAD_HANDLE
        .get()
        .context(NotInitializedSnafu)?
        .reload(targets)
        .context(ReloadSnafu)
}

/// Initialise logging once for a test binary.
///
/// Logs go to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) filtered
/// by `UNITTEST_LOG_LEVEL`. Safe to call from every test.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir = env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_owned());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_UT_LOG_TARGETS.to_owned());
        let opts = LoggingOptions::builder()
            .dir(dir)
            .level(level)
            .append_stdout(false)
            .build();

        match init_global_logging("unittest", &opts) {
            Ok(guards) => UT_LOG_GUARDS.lock().extend(guards),
            // Another subscriber won the race; tests still run.
            Err(err) => tracing::warn!(error = %err, "Unit test logging not installed"),
        }
    });
}

fn parse_targets(level: &str) -> Result<Targets, TelemetryError> {
    level.parse::<Targets>().context(InvalidLevelSnafu { level })
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> Result<RollingFileAppender, TelemetryError> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .context(AppenderSnafu { dir: opts.dir.clone() })
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    match format {
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_defaults() {
        let opts = LoggingOptions::default();
        assert!(opts.dir.is_empty());
        assert_eq!(opts.max_log_files, 720);
        assert!(opts.append_stdout);
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts, LoggingOptions::builder().build());
    }

    #[test_case(r#"{"log_format": ""}"#, LogFormat::Text ; "empty string means default")]
    #[test_case(r#"{"log_format": "json"}"#, LogFormat::Json ; "json")]
    #[test_case("{}", LogFormat::Text ; "missing")]
    fn test_log_format_deserialize(input: &str, expected: LogFormat) {
        let opts: LoggingOptions = serde_json::from_str(input).unwrap();
        assert_eq!(opts.log_format, expected);
    }

    #[test]
    fn test_bad_format_is_rejected() {
        assert!(serde_json::from_str::<LoggingOptions>(r#"{"log_format": "xml"}"#).is_err());
    }

    #[test_case("info" ; "plain level")]
    #[test_case("debug,zqueue=trace" ; "per target")]
    fn test_parse_targets(level: &str) { parse_targets(level).unwrap(); }

    #[test]
    fn test_parse_targets_rejects_garbage() {
        let err = parse_targets("zqueue=loudest").unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidLevel { .. }));
    }

    #[test]
    fn test_format_display() {
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
