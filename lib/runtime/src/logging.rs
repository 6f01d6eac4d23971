// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! - Configuration loaded from:
//!   1. `FEDEXEC_LOG` environment variable (highest priority).
//!   2. Optional TOML file pointed to by the `FEDEXEC_LOGGING_CONFIG_PATH` environment variable.
//!   3. Built-in defaults.
//!
//! Output is `READABLE` (compact, one line per event) unless `FEDEXEC_LOGGING_JSONL`
//! is set to a truthy value, in which case every event is a single JSON object.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "fedexec_runtime::stacks" = "debug"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatFields, FormattedFields, format::Writer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{filter::Directive, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "FEDEXEC_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "FEDEXEC_LOGGING_CONFIG_PATH";

/// ENV switching output to JSONL
const JSONL_ENV: &str = "FEDEXEC_LOGGING_JSONL";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("tokio".to_string(), "error".to_string()),
                ("fedexec_runtime::utils::worker_pool".to_string(), "warn".to_string()),
            ]),
        }
    }
}

/// Initialize the global subscriber. Only the first call has an effect.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .with_ansi(false)
            .event_format(JsonFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .event_format(fmt::format().compact().with_timer(TimeFormatter))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn jsonl_logging_enabled() -> bool {
    std::env::var(JSONL_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| tracing::level_filters::LevelFilter::INFO.into());
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path));

    match figment.extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid logging configuration, using defaults: {e}");
            LoggingConfig::default()
        }
    }
}

struct TimeFormatter;

impl TimeFormatter {
    fn format_now(&self) -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_now())
    }
}

#[derive(Serialize)]
struct JsonLog<'a> {
    time: String,
    level: String,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_name: Option<&'a str>,
    message: serde_json::Value,
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

struct JsonFormatter {
    time_formatter: TimeFormatter,
}

impl JsonFormatter {
    fn new() -> Self {
        Self {
            time_formatter: TimeFormatter,
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .fields
            .remove("message")
            .unwrap_or(serde_json::Value::String(String::new()));

        let current_span = event
            .parent()
            .and_then(|id| ctx.span(id))
            .or_else(|| ctx.lookup_current());
        let mut span_name = None;
        if let Some(span) = current_span {
            span_name = Some(span.metadata().name());
            let ext = span.extensions();
            if let Some(data) = ext.get::<FormattedFields<N>>() {
                for (name, value) in data
                    .fields
                    .split(' ')
                    .filter_map(|entry| entry.split_once('='))
                {
                    visitor.fields.insert(
                        name.to_string(),
                        serde_json::Value::String(value.trim_matches('"').to_string()),
                    );
                }
            }
        }

        let metadata = event.metadata();
        let log = JsonLog {
            time: self.time_formatter.format_now(),
            level: metadata.level().to_string(),
            target: metadata.target(),
            span_name,
            message,
            fields: visitor.fields,
        };
        let json = serde_json::to_string(&log).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

#[derive(Default)]
struct JsonVisitor {
    // sorted so output is stable
    fields: BTreeMap<String, serde_json::Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(format!("{value:?}")),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        use serde_json::value::Number;
        self.fields.insert(
            field.name().to_string(),
            // NaN and infinities are not JSON numbers
            serde_json::Value::Number(Number::from_f64(value).unwrap_or(0.into())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" TRUE "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_load_config_from_toml() {
        let dir = std::env::temp_dir().join(format!("fedexec-logging-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("logging.toml");
        std::fs::write(
            &path,
            "log_level = \"warn\"\n[log_filters]\n\"fedexec_runtime\" = \"trace\"\n",
        )
        .unwrap();

        temp_env::with_var(CONFIG_PATH_ENV, Some(path.to_str().unwrap()), || {
            let config = load_config();
            assert_eq!(config.log_level, "warn");
            assert_eq!(
                config.log_filters.get("fedexec_runtime").map(String::as_str),
                Some("trace")
            );
        });
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_jsonl_switch() {
        temp_env::with_var(JSONL_ENV, Some("1"), || assert!(jsonl_logging_enabled()));
        temp_env::with_var_unset(JSONL_ENV, || assert!(!jsonl_logging_enabled()));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!(participants = 3, "logging initialized");
    }
}
