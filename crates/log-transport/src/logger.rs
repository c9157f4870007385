// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format for the pipeline binaries.
//!
//! Every line is prefixed with `LOGMUX` so the pipeline's own diagnostics
//! stand apart from the application output it carries:
//!
//! ```text
//! LOGMUX | LEVEL | [span{fields}: ]message fields
//! LOGMUX | WARN | logmux_service_watch{service="logaggregator"}: log aggregator is down
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

/// Builds the filter for `log_level`, keeping runtime internals quiet.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, ConfigError> {
    let directives = format!("tokio=off,runtime=off,{log_level}");
    EnvFilter::try_new(&directives).map_err(|_| ConfigError::LogFilter(log_level.to_string()))
}

/// Installs the global subscriber. Fails if the level is not a valid filter
/// or a subscriber is already installed.
pub fn init(log_level: &str) -> Result<(), ConfigError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::InvalidConfig(format!("logging already initialized: {e}")))
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "LOGMUX | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
