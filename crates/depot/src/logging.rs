use std::env;

use depot_service::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// The crates whose logs follow the configured level. Everything else is capped at `INFO`.
const DEPOT_CRATES: &[&str] = &["depot", "depot_service"];

/// The default filter directives for `level`, used unless `RUST_LOG` is set.
fn default_filter(level: LevelFilter) -> String {
    if level <= LevelFilter::WARN {
        // `OFF` formats as "off", which the filter understands as well
        return level.to_string();
    }
    if level == LevelFilter::INFO {
        // the HTTP stack is chatty at `INFO`
        return "info,hyper=warn,reqwest=warn".to_owned();
    }

    let mut directives = "info".to_owned();
    for krate in DEPOT_CRATES {
        directives.push_str(&format!(",{krate}={level}"));
    }
    directives
}

/// Resolves [`LogFormat::Auto`] based on whether a user is watching.
fn resolve_format(format: LogFormat, user_attended: bool) -> LogFormat {
    match format {
        LogFormat::Auto if user_attended => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Initializes logging for depot.
///
/// `RUST_LOG` takes precedence over the configured level. With `enable_backtraces`, this also
/// sets `RUST_BACKTRACE`.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(config.logging.level));

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = match resolve_format(config.logging.format, console::user_attended()) {
        LogFormat::Pretty | LogFormat::Auto => layer.pretty().boxed(),
        LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
    .with_filter(EnvFilter::new(&filter));

    // errors become sentry events, everything down to `INFO` is attached to them as logs
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
