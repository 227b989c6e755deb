//! Tracing setup: compact terminal output plus a daily-rolling log file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::Path;

const MAX_MESSAGE_CHARS: usize = 280;

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Initialize tracing for the bot process.
///
/// Returns the file writer guard; the caller must keep it alive until exit
/// so buffered lines reach the log file.
pub fn init_tracing(log_dir: &Path, debug: bool) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "osiris.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let field_formatter = format::debug_fn(|writer, field, value| {
        let field_name = field.name();
        if field_name == "message" {
            let formatted = format!("{value:?}");
            let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
            if was_truncated {
                write!(writer, "{}={}...", field_name, truncated)
            } else {
                write!(writer, "{}={formatted}", field_name)
            }
        } else {
            write!(writer, "{}={value:?}", field_name)
        }
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(field_formatter)
        .compact();
    let stdout_layer = tracing_subscriber::fmt::layer().compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--debug`.
fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    let fallback = if debug { "debug" } else { "info" };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback))
}
