use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::format::{Format, Writer},
    EnvFilter,
};

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, writer: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Installs the global subscriber. `RUST_LOG` directives are kept, `log_level` is added on top.
///
/// Returns `false` when a subscriber was already installed, which is not an error: tests and
/// embedding applications commonly set one up first.
pub fn setup_logger(log_level: LevelFilter) -> bool {
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let format = Format::default().with_timer(LocalTimer).with_level(true).with_target(true);

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(filter).event_format(format).finish();

    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => true,
        Err(_) => {
            debug!("A tracing subscriber is already installed, keeping it");
            false
        }
    }
}

pub fn setup_info_logger() -> bool {
    setup_logger(LevelFilter::INFO)
}

/// Logs every generated statement.
pub fn setup_debug_logger() -> bool {
    setup_logger(LevelFilter::DEBUG)
}
