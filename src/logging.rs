use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Variable holding the log level, one of `error`, `warn`, `info`, `debug`, `trace`
pub const LOG_ENV: &str = "RUST_LOG";

pub fn level_from_str(level: &str) -> Level {
    match level.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Level from `RUST_LOG`, `info` when unset
pub fn level_from_env() -> Level {
    std::env::var(LOG_ENV)
        .map(|level| level_from_str(&level))
        .unwrap_or(Level::INFO)
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init(level: Level) {
    let installed = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
    if installed.is_ok() {
        tracing::debug!("Logging initialised at {}", level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_parsed_leniently() {
        assert_eq!(level_from_str("Warning"), Level::WARN);
        assert_eq!(level_from_str(" debug "), Level::DEBUG);
        assert_eq!(level_from_str("trace"), Level::TRACE);
        assert_eq!(level_from_str("error"), Level::ERROR);
        assert_eq!(level_from_str("mqtt_session=debug"), Level::INFO);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(Level::DEBUG);
        init(Level::INFO);
    }
}
