//! Minimal stderr backend for the `log` facade, installed by the binaries.

use std::io::Write;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

pub const LEVEL_ENV: &str = "KINESCOPE_LOG";

struct StderrLogger {
    level: LevelFilter,
    started: Instant,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{elapsed:9.3} {:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Parses a level name, falling back to `default` for unset or unknown values.
pub fn level_from(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value
        .and_then(|value| value.trim().parse::<LevelFilter>().ok())
        .unwrap_or(default)
}

/// Installs the stderr logger. `KINESCOPE_LOG` overrides `default`.
/// A second call leaves the first logger in place.
pub fn init(default: LevelFilter) {
    let level = level_from(std::env::var(LEVEL_ENV).ok().as_deref(), default);
    let logger = StderrLogger {
        level,
        started: Instant::now(),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
    }
}
