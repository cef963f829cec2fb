//! Stdout logger for the command-line tool.

use std::io::{stdout, Write};
use std::time::Instant;

use log::{Level, LevelFilter, Metadata, Record};

/// Prints `[elapsed-µs LEVEL module] message` lines to stdout.
///
/// Warnings and errors carry `file:line` instead of the module path.
pub struct Logger {
    start: Instant,
    level: LevelFilter,
}

impl Logger {
    fn new(level: LevelFilter) -> Self {
        Self {
            start: Instant::now(),
            level,
        }
    }

    /// Installs the logger. Does nothing if a logger is already set.
    pub fn init(level: LevelFilter) {
        let leaked = Box::leak(Box::new(Logger::new(level)));
        if log::set_logger(leaked).is_err() {
            return;
        }
        log::set_max_level(level);
    }

    /// Level for a `-v` count: warnings by default, then info, debug, trace.
    pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, r: &Record<'_>) {
        if !self.enabled(r.metadata()) {
            return;
        }

        let time = self.start.elapsed().as_micros();
        if r.level() > Level::Warn {
            let module_path = r.module_path_static().unwrap_or_else(|| r.target());
            println!("[{:9} {:5} {:12}] {}", time, r.level(), module_path, r.args());
        } else {
            println!(
                "[{:9} {:5} {}:{}] {}",
                time,
                r.level(),
                r.file().unwrap_or_default(),
                r.line().unwrap_or_default(),
                r.args()
            );
        }
    }

    fn flush(&self) {
        let _ = stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Logger::level_for_verbosity(0), LevelFilter::Warn);
        assert_eq!(Logger::level_for_verbosity(2), LevelFilter::Debug);
        assert_eq!(Logger::level_for_verbosity(9), LevelFilter::Trace);
    }

    #[test]
    fn test_enabled_respects_level() {
        let logger = Logger::new(LevelFilter::Info);
        let info = Metadata::builder().level(Level::Info).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&debug));
    }
}
