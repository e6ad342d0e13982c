pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Build the root logger. An empty `debug_file` logs to stderr, anything
/// else appends to the named file (the `DEBUG_FILE` config key).
pub fn init(debug_file: &str) -> Logger {
    if debug_file.is_empty() {
        TerminalLoggerBuilder::new()
            .level(Severity::Debug)
            .destination(Destination::Stderr)
            .build()
            .expect("Error building terminal logger")
    } else {
        FileLoggerBuilder::new(debug_file)
            .level(Severity::Debug)
            .build()
            .expect("Error building file logger")
    }
}

/// A logger that drops everything. Used by tests and as the default for
/// components constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
