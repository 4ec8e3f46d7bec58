pub mod logging;

pub use logging::{ConsoleSink, LogAggregator, LogFileMode, LogHandle, LogRecord};
