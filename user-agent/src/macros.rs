/// Logs a line tagged with a component name.
///
/// The component becomes the log target, so the `fern` formatter installed by
/// the binary prints it between the level and the pid/tid fields:
///
/// ```text
/// [2025-04-25T16:32:10+02:00][DEBUG][correlation][pid=4568][tid=ThreadId(3)] message
/// ```
///
/// Usage:
/// ```rust
/// use log::Level;
/// agent::hostmon_log!(Level::Info, "ingest", "started with {} buckets", 64);
/// ```
#[macro_export]
macro_rules! hostmon_log {
    ($level:expr, $component:expr, $($arg:tt)+) => {
        ::log::log!(target: $component, $level, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::sync::Mutex;

    /// A tiny in-memory logger that captures up to DEBUG.
    struct MemoryLogger {
        buffer: Mutex<String>,
    }

    impl MemoryLogger {
        const fn new() -> Self {
            MemoryLogger { buffer: Mutex::new(String::new()) }
        }

        fn take(&self) -> String {
            std::mem::take(&mut *self.buffer.lock().unwrap())
        }
    }

    static LOGGER: MemoryLogger = MemoryLogger::new();

    impl Log for MemoryLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Debug
        }
        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let mut buf = self.buffer.lock().unwrap();
                buf.push_str(&format!("[{}][{}] {}\n", record.level(), record.target(), record.args()));
            }
        }
        fn flush(&self) {}
    }

    #[test]
    fn hostmon_log_uses_component_as_target() {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Debug);
        LOGGER.take();

        hostmon_log!(Level::Debug, "correlation", "Answer={}!", 42);
        hostmon_log!(Level::Trace, "correlation", "filtered out");

        let output = LOGGER.take();
        assert!(output.contains("[DEBUG][correlation]"), "missing level/component: {}", output);
        assert!(output.contains("Answer=42!"), "missing payload: {}", output);
        assert!(!output.contains("filtered out"), "trace must be filtered: {}", output);
    }
}
