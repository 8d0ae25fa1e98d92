use tracing::{error, info, warn};

/// Severity of a buffered log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A log statement captured before the logging stack is safe to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// Buffer for log output produced while preferences are still being applied.
///
/// Profile provisioning runs before the host has finished setting up its
/// logging, which may itself be driven by the preferences being written here.
/// Records are appended from the single orchestration thread and flushed once
/// the combined preference file is in place.
#[derive(Debug, Default)]
pub struct DeferredLog {
    records: Vec<LogRecord>,
}

impl DeferredLog {
    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        self.records.push(LogRecord {
            level,
            message: message.into(),
        });
    }

    /// Records buffered so far, in append order.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Emits every buffered record through `tracing` and returns them.
    pub fn flush(&mut self) -> Vec<LogRecord> {
        let records = std::mem::take(&mut self.records);
        for record in &records {
            match record.level {
                LogLevel::Info => info!("{}", record.message),
                LogLevel::Warn => warn!("{}", record.message),
                LogLevel::Error => error!("{}", record.message),
            }
        }
        records
    }
}
