//! Diagnostics sink: every validation, usage and capacity failure raised by device-level
//! code is delivered to a registered handler and forwarded to the `log` facade.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Warning,
    Error,
}

impl Severity {
    fn level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Warning => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    Memory,
    Resource,
    Barrier,
    Submission,
    Pipeline,
    Device,
}

impl LogCategory {
    /// `log` target used when the record is forwarded.
    pub fn target(self) -> &'static str {
        match self {
            LogCategory::Memory => "lume::memory",
            LogCategory::Resource => "lume::resource",
            LogCategory::Barrier => "lume::barrier",
            LogCategory::Submission => "lume::submission",
            LogCategory::Pipeline => "lume::pipeline",
            LogCategory::Device => "lume::device",
        }
    }
}

/// One diagnostic message as seen by a log handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub category: LogCategory,
    /// Name of the API entry point that raised the record.
    pub function: &'static str,
    pub message: String,
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.category, self.function, self.message)
    }
}

pub type LogHandler = Arc<dyn Fn(&DiagnosticRecord) + Send + Sync>;

/// Shared by a context and every device created from it.
pub struct Diagnostics {
    handler: RwLock<Option<LogHandler>>,
    validation: bool,
}

impl Diagnostics {
    pub fn new(validation: bool) -> Self {
        Self {
            handler: RwLock::new(None),
            validation,
        }
    }

    pub fn set_handler(&self, handler: Option<LogHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Whether debug-only validation (extra bookkeeping checks) is enabled.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    pub fn report(
        &self,
        severity: Severity,
        category: LogCategory,
        function: &'static str,
        message: impl Into<String>,
    ) {
        let record = DiagnosticRecord {
            severity,
            category,
            function,
            message: message.into(),
        };
        log::log!(target: category.target(), severity.level(), "{}: {}", function, record.message);
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(&record);
        }
    }

    pub fn error(&self, category: LogCategory, function: &'static str, message: impl Into<String>) {
        self.report(Severity::Error, category, function, message);
    }

    pub fn warning(
        &self,
        category: LogCategory,
        function: &'static str,
        message: impl Into<String>,
    ) {
        self.report(Severity::Warning, category, function, message);
    }

    pub fn debug(&self, category: LogCategory, function: &'static str, message: impl Into<String>) {
        if self.validation {
            self.report(Severity::Debug, category, function, message);
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn handler_receives_records() {
        let diagnostics = Diagnostics::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        diagnostics.set_handler(Some(Arc::new(move |r: &DiagnosticRecord| {
            sink.lock().unwrap().push(r.clone());
        })));
        diagnostics.error(LogCategory::Barrier, "barrier", "bad resource");
        diagnostics.debug(LogCategory::Memory, "allocate", "ok");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].severity, Severity::Error);
        assert_eq!(seen[0].function, "barrier");
        assert_eq!(seen[1].category, LogCategory::Memory);
    }

    #[test]
    fn debug_records_need_validation() {
        let diagnostics = Diagnostics::new(false);
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        diagnostics.set_handler(Some(Arc::new(move |_: &DiagnosticRecord| {
            *sink.lock().unwrap() += 1;
        })));
        diagnostics.debug(LogCategory::Device, "create_device", "hello");
        diagnostics.warning(LogCategory::Device, "create_device", "hello");
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
