//! Observability subsystem for vstore
//!
//! - Structured JSON logging
//! - Counter metrics
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on protocol decisions
//! 3. Logging failures are swallowed
//! 4. Deterministic output

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Logging switch plus counters, shared by every protocol component.
#[derive(Debug, Default)]
pub struct Telemetry {
    metrics: MetricsRegistry,
    log_events: bool,
}

impl Telemetry {
    /// Telemetry that logs events when `log_events` is set.
    pub fn new(log_events: bool) -> Self {
        Self {
            metrics: MetricsRegistry::new(),
            log_events,
        }
    }

    /// Telemetry that only counts.
    pub fn silent() -> Self {
        Self::new(false)
    }

    /// Counters.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Whether events are written to the log.
    pub fn is_logging(&self) -> bool {
        self.log_events
    }

    /// Log a lifecycle event at its own severity.
    pub fn emit(&self, event: Event, fields: &[(&str, &str)]) {
        if self.log_events {
            Logger::log(event.severity(), event.as_str(), fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_telemetry_does_not_log() {
        let telemetry = Telemetry::silent();
        assert!(!telemetry.is_logging());
        telemetry.emit(Event::UpgradeBegin, &[("store", "db")]);
    }

    #[test]
    fn test_emit_does_not_panic_when_logging() {
        let telemetry = Telemetry::new(true);
        telemetry.emit(Event::EngineOpened, &[("engine", "memory")]);
        telemetry.metrics().increment_opens_succeeded();
        assert_eq!(telemetry.metrics().snapshot().opens_succeeded, 1);
    }
}
