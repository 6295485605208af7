//! Last unexpected error seen by the store, for health checks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

/// An unexpected error recorded by a background operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at {at})")]
pub struct Fault {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Holds at most one fault: the most recent one.
///
/// Writers record unexpected errors here and clear it after a successful
/// operation; a health check takes the fault out.
#[derive(Debug, Default)]
pub struct FaultRegister {
    current: Mutex<Option<Fault>>,
}

impl FaultRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(target: "gitkv::cache", "fault recorded: {}", message);
        *self.current.lock() = Some(Fault {
            message,
            at: Utc::now(),
        });
    }

    pub fn clear(&self) {
        self.current.lock().take();
    }

    /// take the pending fault, if any
    pub fn check_health(&self) -> Result<(), Fault> {
        match self.current.lock().take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// look at the pending fault without taking it
    pub fn peek(&self) -> Option<Fault> {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_check() {
        let faults = FaultRegister::new();
        assert!(faults.check_health().is_ok());

        faults.record("first");
        faults.record("second");
        assert_eq!(faults.peek().unwrap().message, "second");

        let fault = faults.check_health().unwrap_err();
        assert_eq!(fault.message, "second");
        assert!(faults.check_health().is_ok());
    }

    #[test]
    fn test_clear() {
        let faults = FaultRegister::new();
        faults.record("boom");
        faults.clear();
        assert!(faults.peek().is_none());
    }
}
