//! Shared fatal-error latch.
//!
//! Any stage that hits an unrecoverable condition records it here and closes
//! the pools it touches; the closure wakes the consumer, whose `next` call
//! then reports the recorded error instead of blocking on a pipeline that
//! will never produce another batch.

use std::sync::Mutex;

use crate::error::Error;

/// First-fatal-error latch shared by every stage and the consumer.
pub(crate) struct PipelineStatus {
    error: Mutex<Option<Error>>,
}

impl PipelineStatus {
    pub(crate) fn new() -> Self {
        Self {
            error: Mutex::new(None),
        }
    }

    /// Record a fatal error. Only the first one is kept.
    pub(crate) fn fail(&self, error: Error) {
        let mut guard = self.error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    /// Consume the recorded error, or describe a plain shutdown.
    pub(crate) fn take_error(&self) -> Error {
        self.error.lock().unwrap().take().unwrap_or_else(|| Error::Pipeline {
            reason: "pipeline is stopped".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let status = PipelineStatus::new();
        status.fail(Error::Read {
            reason: "boom".to_string(),
        });
        status.fail(Error::Decode {
            reason: "later".to_string(),
        });

        let err = status.take_error();
        assert!(matches!(err, Error::Read { .. }), "got {err:?}");
    }

    #[test]
    fn test_take_without_failure_reports_shutdown() {
        let status = PipelineStatus::new();
        assert!(matches!(status.take_error(), Error::Pipeline { .. }));
    }

    #[test]
    fn test_take_error_is_one_shot() {
        let status = PipelineStatus::new();
        status.fail(Error::Read {
            reason: "boom".to_string(),
        });
        assert!(matches!(status.take_error(), Error::Read { .. }));
        assert!(matches!(status.take_error(), Error::Pipeline { .. }));
    }
}
