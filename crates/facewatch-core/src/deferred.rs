//! Errors raised on background threads, re-raised on the control loop.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Cloneable handle background threads report errors through.
pub struct ErrorReporter<E> {
    tx: mpsc::Sender<E>,
}

impl<E> Clone for ErrorReporter<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<E: std::fmt::Display> ErrorReporter<E> {
    /// Store an error for the next [`ErrorPoll::check`]. Never blocks.
    pub fn report(&self, err: E) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                tracing::warn!(error = %err, "deferred error queue full; dropping error");
            }
            Err(TrySendError::Closed(err)) => {
                tracing::warn!(error = %err, "deferred error reported after shutdown");
            }
        }
    }
}

/// Receiving side, polled once per control-loop tick.
pub struct ErrorPoll<E> {
    rx: mpsc::Receiver<E>,
}

impl<E> ErrorPoll<E> {
    /// Return the oldest pending error, if any.
    pub fn check(&mut self) -> Result<(), E> {
        match self.rx.try_recv() {
            Ok(err) => Err(err),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(()),
        }
    }
}

/// Create a bounded reporter/poll pair.
pub fn deferred_errors<E>(capacity: usize) -> (ErrorReporter<E>, ErrorPoll<E>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorReporter { tx }, ErrorPoll { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_is_ok_without_errors() {
        let (_reporter, mut poll) = deferred_errors::<String>(4);
        assert!(poll.check().is_ok());
    }

    #[test]
    fn test_error_from_thread_surfaces_on_check() {
        let (reporter, mut poll) = deferred_errors::<String>(4);
        std::thread::spawn(move || reporter.report("boom".to_string()))
            .join()
            .unwrap();
        assert_eq!(poll.check().unwrap_err(), "boom");
        assert!(poll.check().is_ok());
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (reporter, mut poll) = deferred_errors::<String>(1);
        reporter.report("first".into());
        reporter.report("second".into());
        assert_eq!(poll.check().unwrap_err(), "first");
        assert!(poll.check().is_ok());
    }
}
