use std::time::Duration;

/// Result of one reconcile pass. The dispatcher decides when to call again based on it.
#[derive(Debug)]
pub enum ReconcileOutcome<E> {
    /// Converged (or the object is gone); wait for the next change.
    NoRequeue,
    RequeueImmediate,
    RequeueAfter(Duration),
    Error(E),
}

impl<E> ReconcileOutcome<E> {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Option<Duration>, E> {
        match self {
            Self::NoRequeue => Ok(None),
            Self::RequeueImmediate => Ok(Some(Duration::ZERO)),
            Self::RequeueAfter(d) => Ok(Some(d)),
            Self::Error(e) => Err(e),
        }
    }
}
