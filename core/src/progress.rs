use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Phases of a write session, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    DevicePrepared,
    Partitioned,
    Formatted,
    ContentCopying,
    DriverInjecting,
    Verifying,
    Completed,
    Failed,
    RolledBack,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::RolledBack)
    }

    /// Cancelling from here restores the device instead of failing the session.
    pub fn can_roll_back(self) -> bool {
        matches!(self, Phase::DevicePrepared | Phase::Partitioned)
    }

    /// The phase a successful run moves to next.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::DevicePrepared),
            Phase::DevicePrepared => Some(Phase::Partitioned),
            Phase::Partitioned => Some(Phase::Formatted),
            Phase::Formatted => Some(Phase::ContentCopying),
            Phase::ContentCopying => Some(Phase::DriverInjecting),
            Phase::DriverInjecting => Some(Phase::Verifying),
            Phase::Verifying => Some(Phase::Completed),
            Phase::Completed | Phase::Failed | Phase::RolledBack => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        self.bytes_done as f64 * 100.0 / self.bytes_total as f64
    }
}

/// Receives progress notifications from a running session.
pub trait ProgressSink: Send {
    fn report(&mut self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(ProgressEvent) + Send,
{
    fn report(&mut self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for tokio::sync::mpsc::UnboundedSender<ProgressEvent> {
    fn report(&mut self, event: ProgressEvent) {
        // Receiver gone means nobody is watching anymore.
        let _ = self.send(event);
    }
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&mut self, _event: ProgressEvent) {}
}

/// Shared flag a front end sets to ask a session to stop at the next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
