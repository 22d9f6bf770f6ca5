use std::time::Duration;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

/// The purpose a timer was scheduled for, passed back to the owner when it fires
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TimerId {
    /// drain the outbound queues
    Wakeup,
    /// drain again after the stream reported congestion
    DrainRetry,
    /// continue processing buffered input after the per-event frame budget was used up
    ReadResume,
    ReassemblySweep,
    /// the peer's hello did not arrive in time
    HelloTimeout,
    /// the peer's features reply did not arrive in time
    FeaturesTimeout,
    /// send the next keep-alive echo request
    EchoInterval,
    /// the peer did not answer the keep-alive echo request in time
    EchoTimeout,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerHandle(pub u64);

/// A single-threaded one-shot timer facility. Fired timers are delivered as events on the
///  same loop that schedules them; a cancelled timer never fires.
#[cfg_attr(test, automock)]
pub trait Timer {
    fn now(&self) -> Instant;

    fn schedule(&mut self, delay: Duration, id: TimerId) -> TimerHandle;

    /// cancelling a timer that already fired or was cancelled is a no-op
    fn cancel(&mut self, handle: TimerHandle);
}
