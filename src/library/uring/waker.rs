use crate::library::{error::EngineError, uring::Uring, uring::kernel_cmds::nop};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{trace, warn};

/// Unblocks an engine's pending wait from any thread by posting a tagless
/// no-op. The waiter sees it as [`Completion::Wake`](crate::library::engine::Completion::Wake).
#[derive(Clone)]
pub struct Waker {
    ring: Arc<Uring>,
}

impl Waker {
    pub(crate) fn new(ring: Arc<Uring>) -> Self {
        Waker { ring }
    }

    pub fn wake(&self) -> Result<(), EngineError> {
        submit_nop(&self.ring)
    }

    /// Wake once `timeout` has elapsed. This is how a bounded wait is built:
    /// `wait_completion` itself never times out.
    pub fn wake_after(&self, timeout: Duration) -> io::Result<JoinHandle<()>> {
        let waker = self.clone();
        thread::Builder::new()
            .name("tachyon-timer".into())
            .spawn(move || {
                thread::sleep(timeout);
                trace!("Deadline of {:?} elapsed", timeout);
                if let Err(e) = waker.wake() {
                    warn!("Deadline wake failed: {e}");
                }
            })
    }
}

/// Shared by the engine and its wakers.
pub(crate) fn submit_nop(ring: &Uring) -> Result<(), EngineError> {
    // A nop references no memory, nothing to keep alive.
    if !unsafe { ring.push(&nop()) } {
        return Err(EngineError::QueueFull);
    }
    if let Err(e) = ring.flush() {
        // Already published; the waiter's own enter will pick it up.
        warn!("Deferred nop flush: {e}");
    }
    Ok(())
}
