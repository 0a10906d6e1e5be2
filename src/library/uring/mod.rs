pub mod kernel_cmds;
pub mod waker;

use io_uring::{Builder, IoUring, cqueue, squeue}; // Our doorway into the kernel's IO queues.
use std::{io, sync::Mutex};
use tracing::info;

const DEFAULT_QUEUE_DEPTH: u32 = 256;
const DEFAULT_SQPOLL_IDLE: u32 = 2000;

/// Ring sizing and setup flags.
#[derive(Debug, Clone)]
pub struct RingConfig {
    queue_depth: u32,         // SQ entries. How many receives we can have queued up at once.
    cq_depth: Option<u32>,    // CQ entries. Leave it empty and we take twice the SQ.
    sqpoll_enabled: bool,     // Let a kernel thread pick up submissions for us.
    sqpoll_idle: u32,         // Milliseconds that thread keeps spinning before it goes to sleep.
    sqpoll_cpu: Option<u32>,  // Core to park the poller on, if we care where it lives.
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            cq_depth: None,
            sqpoll_enabled: false,
            sqpoll_idle: DEFAULT_SQPOLL_IDLE,
            sqpoll_cpu: None,
        }
    }
}

impl RingConfig {
    pub fn new(queue_depth: u32) -> Self {
        RingConfig {
            queue_depth,
            ..Default::default()
        }
    }
    #[inline(always)]
    pub fn get_queue_depth(&self) -> u32 {
        self.queue_depth
    }
    #[inline(always)]
    pub fn set_queue_depth(&mut self, queue_depth: u32) -> &mut Self {
        self.queue_depth = queue_depth;
        self
    }
    /// Completion queue size, twice the submission depth unless set.
    #[inline(always)]
    pub fn get_cq_depth(&self) -> u32 {
        self.cq_depth
            .unwrap_or_else(|| self.queue_depth.saturating_mul(2))
    }
    #[inline(always)]
    pub fn set_cq_depth(&mut self, cq_depth: u32) -> &mut Self {
        self.cq_depth = Some(cq_depth);
        self
    }
    #[inline(always)]
    pub fn get_sqpoll_enabled(&self) -> bool {
        self.sqpoll_enabled
    }
    #[inline(always)]
    pub fn set_sqpoll_enabled(&mut self, enabled: bool) -> &mut Self {
        self.sqpoll_enabled = enabled;
        self
    }
    #[inline(always)]
    pub fn get_sqpoll_idle(&self) -> u32 {
        self.sqpoll_idle
    }
    #[inline(always)]
    pub fn set_sqpoll_idle(&mut self, sqpoll_idle: u32) -> &mut Self {
        self.sqpoll_idle = sqpoll_idle;
        self
    }
    #[inline(always)]
    pub fn set_sqpoll_cpu(&mut self, cpu: Option<u32>) -> &mut Self {
        self.sqpoll_cpu = cpu;
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }
}

/// The kernel queue pair.
///
/// Submission-side access goes through `sq_lock` because [`waker::Waker`]s push
/// no-ops from other threads. The completion side belongs to the one engine
/// driving the ring and is never locked.
pub struct Uring {
    pub uring: IoUring<squeue::Entry, cqueue::Entry>,
    pub(crate) sq_lock: Mutex<()>,
}

impl Uring {
    pub fn new(config: &RingConfig) -> io::Result<Uring> {
        // A ring with zero entries is not a ring. Catch it here with a readable error
        // instead of letting the kernel answer with a bare EINVAL.
        if config.queue_depth == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "queue depth must be at least 1",
            ));
        }
        let mut builder: Builder = IoUring::builder();
        // No setup_single_issuer here. Wakers push no-ops from their own threads,
        // and the kernel would slap them with EEXIST if we promised otherwise.
        // The CQ has to hold at least one slot per SQ entry, or completions
        // start piling up in the overflow list.
        builder.setup_cqsize(config.get_cq_depth().max(config.queue_depth));
        if config.sqpoll_enabled {
            info!("SQPOLL enabled");
            info!("    Uring SQPOLL idle: {}", config.sqpoll_idle);
            // The kernel spawns a poller that watches our SQ tail, so submitting
            // is just a store. It naps after `sqpoll_idle` ms of silence.
            builder.setup_sqpoll(config.sqpoll_idle);
            if let Some(cpu) = config.sqpoll_cpu {
                info!("    Uring SQPOLL affinity: {}", cpu);
                // Keep the poller next to its worker so the rings stay warm in cache.
                builder.setup_sqpoll_cpu(cpu);
            }
            // Children of a fork() do not get a copy of the ring mappings.
            // A child poking at our SQ would be a very bad day.
            builder.dontfork();
        } else {
            // Without a poller every submit is a syscall, so make it count: keep
            // going past a failed entry instead of stopping at the first one.
            builder.setup_submit_all();
        }
        // The kernel may round the sizes up. What it actually gave us is in params().
        let uring: IoUring<squeue::Entry, cqueue::Entry> = builder.build(config.queue_depth)?;
        info!(
            "Uring ready. SQ: {} CQ: {}",
            uring.params().sq_entries(),
            uring.params().cq_entries()
        );
        Ok(Uring {
            uring,
            sq_lock: Mutex::new(()),
        })
    }

    /// Completion queue capacity the kernel actually granted.
    pub fn cq_capacity(&self) -> usize {
        self.uring.params().cq_entries() as usize
    }

    /// Push one entry under the submission lock and publish the new tail.
    /// Returns `false` when the submission queue has no free slot.
    ///
    /// # Safety
    /// Every buffer the entry references must stay valid until its completion
    /// has been reaped.
    pub(crate) unsafe fn push(&self, entry: &squeue::Entry) -> bool {
        let _guard = self.sq_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // The lock makes us the only submission-queue writer, which is the one
        // thing submission_shared() asks of us.
        let mut sq = unsafe { self.uring.submission_shared() };
        if sq.is_full() {
            // No room at the inn. The caller gets its request back and decides.
            return false;
        }
        let pushed = unsafe { sq.push(entry) }.is_ok();
        // Publish the new tail so the kernel (or the SQPOLL thread) can see it.
        sq.sync();
        pushed
    }

    /// Hand everything published so far to the kernel.
    pub(crate) fn flush(&self) -> io::Result<usize> {
        // With SQPOLL this only rings the doorbell when the poller fell asleep.
        self.uring.submitter().submit()
    }
}
