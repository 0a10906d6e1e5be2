use crate::library::{
    engine_internals::{
        EngineInternal, Handle, WAKE_CODE, is_out_of_resources, is_reap_first, retry_interrupted,
    },
    error::{EngineError, ReceiveError, Rejected},
    registry::Registry,
    request::ReceiveRequest,
    uring::{
        RingConfig, Uring,
        kernel_cmds::recv_msg,
        waker::{Waker, submit_nop},
    },
};
use io_uring::cqueue;
use std::{
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
};
use tracing::{trace, warn};

/// A datagram landed in the request's buffer.
#[derive(Debug)]
pub struct Received {
    pub handle: Handle,
    pub request: Box<ReceiveRequest>,
}

impl Received {
    pub fn len(&self) -> usize {
        self.request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        self.request.payload()
    }

    /// `(payload_length, sender_ip, sender_port)`, all in host order.
    pub fn datagram(&self) -> (usize, u32, u16) {
        let sender = self.request.sender();
        (self.request.len(), sender.ip(), sender.port())
    }
}

/// The kernel failed this receive. The descriptor comes back for reuse.
#[derive(Debug)]
pub struct Failed {
    pub handle: Handle,
    pub error: ReceiveError,
    pub request: Box<ReceiveRequest>,
}

/// Outcome of one [`Engine::wait_completion`].
#[derive(Debug)]
pub enum Completion {
    Received(Received),
    Failed(Failed),
    /// A no-op posted by [`Engine::submit_noop`] or a [`Waker`].
    Wake,
}

/// Receive engine over one io_uring instance.
///
/// Driven by a single consumer: submissions and waits take `&mut self`.
/// Other threads can only interrupt a wait, through [`Engine::waker`].
pub struct Engine {
    ring: Arc<Uring>,
    registry: Registry,
    in_flight_limit: usize,
}

impl EngineInternal for Engine {}

impl Engine {
    /// Build the ring. Fails with [`EngineError::Init`] when the kernel refuses.
    pub fn new(config: &RingConfig) -> Result<Engine, EngineError> {
        let ring: Uring = Self::build_uring(config)?;
        // Every receive must have a completion slot waiting for it.
        let in_flight_limit = ring.cq_capacity();
        Ok(Engine {
            ring: Arc::new(ring),
            registry: Registry::with_capacity(config.get_queue_depth() as usize),
            in_flight_limit,
        })
    }

    /// Queue a receive of one datagram from `socket` into `request`.
    ///
    /// Returns as soon as the request is handed to the kernel. On
    /// [`EngineError::QueueFull`] the request comes back inside [`Rejected`]
    /// and nothing was registered: reap a completion and try again.
    pub fn submit_receive(
        &mut self,
        socket: &impl AsRawFd,
        request: Box<ReceiveRequest>,
    ) -> Result<Handle, Rejected> {
        self.submit_receive_fd(socket.as_raw_fd(), request)
    }

    pub fn submit_receive_fd(
        &mut self,
        socket_fd: RawFd,
        request: Box<ReceiveRequest>,
    ) -> Result<Handle, Rejected> {
        if self.registry.len() >= self.in_flight_limit {
            trace!("In-flight limit {} reached", self.in_flight_limit);
            return Err(Rejected {
                error: EngineError::QueueFull,
                request,
            });
        }
        let mut request = request;
        let msg = request.arm();
        let handle: Handle = self.registry.next_handle();
        let entry = unsafe { recv_msg(handle.pack_user_data(), socket_fd, msg) };
        // The box is filed under `handle` before anyone can reap its CQE:
        // completions are only read through `&mut self`.
        if !unsafe { self.ring.push(&entry) } {
            return Err(Rejected {
                error: EngineError::QueueFull,
                request,
            });
        }
        let filed = self.registry.insert(request);
        debug_assert_eq!(filed, handle);
        trace!("Submitted receive {:?} on FD:{socket_fd}", handle);
        if let Err(e) = self.ring.flush() {
            // Published already. The next wait enters the ring and flushes it.
            warn!("Deferred submission flush: {e}");
        }
        Ok(handle)
    }

    /// Queue a tagless no-op whose only effect is to end a pending wait.
    pub fn submit_noop(&mut self) -> Result<(), EngineError> {
        submit_nop(&self.ring)
    }

    /// Handle for waking this engine from other threads.
    pub fn waker(&self) -> Waker {
        Waker::new(Arc::clone(&self.ring))
    }

    /// Number of receives the kernel currently owns.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Block until exactly one completion is available, decode it and
    /// acknowledge it.
    pub fn wait_completion(&mut self) -> Result<Completion, EngineError> {
        let mut starved = false;
        loop {
            if let Some(cqe) = self.reap_one() {
                return self.decode(cqe);
            }
            let waited = retry_interrupted(|| self.ring.uring.submitter().submit_and_wait(1));
            match waited {
                Ok(_) => starved = false,
                Err(e) if is_reap_first(&e) => trace!("Kernel asks to reap first: {e}"),
                Err(e) if is_out_of_resources(&e) && !starved => {
                    trace!("Kernel short on resources, retrying once: {e}");
                    starved = true;
                }
                Err(e) => return Err(EngineError::Wait(e)),
            }
        }
    }

    /// Pop one CQE if any is queued. The view is dropped before returning,
    /// which advances the CQ head: that drop is the one acknowledgement.
    fn reap_one(&mut self) -> Option<cqueue::Entry> {
        // Only the engine reads the completion queue and it holds `&mut self`.
        let mut cq = unsafe { self.ring.uring.completion_shared() };
        let cqe = cq.next();
        drop(cq);
        cqe
    }

    fn decode(&mut self, cqe: cqueue::Entry) -> Result<Completion, EngineError> {
        trace!("New CQE: {:?}", cqe);
        let user_data: u64 = cqe.user_data();
        let result: i32 = cqe.result();
        if user_data == WAKE_CODE {
            return Ok(Completion::Wake);
        }
        let handle = Handle::unpack_user_data(user_data).ok_or(EngineError::UnknownHandle(user_data))?;
        let mut request = self
            .registry
            .remove(handle)
            .ok_or(EngineError::UnknownHandle(user_data))?;
        if result < 0 {
            let error = ReceiveError::from_result(result);
            trace!("Receive {:?} failed: {}", handle, error.as_io_error());
            return Ok(Completion::Failed(Failed {
                handle,
                error,
                request,
            }));
        }
        request.complete(result as usize);
        trace!(
            "Receive {:?}: {} bytes from {:?}",
            handle,
            request.len(),
            request.sender()
        );
        Ok(Completion::Received(Received { handle, request }))
    }

    /// Release the ring. Drain every completion first: requests still in
    /// flight are leaked, since the kernel may still write into them.
    pub fn teardown(self) {
        drop(self)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            let leaked = self.registry.leak_all();
            warn!("Engine torn down with {leaked} receives in flight, leaking their buffers");
        }
    }
}
