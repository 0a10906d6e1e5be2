use crate::library::engine_internals::WAKE_CODE;
use io_uring::{opcode, squeue, types};
use libc::msghdr;
use std::os::fd::RawFd;
use tracing::trace;

#[inline(always)]
pub unsafe fn recv_msg(user_data: u64, socket_fd: RawFd, msg: *mut msghdr) -> squeue::Entry {
    // Hand the kernel one msghdr and let it drop a single datagram into our iovec.
    // It also scribbles the sender into msg_name and the MSG_TRUNC bit into msg_flags,
    // so the whole msghdr has to stay put until the CQE shows up.
    trace!("Kernel Call: RecvMsg");
    opcode::RecvMsg::new(types::Fd(socket_fd), msg)
        .build()
        .user_data(user_data) // The packed handle. This is how the CQE finds its way home.
}

#[inline(always)]
pub fn nop() -> squeue::Entry {
    // Does nothing at all and completes right away. Perfect for poking a thread
    // that is asleep in submit_and_wait.
    trace!("Kernel Call: Nop");
    opcode::Nop::new().build().user_data(WAKE_CODE) // Zero tag: no request behind it, just a wake.
}
