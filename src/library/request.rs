use crate::library::network::sender::SenderAddress;
use libc::{MSG_TRUNC, iovec, msghdr};
use std::fmt;

/// Scratch for one "receive a datagram" operation.
///
/// The kernel writes into the payload buffer, the sender slot and the
/// message header while the request is in flight, so the engine only ever
/// holds it boxed: the box's heap address is what the `msghdr` points into.
/// Nothing here is touched by the engine between submission and completion.
pub struct ReceiveRequest {
    msg: msghdr,
    iov: iovec,
    sender: SenderAddress,
    buffer: Vec<u8>,
    received: usize,
    msg_flags: i32,
}

// The raw pointers only ever point into the request's own box.
unsafe impl Send for ReceiveRequest {}

impl ReceiveRequest {
    /// Request with a zeroed payload buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Box<Self> {
        Self::with_buffer(vec![0u8; capacity])
    }

    /// Request over a caller-allocated buffer. Its current length is the
    /// capacity offered to the kernel.
    pub fn with_buffer(buffer: Vec<u8>) -> Box<Self> {
        Box::new(ReceiveRequest {
            // msghdr has private padding on some targets, zeroed() is the portable init.
            msg: unsafe { std::mem::zeroed() },
            iov: iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            },
            sender: SenderAddress::empty(),
            buffer,
            received: 0,
            msg_flags: 0,
        })
    }

    /// Point the scatter vector and message header at this request's own
    /// memory and clear the previous outcome. Must run on the boxed value right
    /// before it is handed to the kernel.
    pub(crate) fn arm(&mut self) -> *mut msghdr {
        self.received = 0;
        self.msg_flags = 0;
        self.sender.clear();

        self.iov.iov_base = self.buffer.as_mut_ptr().cast();
        self.iov.iov_len = self.buffer.len();

        self.msg = unsafe { std::mem::zeroed() };
        self.msg.msg_iov = &mut self.iov;
        self.msg.msg_iovlen = 1;
        self.msg.msg_name = self.sender.as_mut_ptr().cast();
        self.msg.msg_namelen = SenderAddress::LEN;
        &mut self.msg
    }

    /// Record a successful completion.
    pub(crate) fn complete(&mut self, received: usize) {
        self.received = received.min(self.buffer.len());
        self.msg_flags = self.msg.msg_flags;
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes delivered by the last successful receive.
    pub fn len(&self) -> usize {
        self.received
    }

    pub fn is_empty(&self) -> bool {
        self.received == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.received]
    }

    pub fn sender(&self) -> &SenderAddress {
        &self.sender
    }

    /// The datagram was larger than the buffer and the tail was dropped.
    pub fn is_truncated(&self) -> bool {
        self.msg_flags & MSG_TRUNC != 0
    }

    /// Forget the last outcome so the request can be submitted again.
    pub fn reset(&mut self) {
        self.received = 0;
        self.msg_flags = 0;
        self.sender.clear();
    }

    pub fn into_buffer(self: Box<Self>) -> Vec<u8> {
        self.buffer
    }

    #[cfg(test)]
    pub(crate) fn fill_for_test(&mut self, payload: &[u8], sender: SenderAddress) {
        self.buffer[..payload.len()].copy_from_slice(payload);
        self.sender = sender;
        self.complete(payload.len());
    }
}

impl fmt::Debug for ReceiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRequest")
            .field("capacity", &self.buffer.len())
            .field("received", &self.received)
            .field("sender", &self.sender)
            .field("truncated", &self.is_truncated())
            .finish()
    }
}
