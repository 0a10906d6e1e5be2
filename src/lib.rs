//! Asynchronous UDP datagram receive engine on top of io_uring.
//!
//! Callers hand boxed [`ReceiveRequest`]s to an [`Engine`], which files them
//! in a slot table and queues a `recvmsg` per request. [`Engine::wait_completion`]
//! later blocks for one completion and hands the request back together with
//! the byte count and the sender, or reports a [`Completion::Wake`] posted by
//! a no-op.

pub mod library;

pub use library::{
    engine::{Completion, Engine, Failed, Received},
    engine_internals::Handle,
    error::{EngineError, ReceiveError, Rejected},
    network::sender::{SenderAddress, extract_ip, extract_port},
    receiver::{Receiver, WorkerStats},
    request::ReceiveRequest,
    uring::{RingConfig, waker::Waker},
};
