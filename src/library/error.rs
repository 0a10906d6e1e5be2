use crate::library::request::ReceiveRequest;
use std::io;
use thiserror::Error;

/// Errors returned by the receive engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// io_uring setup failed (resource limits, missing kernel support, seccomp).
    #[error("ring setup: {0}")]
    Init(#[source] io::Error),
    /// No submission slot free, or the completion queue could not absorb
    /// another in-flight receive. Drain a completion and retry.
    #[error("submission queue full")]
    QueueFull,
    /// Waiting for a completion failed for a reason other than a signal.
    #[error("wait for completion: {0}")]
    Wait(#[source] io::Error),
    /// A helper thread (heartbeat, timer) could not be started.
    #[error("spawn {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// A completion carried a tag that matches no in-flight request.
    #[error("completion for unknown handle {0:#x}")]
    UnknownHandle(u64),
}

/// A submission the engine refused. The descriptor is handed back untouched.
#[derive(Debug, Error)]
#[error("receive rejected: {error}")]
pub struct Rejected {
    #[source]
    pub error: EngineError,
    pub request: Box<ReceiveRequest>,
}

impl Rejected {
    pub fn into_request(self) -> Box<ReceiveRequest> {
        self.request
    }
}

/// The kernel failed one specific receive. The ring stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("receive failed: errno {code}")]
pub struct ReceiveError {
    /// Positive errno value.
    pub code: i32,
}

impl ReceiveError {
    pub fn from_result(result: i32) -> Self {
        ReceiveError { code: -result }
    }

    pub fn as_io_error(&self) -> io::Error {
        io::Error::from_raw_os_error(self.code)
    }
}
