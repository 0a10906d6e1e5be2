use crate::library::{
    error::EngineError,
    uring::{RingConfig, Uring},
};
use std::io;
use tracing::trace;

/// User data of a tagless no-op. Real handles never pack to this value.
pub const WAKE_CODE: u64 = 0;

/// Correlation handle of an in-flight receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub slot: u32,
    pub generation: u32,
}

impl Handle {
    /// Slot is stored off by one so that no handle packs to [`WAKE_CODE`].
    #[inline(always)]
    pub const fn pack_user_data(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.slot as u64 + 1)
    }

    #[inline(always)]
    pub fn unpack_user_data(user_data: u64) -> Option<Self> {
        let low = (user_data & 0xFFFF_FFFF) as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            slot: low - 1,
            generation: (user_data >> 32) as u32,
        })
    }
}

/// Run `op` again for as long as it fails with `EINTR`.
pub fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                trace!("Wait interrupted by signal, retrying");
                continue;
            }
            other => return other,
        }
    }
}

/// `EBUSY` from `io_uring_enter` means the CQ is backed up and the kernel
/// wants us to reap first, which is exactly what the caller of a wait does next.
pub fn is_reap_first(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}

/// `EAGAIN` is the kernel running short on request memory. It gets one more
/// try after a reap; if it comes back with nothing to reap it is a real error.
pub fn is_out_of_resources(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EAGAIN)
}

pub trait EngineInternal {
    fn build_uring(config: &RingConfig) -> Result<Uring, EngineError>
    where
        Self: Sized,
    {
        Uring::new(config).map_err(EngineError::Init)
    }
}
