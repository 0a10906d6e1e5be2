use libc::{AF_INET, sockaddr_in, socklen_t};
use std::{fmt, net::Ipv4Addr, net::SocketAddrV4};

/// Sender slot filled by the kernel on `recvmsg`. Fields stay in network byte
/// order until read through [`extract_ip`] / [`extract_port`].
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct SenderAddress {
    raw: sockaddr_in,
}

impl SenderAddress {
    pub const LEN: socklen_t = size_of::<sockaddr_in>() as socklen_t;

    pub fn empty() -> Self {
        // All-zero is a valid sockaddr_in ("unspecified").
        SenderAddress {
            raw: unsafe { std::mem::zeroed() },
        }
    }

    /// Build a slot the way the kernel would fill it. Mostly useful for fixtures.
    pub fn from_socket_addr(addr: SocketAddrV4) -> Self {
        let mut sender = Self::empty();
        sender.raw.sin_family = AF_INET as libc::sa_family_t;
        sender.raw.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
        sender.raw.sin_port = addr.port().to_be();
        sender
    }

    #[inline(always)]
    pub fn ip(&self) -> u32 {
        extract_ip(&self.raw)
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        extract_port(&self.raw)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip()), self.port())
    }

    pub fn is_filled(&self) -> bool {
        self.raw.sin_family == AF_INET as libc::sa_family_t
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::empty();
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut sockaddr_in {
        &mut self.raw
    }
}

impl fmt::Debug for SenderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_filled() {
            write!(f, "SenderAddress({})", self.socket_addr())
        } else {
            f.write_str("SenderAddress(<empty>)")
        }
    }
}

/// Sender IPv4 address in host byte order.
#[inline(always)]
pub fn extract_ip(addr: &sockaddr_in) -> u32 {
    u32::from_be(addr.sin_addr.s_addr)
}

/// Sender port in host byte order.
#[inline(always)]
pub fn extract_port(addr: &sockaddr_in) -> u16 {
    u16::from_be(addr.sin_port)
}
