use libc::socklen_t;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    os::fd::{AsRawFd, RawFd},
};
use tracing::trace;

/// Open and bind a UDP socket. With `reuse_port` several workers can bind the
/// same address and the kernel spreads datagrams across them.
pub fn bind_udp(addr: SocketAddr, reuse_port: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket.into())
}

/// Ask for a bigger receive buffer so bursts survive while receives are
/// being re-armed. Returns what the kernel actually granted.
pub fn prepare_receive_socket(socket: &UdpSocket, rcvbuf_size: i32) -> io::Result<i32> {
    let fd: RawFd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &rcvbuf_size as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // Linux doubles the value for bookkeeping and clamps it to rmem_max.
    let mut size: libc::c_int = 0;
    let mut len: socklen_t = size_of::<libc::c_int>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &mut size as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    trace!("Real rcvbuf size on FD:{fd}: {} bytes", size);
    Ok(size)
}
