//! Nonblocking UDP endpoint used by the [`Peer`].
//!
//! This is the only place the crate touches the OS network stack. The
//! contract the core relies on: sends and receives never block, a receive
//! with nothing queued reports "no data" rather than an error, and broadcast
//! can be toggled for LAN discovery.
//!
//! [`Peer`]: crate::peer::Peer

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
};

/// Nonblocking UDP socket.
#[derive(Debug)]
pub struct Socket {
    inner: UdpSocket,
}

impl Socket {
    /// Opens a socket on an OS-assigned port, for clients.
    pub fn open() -> io::Result<Self> {
        Self::bind((Ipv4Addr::UNSPECIFIED, 0).into())
    }

    /// Opens a socket bound to `addr`, for servers accepting inbound
    /// connections.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    /// Allows or disallows sending to broadcast addresses.
    pub fn allow_broadcast(&self, allow: bool) -> io::Result<()> {
        self.inner.set_broadcast(allow)
    }

    /// Address this socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Sends one datagram to `addr`, returning how many bytes went out.
    pub fn send_to(&self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.inner.send_to(data, addr)
    }

    /// Receives one datagram into `buf`.
    ///
    /// Returns `Ok(None)` when nothing is queued; would-block is not an
    /// error. Any other failure is.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inner.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_socket_reports_no_data() {
        let socket = Socket::open().expect("loopback socket");
        let mut buf = [0; 16];
        assert!(matches!(socket.recv_from(&mut buf), Ok(None)));
    }

    #[test]
    fn loopback_round_trip() {
        let a = Socket::open().expect("loopback socket");
        let b = Socket::bind(([127, 0, 0, 1], 0).into()).expect("loopback socket");
        let to = b.local_addr().expect("bound above");

        assert_eq!(5, a.send_to(to, b"hello").expect("send"));

        let mut buf = [0; 16];
        // nonblocking: give the datagram a moment to arrive
        let received = std::iter::repeat_with(|| {
            std::thread::sleep(std::time::Duration::from_millis(1));
            b.recv_from(&mut buf).expect("recv")
        })
        .take(100)
        .flatten()
        .next();

        let (len, _) = received.expect("datagram arrives on loopback");
        assert_eq!(b"hello", &buf[..len]);
    }
}
