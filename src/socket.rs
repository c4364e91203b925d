//! Raw outbound sockets.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::io;
use std::net::SocketAddr;

//------------ ConnectPoll ----------------------------------------------------

/// Classification of a single non-blocking connect attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectPoll {
    /// The socket is connected.
    Success,

    /// The attempt has been issued but has not completed yet.
    ///
    /// The caller should wait for the socket to become writable and then
    /// poll the attempt again.
    InProgress,

    /// The attempt failed definitively.
    ///
    /// Carries the raw OS error of the failure.
    Failed(i32),
}

//------------ SocketLayer ----------------------------------------------------

/// Access to policy-free socket primitives.
///
/// The connect job decides what to do with each classification; this layer
/// only issues the syscalls. A socket handed out by [`open`][Self::open] is
/// exclusively owned by the caller until it is returned through
/// [`close`][Self::close] or handed on to someone else.
pub trait SocketLayer {
    /// The type of an owned, not necessarily connected socket.
    type Socket: Send + 'static;

    /// Opens a new non-blocking socket suitable for connecting to `target`.
    fn open(&self, target: SocketAddr) -> Result<Self::Socket, io::Error>;

    /// Issues a non-blocking connect towards `target` and classifies the
    /// result.
    ///
    /// Polling an attempt that is already under way is fine; the layer maps
    /// the resulting errno back onto [`ConnectPoll`].
    fn connect(
        &self,
        socket: &mut Self::Socket,
        target: SocketAddr,
    ) -> ConnectPoll;

    /// Returns the local address of a connected socket.
    fn local_addr(&self, socket: &Self::Socket)
        -> Result<SocketAddr, io::Error>;

    /// Closes a socket the caller is abandoning.
    fn close(&self, socket: Self::Socket);
}

//------------ OsSocket -------------------------------------------------------

#[cfg(unix)]
mod os {
    use super::{ConnectPoll, SocketLayer};
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use std::io;
    use std::net::SocketAddr;

    /// The socket layer backed by the operating system.
    ///
    /// Outbound sockets have no need to be protocol agnostic, so the domain
    /// is picked from the address family of the target.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct OsSocket;

    impl SocketLayer for OsSocket {
        type Socket = Socket;

        fn open(&self, target: SocketAddr) -> Result<Socket, io::Error> {
            let socket = Socket::new(
                Domain::for_address(target),
                Type::STREAM,
                Some(Protocol::TCP),
            )?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        }

        fn connect(
            &self,
            socket: &mut Socket,
            target: SocketAddr,
        ) -> ConnectPoll {
            match socket.connect(&SockAddr::from(target)) {
                Ok(()) => ConnectPoll::Success,
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINPROGRESS)
                    | Some(libc::EALREADY)
                    | Some(libc::EAGAIN)
                    | Some(libc::EINTR) => ConnectPoll::InProgress,
                    // Polling a completed attempt reports EISCONN.
                    Some(libc::EISCONN) => ConnectPoll::Success,
                    Some(errno) => ConnectPoll::Failed(errno),
                    None => ConnectPoll::Failed(libc::EIO),
                },
            }
        }

        fn local_addr(
            &self,
            socket: &Socket,
        ) -> Result<SocketAddr, io::Error> {
            socket.local_addr()?.as_socket().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Other,
                    "socket has no IP local address",
                )
            })
        }

        fn close(&self, socket: Socket) {
            drop(socket);
        }
    }
}

#[cfg(unix)]
pub use self::os::OsSocket;
