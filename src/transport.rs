//! Packet transport: one message per seqpacket datagram, with ancillary
//! file descriptors riding alongside the framed payload.
//!
//! `std::os::unix::net` has no `SOCK_SEQPACKET` support, so the raw socket is
//! created and connected through `nix`; the resulting fd is then wrapped as a
//! `std::os::unix::net::UnixStream` (an unsafe but accurate reinterpretation:
//! `UnixStream` is just a thin owner of an fd, and `sendmsg`/`recvmsg` do not
//! care whether the underlying socket is `SOCK_STREAM` or `SOCK_SEQPACKET`)
//! purely to reuse `sendfd`'s `SendWithFd`/`RecvWithFd` trait impls rather
//! than hand-rolling the `cmsg` plumbing a second time.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use nix::sys::socket::{
    accept, bind, connect, getpeername, listen, socket, AddressFamily, SockFlag, SockType,
    UnixAddr,
};
use sendfd::{RecvWithFd, SendWithFd};
use std::os::unix::ffi::OsStrExt;

use crate::error::{IpcError, TransportError};
use crate::fd::Fd;

/// Header size in bytes: `num: u32-le` + `flags: u32-le`.
const HEADER_LEN: usize = 8;

/// Largest single-message payload this transport will allocate for on
/// receipt; guards against a malformed peer claiming an absurd length.
const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Largest number of ancillary FDs accepted in a single receive.
const MAX_FDS: usize = 253;

/// A framed `(num, flags, payload, fds)` unit moved across the wire in a
/// single seqpacket datagram.
#[derive(Debug)]
pub struct Frame {
    pub num: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
    pub fds: Vec<Fd>,
}

/// An abstract-or-path UNIX socket address, carried as opaque bytes. A
/// leading zero byte marks an abstract-namespace name; otherwise the bytes
/// are a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address(pub Vec<u8>);

impl Address {
    pub fn path(p: impl Into<Vec<u8>>) -> Self {
        Address(p.into())
    }

    pub fn abstract_name(name: impl AsRef<[u8]>) -> Self {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(name.as_ref());
        Address(bytes)
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.0.first(), Some(0))
    }

    /// The filesystem path this address names, if it is not abstract.
    pub fn path_bytes(&self) -> Option<&[u8]> {
        if self.is_abstract() {
            None
        } else {
            Some(&self.0)
        }
    }

    fn to_unix_addr(&self) -> Result<UnixAddr, TransportError> {
        if self.is_abstract() {
            UnixAddr::new_abstract(&self.0[1..])
                .map_err(|e| TransportError::new(format!("invalid abstract address: {e}")))
        } else {
            let path = std::str::from_utf8(&self.0)
                .map_err(|_| TransportError::new("non-UTF8 socket path"))?;
            UnixAddr::new(path).map_err(|e| TransportError::new(format!("invalid path: {e}")))
        }
    }
}

/// A seqpacket socket framed as one logical message per datagram.
#[derive(Debug)]
pub struct PacketTransport {
    stream: UnixStream,
    // Reused across `read()` calls so the reader's hot path isn't paying for
    // a fresh ~1 MiB allocation (and zero-fill) per message; only ever
    // resized up to `MAX_PAYLOAD_LEN + HEADER_LEN`, never back down.
    recv_buf: Mutex<Vec<u8>>,
}

impl PacketTransport {
    /// Create an unconnected seqpacket socket.
    pub fn create_socket() -> Result<Self, TransportError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )
        .map_err(|e| TransportError::new(format!("socket() failed: {e}")))?;
        Ok(PacketTransport {
            stream: unsafe { UnixStream::from_raw_fd(fd) },
            recv_buf: Mutex::new(Vec::new()),
        })
    }

    /// Wrap an already-connected/accepted raw seqpacket fd.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        PacketTransport {
            stream: unsafe { UnixStream::from_raw_fd(fd) },
            recv_buf: Mutex::new(Vec::new()),
        }
    }

    pub fn connect(&self, addr: &Address) -> Result<(), TransportError> {
        let unix_addr = addr.to_unix_addr()?;
        connect(self.stream.as_raw_fd(), &unix_addr)
            .map_err(|e| TransportError::new(format!("connect() failed: {e}")))
    }

    pub fn bind(&self, addr: &Address) -> Result<(), TransportError> {
        let unix_addr = addr.to_unix_addr()?;
        bind(self.stream.as_raw_fd(), &unix_addr)
            .map_err(|e| TransportError::new(format!("bind() failed: {e}")))
    }

    pub fn listen(&self, backlog: usize) -> Result<(), TransportError> {
        listen(self.stream.as_raw_fd(), backlog)
            .map_err(|e| TransportError::new(format!("listen() failed: {e}")))
    }

    /// Accept one inbound connection, returning a transport for it.
    pub fn accept(&self) -> Result<Self, TransportError> {
        let fd = accept(self.stream.as_raw_fd())
            .map_err(|e| TransportError::new(format!("accept() failed: {e}")))?;
        Ok(PacketTransport::from_raw_fd(fd))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// The peer's address, as opaque bytes using the same leading-zero
    /// convention as [`Address`]. Empty for unnamed peers.
    pub fn peer_address(&self) -> Result<Vec<u8>, TransportError> {
        let addr: UnixAddr = getpeername(self.stream.as_raw_fd())
            .map_err(|e| TransportError::new(format!("getpeername() failed: {e}")))?;
        Ok(unix_addr_to_bytes(&addr))
    }

    /// Read one complete frame. A zero-length read (peer closed cleanly) is
    /// reported as [`IpcError::Closed`] rather than a `TransportError`, per
    /// the connection layer's propagation policy.
    pub fn read(&self) -> Result<Frame, IpcError> {
        let mut buf = self.recv_buf.lock().unwrap();
        if buf.len() < MAX_PAYLOAD_LEN + HEADER_LEN {
            buf.resize(MAX_PAYLOAD_LEN + HEADER_LEN, 0);
        }
        let mut fd_buf = [0 as RawFd; MAX_FDS];
        let (n, nfds) = self
            .stream
            .recv_with_fd(&mut buf[..], &mut fd_buf)
            .map_err(map_recv_error)?;
        // Wrap every received descriptor in an owned handle before any
        // length/header check below can reject the frame: whichever error
        // path returns, these drop (and close) instead of leaking.
        let fds: Vec<Fd> = fd_buf[..nfds].iter().map(|&raw| Fd::owned(raw)).collect();
        if n == 0 && fds.is_empty() {
            return Err(IpcError::Closed);
        }
        if n < HEADER_LEN {
            return Err(TransportError::new("short read: frame smaller than header").into());
        }
        let mut header = &buf[..HEADER_LEN];
        let num = header.read_u32::<LE>().unwrap();
        let flags = header.read_u32::<LE>().unwrap();
        let payload = buf[HEADER_LEN..n].to_vec();
        Ok(Frame {
            num,
            flags,
            payload,
            fds,
        })
    }

    /// Write one complete frame. FDs are moved: ownership of each passes to
    /// the kernel (which dups it into the peer's ancillary data) and the
    /// local descriptor is closed once the send has gone out, exactly as a
    /// moved `Fd` is closed by its destructor everywhere else in the core.
    /// `sendfd::Sendable` only borrows its argument, so the close has to
    /// happen here explicitly rather than falling out of `send_with_fd`.
    pub fn write(&self, num: u32, flags: u32, payload: &[u8], fds: &mut [Fd]) -> Result<(), IpcError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.write_u32::<LE>(num).unwrap();
        buf.write_u32::<LE>(flags).unwrap();
        buf.extend_from_slice(payload);
        let raw_fds: Result<Vec<RawFd>, IpcError> = fds
            .iter_mut()
            .map(|fd| fd.take().map_err(|e| TransportError::new(e.to_string()).into()))
            .collect();
        let raw_fds = raw_fds?;
        let result: Result<(), IpcError> = self
            .stream
            .send_with_fd(&buf, &raw_fds)
            .map(|_| ())
            .map_err(|e| TransportError::from(e).into());
        for raw in raw_fds {
            let _ = nix::unistd::close(raw);
        }
        result
    }

    pub fn close(&self) -> Result<(), TransportError> {
        nix::sys::socket::shutdown(self.stream.as_raw_fd(), nix::sys::socket::Shutdown::Both)
            .or_else(|e| {
                // already closed/not connected is not an error for our purposes
                if e == nix::Error::ENOTCONN {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(|e| TransportError::new(format!("shutdown() failed: {e}")))
    }
}

fn map_recv_error(e: io::Error) -> IpcError {
    TransportError::from(e).into()
}

fn unix_addr_to_bytes(addr: &UnixAddr) -> Vec<u8> {
    if let Some(path) = addr.path() {
        path.as_os_str().as_bytes().to_vec()
    } else if let Some(name) = addr.as_abstract() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(name);
        bytes
    } else {
        Vec::new()
    }
}

impl IntoRawFd for PacketTransport {
    fn into_raw_fd(self) -> RawFd {
        self.stream.into_raw_fd()
    }
}
