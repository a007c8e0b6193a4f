use super::addr::Addr;
use crate::error::Result;
use crate::event::Action;
use crate::io::{Note, Notifier};
use bytes::BytesMut;
use nix::sys::socket::{setsockopt, sockopt};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Accepted stream socket, TCP or Unix-domain
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub fn fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Socket::Unix(_))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_nonblocking(nonblocking),
            Socket::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn local_addr(&self) -> io::Result<Addr> {
        match self {
            Socket::Tcp(s) => s.local_addr().map(Addr::Tcp),
            Socket::Unix(s) => s.local_addr().map(|a| Addr::from_unix(&a)),
        }
    }

    /// Enable TCP keep-alive probing; a no-op for Unix sockets
    pub fn set_keep_alive(&self, interval: Duration) -> Result<()> {
        let Socket::Tcp(stream) = self else {
            return Ok(());
        };

        setsockopt(stream, sockopt::KeepAlive, &true)?;

        let secs = interval.as_secs().clamp(1, u32::MAX as u64) as u32;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            setsockopt(stream, sockopt::TcpKeepIdle, &secs)?;
            setsockopt(stream, sockopt::TcpKeepInterval, &secs)?;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        setsockopt(stream, sockopt::TcpKeepAlive, &secs)?;
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        )))]
        let _ = secs;

        Ok(())
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            Socket::Unix(s) => s.flush(),
        }
    }
}

/// Blocking stream handed to the application when a connection is detached
///
/// The event loop no longer polls or closes it; ownership is entirely the
/// receiver's.
#[derive(Debug)]
pub enum DetachedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl DetachedStream {
    pub(crate) fn from_socket(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(false)?;
        Ok(match socket {
            Socket::Tcp(s) => DetachedStream::Tcp(s),
            Socket::Unix(s) => DetachedStream::Unix(s),
        })
    }
}

impl Read for DetachedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DetachedStream::Tcp(s) => s.read(buf),
            DetachedStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for DetachedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DetachedStream::Tcp(s) => s.write(buf),
            DetachedStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DetachedStream::Tcp(s) => s.flush(),
            DetachedStream::Unix(s) => s.flush(),
        }
    }
}

/// Wakes one connection from any thread
///
/// The owning loop answers with a `data` call carrying no input. Waking a
/// connection that has since closed is silently ignored.
#[derive(Clone)]
pub struct ConnWaker {
    fd: RawFd,
    id: u64,
    notifier: Arc<Notifier>,
}

impl ConnWaker {
    pub fn wake(&self) -> Result<()> {
        self.notifier.notify(Note::Wake {
            fd: self.fd,
            id: self.id,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for ConnWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnWaker")
            .field("fd", &self.fd)
            .field("id", &self.id)
            .finish()
    }
}

/// Read-only view of a connection handed to every callback
pub struct Conn {
    id: u64,
    fd: RawFd,
    loop_index: usize,
    listener: usize,
    unix: bool,
    local: Option<Addr>,
    remote: Option<Addr>,
    notifier: Arc<Notifier>,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        loop_index: usize,
        listener: usize,
        unix: bool,
        notifier: Arc<Notifier>,
    ) -> Self {
        static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            loop_index,
            listener,
            unix,
            local: None,
            remote: None,
            notifier,
        }
    }

    /// Process-wide unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Index of the loop that owns this connection for its whole life
    pub fn loop_index(&self) -> usize {
        self.loop_index
    }

    /// Index of the listener (in configuration order) that accepted it
    pub fn listener_index(&self) -> usize {
        self.listener
    }

    pub fn is_unix(&self) -> bool {
        self.unix
    }

    /// Local address, resolved when the connection opens
    pub fn local_addr(&self) -> Option<&Addr> {
        self.local.as_ref()
    }

    /// Peer address, resolved when the connection opens
    pub fn remote_addr(&self) -> Option<&Addr> {
        self.remote.as_ref()
    }

    pub fn waker(&self) -> ConnWaker {
        ConnWaker {
            fd: self.fd,
            id: self.id,
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("loop_index", &self.loop_index)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Per-socket state owned by exactly one event loop
pub(crate) struct Connection<C> {
    pub socket: Socket,
    pub client: C,
    pub info: Conn,
    /// Pending output, drained by the write path
    pub out: BytesMut,
    pub action: Action,
    pub opened: bool,
    /// Read straight from the loop's scratch buffer instead of a private copy
    pub reuse_input: bool,
    /// Peer address captured at accept, moved into `info` on open
    raw_remote: Option<Addr>,
}

impl<C> Connection<C> {
    pub fn new(socket: Socket, client: C, info: Conn, raw_remote: Addr) -> Self {
        Self {
            socket,
            client,
            info,
            out: BytesMut::new(),
            action: Action::None,
            opened: false,
            reuse_input: false,
            raw_remote: Some(raw_remote),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// Mark opened and cache the local and remote addresses
    pub fn open(&mut self) {
        self.opened = true;
        self.info.remote = self.raw_remote.take();
        self.info.local = self.socket.local_addr().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Poller;
    use std::net::TcpListener;

    #[test]
    fn test_detached_stream_is_blocking_and_usable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut detached = DetachedStream::from_socket(Socket::Unix(a)).unwrap();
        b.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        detached.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(matches!(detached, DetachedStream::Unix(_)));
    }

    #[test]
    fn test_keep_alive_on_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let socket = Socket::Tcp(stream);
        socket.set_keep_alive(Duration::from_secs(30)).unwrap();

        let Socket::Tcp(stream) = &socket else {
            unreachable!()
        };
        assert!(nix::sys::socket::getsockopt(stream, sockopt::KeepAlive).unwrap());
    }

    #[test]
    fn test_keep_alive_ignored_on_unix() {
        let (a, _b) = UnixStream::pair().unwrap();
        Socket::Unix(a)
            .set_keep_alive(Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn test_open_caches_addresses() {
        let poller = Poller::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let socket = Socket::Unix(a);
        let fd = socket.fd();
        let info = Conn::new(fd, 0, 0, true, poller.notifier());
        let first_id = info.id();

        let mut conn = Connection::new(socket, (), info, Addr::Unix(None));
        assert!(conn.info.remote_addr().is_none());

        conn.open();
        assert!(conn.opened);
        assert_eq!(conn.info.remote_addr(), Some(&Addr::Unix(None)));
        assert!(conn.info.local_addr().is_some());

        let other = Conn::new(fd, 0, 0, true, poller.notifier());
        assert!(other.id() > first_id);
        assert_eq!(conn.info.waker().id(), first_id);
    }
}
