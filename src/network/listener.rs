use super::addr::{Addr, ListenAddr, Transport};
use super::connection::Socket;
use crate::error::{Error, Result};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrStorage,
};
use std::fs;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 1024;

enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bound, non-blocking listening socket
///
/// Shared read-only by every event loop; all of them register its
/// descriptor and race to accept. Dropping it closes the socket and removes
/// the filesystem path of a Unix listener.
pub struct Listener {
    socket: ListenSocket,
    addr: Addr,
}

impl Listener {
    pub fn bind(spec: &ListenAddr) -> Result<Self> {
        let listener = if spec.transport.is_unix() {
            Self::bind_unix(spec)?
        } else {
            Self::bind_tcp(spec)?
        };
        info!("Listening on {}://{}", spec.transport, listener.addr);
        Ok(listener)
    }

    fn bind_tcp(spec: &ListenAddr) -> Result<Self> {
        let addr = resolve(spec)?;

        let listener = if spec.reuse_port {
            bind_reuse_port(addr)?
        } else {
            TcpListener::bind(addr)?
        };

        // Every later operation on the socket is multiplexed
        listener.set_nonblocking(true)?;
        let addr = Addr::Tcp(listener.local_addr()?);

        Ok(Self {
            socket: ListenSocket::Tcp(listener),
            addr,
        })
    }

    fn bind_unix(spec: &ListenAddr) -> Result<Self> {
        let path = PathBuf::from(&spec.address);

        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket file {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if spec.reuse_port {
            debug!("reuseport has no effect on unix socket {}", path.display());
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            socket: ListenSocket::Unix(listener),
            addr: Addr::Unix(Some(path)),
        })
    }

    pub fn fd(&self) -> RawFd {
        match &self.socket {
            ListenSocket::Tcp(l) => l.as_raw_fd(),
            ListenSocket::Unix(l) => l.as_raw_fd(),
        }
    }

    /// Address the socket is actually bound to (the real port for `:0`)
    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    /// Accept one pending connection
    ///
    /// Returns `WouldBlock` when the backlog is empty, which is also what a
    /// loop sees after losing the accept race to a peer.
    pub fn accept(&self) -> io::Result<(Socket, Addr)> {
        match &self.socket {
            ListenSocket::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                Ok((Socket::Tcp(stream), Addr::Tcp(addr)))
            }
            ListenSocket::Unix(l) => {
                let (stream, addr) = l.accept()?;
                Ok((Socket::Unix(stream), Addr::from_unix(&addr)))
            }
        }
    }

    /// Close the socket, removing the path of a Unix listener
    pub fn close(self) {
        debug!("Closing listener {}", self.addr);
        drop(self);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.addr.as_path() {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove socket file {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn resolve(spec: &ListenAddr) -> Result<SocketAddr> {
    spec.address
        .to_socket_addrs()?
        .find(|addr| match spec.transport {
            Transport::Tcp4 => addr.is_ipv4(),
            Transport::Tcp6 => addr.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| {
            Error::Address(format!(
                "no {} address found for '{}'",
                spec.transport, spec.address
            ))
        })
}

/// Bind with SO_REUSEPORT so several sockets can share the port
fn bind_reuse_port(addr: SocketAddr) -> Result<TcpListener> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    setsockopt(&fd, sockopt::ReusePort, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;

    Ok(TcpListener::from(fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    fn accept_eventually(listener: &Listener) -> (Socket, Addr) {
        for _ in 0..100 {
            match listener.accept() {
                Ok(pair) => return pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
        panic!("no connection accepted");
    }

    #[test]
    fn test_bind_tcp_ephemeral_port() {
        let spec = ListenAddr::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&spec).unwrap();
        let addr = listener.addr().as_socket_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(listener.addr().as_path().is_none());

        // Non-blocking: nothing pending yet
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let _client = TcpStream::connect(addr).unwrap();
        let (socket, peer) = accept_eventually(&listener);
        assert!(!socket.is_unix());
        assert!(matches!(peer, Addr::Tcp(_)));
    }

    #[test]
    fn test_bind_reuse_port_twice() {
        let spec = ListenAddr::parse("tcp://127.0.0.1:0?reuseport=1").unwrap();
        let first = Listener::bind(&spec).unwrap();
        let port = first.addr().as_socket_addr().unwrap().port();

        let spec = ListenAddr::parse(&format!("tcp://127.0.0.1:{}?reuseport=1", port)).unwrap();
        let second = Listener::bind(&spec).unwrap();
        assert_eq!(second.addr().as_socket_addr().unwrap().port(), port);
    }

    #[test]
    fn test_tcp6_rejects_ipv4_host() {
        let spec = ListenAddr::parse("tcp6://127.0.0.1:0").unwrap();
        assert!(matches!(Listener::bind(&spec), Err(Error::Address(_))));
    }

    #[test]
    fn test_unix_replaces_stale_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feox.sock");
        fs::write(&path, b"stale").unwrap();

        let spec = ListenAddr::parse(&format!("unix://{}", path.display())).unwrap();
        let listener = Listener::bind(&spec).unwrap();
        assert_eq!(listener.addr(), &Addr::Unix(Some(path.clone())));
        assert_eq!(listener.addr().as_path(), Some(&path));

        let _client = UnixStream::connect(&path).unwrap();
        let (socket, _) = accept_eventually(&listener);
        assert!(socket.is_unix());

        listener.close();
        assert!(!path.exists());
    }
}
