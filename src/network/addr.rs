use crate::error::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Transport named by the scheme of an address string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Tcp4 => "tcp4",
            Transport::Tcp6 => "tcp6",
            Transport::Unix => "unix",
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Transport::Unix)
    }

    fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme {
            "tcp" => Ok(Transport::Tcp),
            "tcp4" => Ok(Transport::Tcp4),
            "tcp6" => Ok(Transport::Tcp6),
            "unix" => Ok(Transport::Unix),
            other => Err(Error::Address(format!("unsupported scheme '{}'", other))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed listen address: `[scheme://]host:port[?reuseport=<bool>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub transport: Transport,
    /// `host:port` for TCP, a filesystem path for Unix sockets
    pub address: String,
    pub reuse_port: bool,
}

impl ListenAddr {
    pub fn parse(s: &str) -> Result<Self> {
        let (transport, rest) = match s.find("://") {
            Some(pos) => (Transport::from_scheme(&s[..pos])?, &s[pos + 3..]),
            None => (Transport::Tcp, s),
        };

        let (address, query) = match rest.find('?') {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };

        if address.is_empty() {
            return Err(Error::Address(format!("missing address in '{}'", s)));
        }

        let mut reuse_port = false;
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if key == "reuseport" {
                    reuse_port = parse_bool_flag(value);
                }
            }
        }

        Ok(Self {
            transport,
            address: address.to_string(),
            reuse_port,
        })
    }
}

impl FromStr for ListenAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)?;
        if self.reuse_port {
            f.write_str("?reuseport=true")?;
        }
        Ok(())
    }
}

/// Leading-character boolean used by the `reuseport` query flag
///
/// A non-zero leading digit or a leading `T`/`t`/`Y`/`y` is true, anything
/// else (including the empty string) is false.
pub fn parse_bool_flag(value: &str) -> bool {
    match value.bytes().next() {
        Some(b'1'..=b'9') => true,
        Some(b'T' | b't' | b'Y' | b'y') => true,
        _ => false,
    }
}

/// A bound or peer socket address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp(SocketAddr),
    /// Unix peers are usually unnamed, hence the `Option`
    Unix(Option<PathBuf>),
}

impl Addr {
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Addr::Tcp(addr) => Some(*addr),
            Addr::Unix(_) => None,
        }
    }

    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            Addr::Unix(path) => path.as_ref(),
            Addr::Tcp(_) => None,
        }
    }

    pub(crate) fn from_unix(addr: &std::os::unix::net::SocketAddr) -> Self {
        Addr::Unix(addr.as_pathname().map(PathBuf::from))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(addr) => write!(f, "{}", addr),
            Addr::Unix(Some(path)) => write!(f, "{}", path.display()),
            Addr::Unix(None) => f.write_str("@unnamed"),
        }
    }
}
