use crate::network::{Addr, Conn, DetachedStream};
use bytes::{Bytes, BytesMut};
use std::io;
use std::ops::Deref;
use std::time::Duration;

/// What the event loop should do with a connection (or the server) next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    None,
    /// Hand the raw stream to [`EventHandler::detached`]
    Detach,
    /// Close the connection once pending output is flushed
    Close,
    /// Stop the whole server
    Shutdown,
}

/// Per-connection options returned from [`EventHandler::opened`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Enable TCP keep-alive with this probe interval (ignored for Unix sockets)
    pub tcp_keep_alive: Option<Duration>,
    /// Borrow input straight from the loop's scratch buffer instead of
    /// receiving a private copy
    pub reuse_input_buffer: bool,
}

/// Bytes received on a connection
///
/// `Shared` borrows the loop's scratch buffer and is only valid for the
/// duration of the callback; the next read on that loop overwrites it.
/// `Owned` is a private copy that can be kept with a cheap clone.
#[derive(Debug, Clone)]
pub enum Input<'a> {
    Shared(&'a [u8]),
    Owned(Bytes),
}

impl Input<'_> {
    pub fn is_shared(&self) -> bool {
        matches!(self, Input::Shared(_))
    }

    /// Take ownership of the bytes, copying only when they are shared
    pub fn into_bytes(self) -> Bytes {
        match self {
            Input::Shared(data) => Bytes::copy_from_slice(data),
            Input::Owned(data) => data,
        }
    }
}

impl Deref for Input<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Input::Shared(data) => data,
            Input::Owned(data) => data,
        }
    }
}

/// Read-only metadata passed to [`EventHandler::serving`]
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Bound addresses, in configuration order
    pub addrs: Vec<Addr>,
    pub num_loops: usize,
}

/// Application callbacks invoked by the event loops
///
/// All methods have no-op defaults. Callbacks for one connection always run
/// on that connection's loop thread, in order: `accepted`, `opened`, then any
/// mix of `data`/`pre_write`/`written`, and finally exactly one of `closed`
/// or `detached`.
pub trait EventHandler: Send + Sync + 'static {
    /// Protocol-layer state attached to each connection
    type Client: Send + 'static;

    /// Called once before any loop starts; `Shutdown` aborts startup
    fn serving(&self, _info: &ServerInfo) -> Action {
        Action::None
    }

    /// Called for every accepted socket. Returning no client, or any action
    /// other than `None`, drops the connection.
    fn accepted(&self, conn: &Conn, unix: bool) -> (Option<Self::Client>, Action);

    /// First readiness after accept. May queue initial output.
    fn opened(
        &self,
        _conn: &Conn,
        _client: &mut Self::Client,
        _out: &mut BytesMut,
    ) -> (Options, Action) {
        (Options::default(), Action::None)
    }

    /// Bytes arrived, or `input` is `None` when the connection was woken
    fn data(
        &self,
        _conn: &Conn,
        _client: &mut Self::Client,
        _input: Option<Input<'_>>,
        _out: &mut BytesMut,
    ) -> Action {
        Action::None
    }

    /// Runs right before each write attempt
    fn pre_write(&self, _conn: &Conn, _client: &mut Self::Client) {}

    /// `n` bytes were written. A non-`None` result replaces the pending action.
    fn written(&self, _conn: &Conn, _client: &mut Self::Client, _n: usize) -> Action {
        Action::None
    }

    /// Periodic callback on loop 0. Return the delay until the next tick, or
    /// `None` to stop ticking. The default never ticks.
    fn tick(&self) -> Option<(Duration, Action)> {
        None
    }

    /// The connection is gone. `err` is `None` on a graceful close.
    fn closed(&self, _conn: &Conn, _client: Self::Client, _err: Option<io::Error>) -> Action {
        Action::None
    }

    /// The connection left the loop; `stream` is now owned by the callee
    fn detached(&self, _conn: &Conn, _client: Self::Client, _stream: DetachedStream) -> Action {
        Action::None
    }

    /// Called once after every loop stopped and every listener closed
    fn shutdown(&self) {}
}
