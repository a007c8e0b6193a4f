//! Per-thread readiness loop: accept, open, read, write, close and detach
//!
//! Every connection is owned by the loop that accepted it, so dispatch never
//! locks. The only state shared across loops lives in [`Shared`]: the live
//! connection counters and the accept counter used for balancing.

use crate::balance::{self, LoadBalance};
use crate::error::{Error, Result};
use crate::event::{Action, EventHandler, Input};
use crate::io::{Note, Notifier, Poller, Ready, Registrar};
use crate::network::connection::Connection;
use crate::network::{Addr, Conn, DetachedStream, Listener, Socket};
use crate::server::Shared;
use bytes::{Buf, Bytes};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// One poller plus the connections it owns
pub(crate) struct EventLoop<H: EventHandler> {
    poller: Poller,
    state: LoopState<H>,
}

struct LoopState<H: EventHandler> {
    index: usize,
    /// Scratch read buffer shared by every connection on this loop
    buf: Vec<u8>,
    conns: HashMap<RawFd, Connection<H::Client>>,
    listeners: Arc<Vec<Listener>>,
    /// Notifier of every loop, indexed by loop index (ours included)
    peers: Arc<[Arc<Notifier>]>,
    handler: Arc<H>,
    shared: Arc<Shared>,
    ticker: Option<Ticker>,
}

impl<H: EventHandler> EventLoop<H> {
    pub fn new(
        index: usize,
        poller: Poller,
        peers: Arc<[Arc<Notifier>]>,
        listeners: Arc<Vec<Listener>>,
        handler: Arc<H>,
        shared: Arc<Shared>,
        read_buffer_size: usize,
    ) -> Result<Self> {
        // Every loop races on every listener
        for listener in listeners.iter() {
            poller.add_read(listener.fd())?;
        }

        Ok(Self {
            poller,
            state: LoopState {
                index,
                buf: vec![0u8; read_buffer_size],
                conns: HashMap::new(),
                listeners,
                peers,
                handler,
                shared,
                ticker: None,
            },
        })
    }

    pub fn index(&self) -> usize {
        self.state.index
    }

    /// Run until a loop-fatal error or a shutdown note
    ///
    /// Returns `Error::Shutdown` on an orderly stop.
    pub fn run(&mut self) -> Result<()> {
        info!("Loop {} started", self.state.index);

        let result = self.run_inner();
        self.state.stop_ticker();

        info!(
            "Loop {} stopped with {} open connections",
            self.state.index,
            self.state.conns.len()
        );
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        if self.state.index == 0 {
            self.state.on_tick()?;
        }

        let state = &mut self.state;
        self.poller
            .wait(|registrar, ready| state.dispatch(registrar, ready))
    }

    /// Force-close every remaining connection, then release the poller
    pub fn close(&mut self) {
        if self.poller.is_closed() {
            return;
        }

        match self.poller.registrar() {
            Ok(registrar) => {
                let fds: Vec<RawFd> = self.state.conns.keys().copied().collect();
                for fd in fds {
                    if let Err(e) = self.state.close(&registrar, fd, None) {
                        if !e.is_shutdown() {
                            warn!("Loop {}: closing fd {} failed: {}", self.state.index, fd, e);
                        }
                    }
                }
            }
            Err(e) => warn!("Loop {}: {}", self.state.index, e),
        }

        self.poller.close();
    }
}

impl<H: EventHandler> LoopState<H> {
    fn dispatch(&mut self, registrar: &Registrar<'_>, ready: Ready) -> Result<()> {
        match ready {
            Ready::Note(note) => self.on_note(registrar, note),
            Ready::Fd(fd) => self.on_ready(registrar, fd),
        }
    }

    fn on_note(&mut self, registrar: &Registrar<'_>, note: Note) -> Result<()> {
        match note {
            Note::Tick => self.on_tick(),
            Note::Wake { fd, id } => self.wake(registrar, fd, id),
            // A nudge does not say which backlog moved; the turn may have
            // passed to us on any of them.
            Note::Accept => {
                for listener in 0..self.listeners.len() {
                    self.accept(registrar, listener)?;
                }
                Ok(())
            }
            Note::Shutdown => Err(Error::Shutdown),
        }
    }

    fn on_ready(&mut self, registrar: &Registrar<'_>, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.get(&fd) else {
            return match self.listener_index(fd) {
                Some(listener) => self.accept(registrar, listener),
                // Stale event for a descriptor closed earlier in this pass
                None => Ok(()),
            };
        };

        if !conn.opened {
            self.open(registrar, fd)
        } else if !conn.out.is_empty() {
            self.write(registrar, fd)
        } else if conn.action != Action::None {
            self.action(registrar, fd)
        } else {
            self.read(registrar, fd)
        }
    }

    fn listener_index(&self, fd: RawFd) -> Option<usize> {
        self.listeners.iter().position(|l| l.fd() == fd)
    }

    fn on_tick(&mut self) -> Result<()> {
        match self.handler.tick() {
            Some((_, Action::Shutdown)) => {
                self.stop_ticker();
                Err(Error::Shutdown)
            }
            Some((delay, _)) => {
                if self.ticker.is_none() {
                    self.ticker = Some(Ticker::spawn(Arc::clone(&self.peers[self.index]))?);
                }
                if let Some(ticker) = &self.ticker {
                    ticker.schedule(delay);
                }
                Ok(())
            }
            None => {
                self.stop_ticker();
                Ok(())
            }
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
    }

    fn accept(&mut self, registrar: &Registrar<'_>, listener: usize) -> Result<()> {
        let policy = self.shared.balance;
        let num_loops = self.peers.len();

        loop {
            if !balance::should_accept(
                policy,
                self.index,
                &self.shared.conn_counts,
                &self.shared.accepted,
            ) {
                trace!("Loop {} yields accept to its peers", self.index);
                return Ok(());
            }

            let (socket, raw_remote) = match self.listeners[listener].accept() {
                Ok(pair) => pair,
                // Empty backlog, or a peer loop won the race
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if e.kind() == ErrorKind::Interrupted
                        || e.kind() == ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => {
                    warn!("Loop {}: error accepting connection: {}", self.index, e);
                    return Ok(());
                }
            };

            if policy == LoadBalance::RoundRobin {
                self.shared.accepted.fetch_add(1, Ordering::AcqRel);
            }

            self.register(registrar, listener, socket, raw_remote);

            // Readiness is edge-triggered: peers that yielded on this edge
            // will not hear about the rest of the backlog unless told.
            if num_loops > 1 && policy != LoadBalance::Random {
                self.nudge_peers();
            }
        }
    }

    fn nudge_peers(&self) {
        let targets: Vec<usize> = match self.shared.balance {
            LoadBalance::RoundRobin => {
                vec![self.shared.accepted.load(Ordering::Acquire) % self.peers.len()]
            }
            LoadBalance::LeastConnections => (0..self.peers.len()).collect(),
            LoadBalance::Random => Vec::new(),
        };

        for target in targets.into_iter().filter(|&i| i != self.index) {
            if let Err(e) = self.peers[target].notify(Note::Accept) {
                debug!("Loop {}: nudging loop {} failed: {}", self.index, target, e);
            }
        }
    }

    fn register(
        &mut self,
        registrar: &Registrar<'_>,
        listener: usize,
        socket: Socket,
        raw_remote: Addr,
    ) {
        let fd = socket.fd();
        if let Err(e) = socket.set_nonblocking(true) {
            warn!("Loop {}: set_nonblocking on fd {} failed: {}", self.index, fd, e);
            return;
        }

        let unix = socket.is_unix();
        let info = Conn::new(
            fd,
            self.index,
            listener,
            unix,
            Arc::clone(&self.peers[self.index]),
        );

        // Writable right away so the first event opens the connection
        if let Err(e) = registrar.add_read_write(fd) {
            warn!("Loop {}: registering fd {} failed: {}", self.index, fd, e);
            return;
        }

        let client = match self.handler.accepted(&info, unix) {
            (Some(client), Action::None) => client,
            _ => {
                debug!("Loop {}: connection from {} declined", self.index, raw_remote);
                if let Err(e) = registrar.remove_and_detach(fd) {
                    debug!("Loop {}: deregistering fd {} failed: {}", self.index, fd, e);
                }
                // Dropping the socket closes the descriptor
                return;
            }
        };

        debug!(
            "Loop {}: accepted connection {} from {}",
            self.index,
            info.id(),
            raw_remote
        );
        self.conns
            .insert(fd, Connection::new(socket, client, info, raw_remote));
        self.shared.conn_counts[self.index].fetch_add(1, Ordering::AcqRel);
    }

    fn open(&mut self, registrar: &Registrar<'_>, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };

        conn.open();
        let (options, action) = self
            .handler
            .opened(&conn.info, &mut conn.client, &mut conn.out);

        conn.reuse_input = options.reuse_input_buffer;
        conn.action = action;
        if let Some(interval) = options.tcp_keep_alive {
            if let Err(e) = conn.socket.set_keep_alive(interval) {
                warn!("Loop {}: keep-alive on fd {} failed: {}", self.index, fd, e);
            }
        }

        debug!("Loop {}: connection {} opened", self.index, conn.info.id());
        rearm(registrar, conn);
        Ok(())
    }

    fn action(&mut self, registrar: &Registrar<'_>, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };

        match std::mem::take(&mut conn.action) {
            Action::Close => self.close(registrar, fd, None),
            Action::Detach => self.detach(registrar, fd),
            Action::Shutdown => Err(Error::Shutdown),
            Action::None => {
                rearm(registrar, conn);
                Ok(())
            }
        }
    }

    fn read(&mut self, registrar: &Registrar<'_>, fd: RawFd) -> Result<()> {
        loop {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };

            let n = match conn.socket.read(&mut self.buf) {
                Ok(0) => return self.close(registrar, fd, None),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.close(registrar, fd, Some(e)),
            };

            let input = if conn.reuse_input {
                Input::Shared(&self.buf[..n])
            } else {
                Input::Owned(Bytes::copy_from_slice(&self.buf[..n]))
            };

            conn.action = self
                .handler
                .data(&conn.info, &mut conn.client, Some(input), &mut conn.out);

            // Output or a pending action takes over; the write path runs next
            if !conn.out.is_empty() || conn.action != Action::None {
                rearm(registrar, conn);
                return Ok(());
            }
        }
    }

    fn write(&mut self, registrar: &Registrar<'_>, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };

        self.handler.pre_write(&conn.info, &mut conn.client);

        let mut written = 0;
        let mut failure = None;
        while !conn.out.is_empty() {
            match conn.socket.write(&conn.out) {
                Ok(0) => {
                    failure = Some(io::Error::from(ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => {
                    conn.out.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            return self.close(registrar, fd, Some(err));
        }

        if written > 0 {
            let action = self.handler.written(&conn.info, &mut conn.client, written);
            if action != Action::None {
                conn.action = action;
            }
        }

        // A partial write stays registered for write-readiness
        if conn.out.is_empty() {
            rearm(registrar, conn);
        }
        Ok(())
    }

    fn wake(&mut self, registrar: &Registrar<'_>, fd: RawFd, id: u64) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };
        if conn.info.id() != id || !conn.opened {
            trace!("Loop {}: ignoring wake for connection {}", self.index, id);
            return Ok(());
        }

        let action = self
            .handler
            .data(&conn.info, &mut conn.client, None, &mut conn.out);
        if action != Action::None {
            conn.action = action;
        }

        if !conn.out.is_empty() || conn.action != Action::None {
            rearm(registrar, conn);
        }
        Ok(())
    }

    /// Tear down a connection; a no-op when `fd` is no longer in the table
    fn close(&mut self, registrar: &Registrar<'_>, fd: RawFd, err: Option<io::Error>) -> Result<()> {
        let Some(conn) = self.conns.remove(&fd) else {
            return Ok(());
        };
        self.shared.conn_counts[self.index].fetch_sub(1, Ordering::AcqRel);

        if let Err(e) = registrar.remove_and_detach(fd) {
            debug!("Loop {}: deregistering fd {} failed: {}", self.index, fd, e);
        }

        let Connection {
            socket,
            client,
            info,
            ..
        } = conn;
        drop(socket);

        match &err {
            Some(e) => debug!("Loop {}: connection {} closed: {}", self.index, info.id(), e),
            None => debug!("Loop {}: connection {} closed", self.index, info.id()),
        }

        match self.handler.closed(&info, client, err) {
            Action::Shutdown => Err(Error::Shutdown),
            _ => Ok(()),
        }
    }

    fn detach(&mut self, registrar: &Registrar<'_>, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.remove(&fd) else {
            return Ok(());
        };
        self.shared.conn_counts[self.index].fetch_sub(1, Ordering::AcqRel);

        if let Err(e) = registrar.remove_and_detach(fd) {
            debug!("Loop {}: deregistering fd {} failed: {}", self.index, fd, e);
        }

        let Connection {
            socket,
            client,
            info,
            ..
        } = conn;

        let action = match DetachedStream::from_socket(socket) {
            Ok(stream) => {
                debug!("Loop {}: connection {} detached", self.index, info.id());
                self.handler.detached(&info, client, stream)
            }
            Err(e) => {
                error!("Loop {}: detaching connection {} failed: {}", self.index, info.id(), e);
                self.handler.closed(&info, client, Some(e))
            }
        };

        match action {
            Action::Shutdown => Err(Error::Shutdown),
            _ => Ok(()),
        }
    }
}

/// Downgrade to read interest when nothing is pending, otherwise re-arm
/// read/write so the write or action path runs on the next pass
fn rearm<C>(registrar: &Registrar<'_>, conn: &Connection<C>) {
    let fd = conn.fd();
    let result = if conn.out.is_empty() && conn.action == Action::None {
        registrar.mod_read(fd)
    } else {
        registrar.mod_read_write(fd)
    };

    if let Err(e) = result {
        warn!("Updating interest for fd {} failed: {}", fd, e);
    }
}

/// Background thread that posts `Note::Tick` after each requested delay
struct Ticker {
    delays: Sender<Duration>,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn spawn(notifier: Arc<Notifier>) -> Result<Self> {
        let (tx, rx) = unbounded::<Duration>();

        let handle = thread::Builder::new()
            .name("feox-ticker".to_string())
            .spawn(move || loop {
                let Ok(delay) = rx.recv() else {
                    return;
                };
                // Sleeps `delay` unless the loop hangs up first
                match rx.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return,
                }
                if notifier.notify(Note::Tick).is_err() {
                    return;
                }
            })?;

        Ok(Self { delays: tx, handle })
    }

    fn schedule(&self, delay: Duration) {
        if self.delays.send(delay).is_err() {
            debug!("Ticker thread gone, tick in {:?} dropped", delay);
        }
    }

    fn stop(self) {
        drop(self.delays);
        if self.handle.join().is_err() {
            error!("Ticker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        closed: AtomicUsize,
        detached: AtomicUsize,
    }

    impl EventHandler for Counting {
        type Client = ();

        fn accepted(&self, _conn: &Conn, _unix: bool) -> (Option<()>, Action) {
            (Some(()), Action::None)
        }

        fn closed(&self, _conn: &Conn, _client: (), _err: Option<io::Error>) -> Action {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Action::None
        }

        fn detached(&self, _conn: &Conn, _client: (), _stream: DetachedStream) -> Action {
            self.detached.fetch_add(1, Ordering::SeqCst);
            Action::None
        }
    }

    fn event_loop() -> (EventLoop<Counting>, Arc<Counting>, Arc<Shared>) {
        let poller = Poller::new(64).unwrap();
        let peers: Arc<[Arc<Notifier>]> = vec![poller.notifier()].into();
        let handler = Arc::new(Counting::default());
        let shared = Arc::new(Shared::new(1, LoadBalance::Random));

        let event_loop = EventLoop::new(
            0,
            poller,
            peers,
            Arc::new(Vec::new()),
            Arc::clone(&handler),
            Arc::clone(&shared),
            1024,
        )
        .unwrap();
        (event_loop, handler, shared)
    }

    /// Register one end of a socket pair, returning its fd and the peer end
    fn add_conn(event_loop: &mut EventLoop<Counting>) -> (RawFd, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let socket = Socket::Unix(ours);
        let fd = socket.fd();

        let registrar = event_loop.poller.registrar().unwrap();
        event_loop
            .state
            .register(&registrar, 0, socket, Addr::Unix(None));
        (fd, theirs)
    }

    #[test]
    fn test_close_twice_counts_once() {
        let (mut event_loop, handler, shared) = event_loop();
        let (fd, _peer) = add_conn(&mut event_loop);
        assert_eq!(shared.conn_counts[0].load(Ordering::SeqCst), 1);

        let registrar = event_loop.poller.registrar().unwrap();
        event_loop.state.close(&registrar, fd, None).unwrap();
        event_loop.state.close(&registrar, fd, None).unwrap();

        assert_eq!(shared.conn_counts[0].load(Ordering::SeqCst), 0);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert!(event_loop.state.conns.is_empty());
    }

    #[test]
    fn test_detach_twice_counts_once() {
        let (mut event_loop, handler, shared) = event_loop();
        let (fd, _peer) = add_conn(&mut event_loop);

        let registrar = event_loop.poller.registrar().unwrap();
        event_loop.state.detach(&registrar, fd).unwrap();
        event_loop.state.detach(&registrar, fd).unwrap();
        // Closing a detached descriptor is a no-op as well
        event_loop.state.close(&registrar, fd, None).unwrap();

        assert_eq!(shared.conn_counts[0].load(Ordering::SeqCst), 0);
        assert_eq!(handler.detached.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loop_close_is_idempotent() {
        let (mut event_loop, handler, shared) = event_loop();
        let notifier = event_loop.poller.notifier();
        add_conn(&mut event_loop);
        add_conn(&mut event_loop);
        assert_eq!(shared.conn_counts[0].load(Ordering::SeqCst), 2);

        event_loop.close();
        event_loop.close();

        assert_eq!(shared.conn_counts[0].load(Ordering::SeqCst), 0);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 2);
        assert!(notifier.is_closed());
    }

    #[test]
    fn test_ticker_outlived_by_schedule() {
        let mut poller = Poller::new(8).unwrap();
        let ticker = Ticker::spawn(poller.notifier()).unwrap();
        poller.close();

        // The tick cannot be delivered, so the ticker thread exits
        ticker.schedule(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(100));

        ticker.schedule(Duration::from_millis(1));
        ticker.stop();
    }
}
