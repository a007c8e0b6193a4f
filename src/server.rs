use crate::balance::LoadBalance;
use crate::event::{Action, EventHandler, ServerInfo};
use crate::event_loop::EventLoop;
use crate::io::{Note, Notifier, Poller};
use crate::network::{Addr, Listener};
use crate::{config::Config, error::Error, error::Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`Server`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Listeners bound, no loop started
    Created,
    /// Loops running
    Serving,
    /// A loop exited or a stop was requested; teardown in progress
    ShuttingDown,
    /// Everything closed and the shutdown hook ran
    Stopped,
}

/// State shared by the coordinator and every loop
pub(crate) struct Shared {
    state: Mutex<ServerState>,
    cond: Condvar,
    /// Live connections per loop
    pub(crate) conn_counts: Vec<AtomicUsize>,
    /// Server-wide accept counter for round-robin balancing
    pub(crate) accepted: AtomicUsize,
    pub(crate) balance: LoadBalance,
}

impl Shared {
    pub(crate) fn new(num_loops: usize, balance: LoadBalance) -> Self {
        Self {
            state: Mutex::new(ServerState::Created),
            cond: Condvar::new(),
            conn_counts: (0..num_loops).map(|_| AtomicUsize::new(0)).collect(),
            accepted: AtomicUsize::new(0),
            balance,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ServerState {
        *self.lock()
    }

    fn set_state(&self, state: ServerState) {
        *self.lock() = state;
        self.cond.notify_all();
    }

    /// Created -> Serving; false when a stop already happened
    fn enter_serving(&self) -> bool {
        let mut state = self.lock();
        if *state == ServerState::Created {
            *state = ServerState::Serving;
            true
        } else {
            false
        }
    }

    /// Move to ShuttingDown and wake the coordinator
    pub(crate) fn begin_shutdown(&self) {
        let mut state = self.lock();
        if matches!(*state, ServerState::Created | ServerState::Serving) {
            *state = ServerState::ShuttingDown;
        }
        drop(state);
        self.cond.notify_all();
    }

    fn wait_for_shutdown(&self) {
        let mut state = self.lock();
        while *state == ServerState::Serving {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn connection_counts(&self) -> Vec<usize> {
        self.conn_counts
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .collect()
    }
}

/// Thread-safe handle to a server, usable before and while it runs
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Request an orderly shutdown from any thread
    pub fn stop(&self) {
        info!("Initiating server shutdown");
        self.shared.begin_shutdown();
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Live connections per loop
    pub fn connection_counts(&self) -> Vec<usize> {
        self.shared.connection_counts()
    }

    /// Total live connections across loops
    pub fn active_connections(&self) -> usize {
        self.connection_counts().iter().sum()
    }
}

/// Multi-loop reactor server
///
/// Construction binds every listener; [`Server::run`] starts the loops and
/// blocks until the server is stopped.
pub struct Server<H: EventHandler> {
    config: Config,
    handler: Arc<H>,
    listeners: Vec<Listener>,
    num_loops: usize,
    shared: Arc<Shared>,
}

impl<H: EventHandler> Server<H> {
    /// Bind all configured listeners
    pub fn new(config: Config, handler: H) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(format!("{:#}", e)))?;

        let listeners = config
            .listen_addrs()?
            .iter()
            .map(Listener::bind)
            .collect::<Result<Vec<_>>>()?;

        let num_loops = config.resolved_loops();
        let shared = Arc::new(Shared::new(num_loops, config.load_balance));

        Ok(Self {
            config,
            handler: Arc::new(handler),
            listeners,
            num_loops,
            shared,
        })
    }

    /// Bound addresses, in configuration order
    pub fn addrs(&self) -> Vec<Addr> {
        self.listeners.iter().map(|l| l.addr().clone()).collect()
    }

    pub fn num_loops(&self) -> usize {
        self.num_loops
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down, either because a
    /// loop exited (a callback asked for `Shutdown`, or a loop failed) or
    /// because [`ServerHandle::stop`] was called.
    pub fn run(self) -> Result<()> {
        let Server {
            config,
            handler,
            listeners,
            num_loops,
            shared,
        } = self;

        let info = ServerInfo {
            addrs: listeners.iter().map(|l| l.addr().clone()).collect(),
            num_loops,
        };

        if !shared.enter_serving() {
            info!("Stop requested before serving");
            return finish(listeners, &handler, &shared, Ok(()));
        }

        if handler.serving(&info) == Action::Shutdown {
            info!("Serving callback requested shutdown, no loop started");
            shared.begin_shutdown();
            return finish(listeners, &handler, &shared, Ok(()));
        }

        let listeners = Arc::new(listeners);

        let mut pollers = Vec::with_capacity(num_loops);
        for _ in 0..num_loops {
            match Poller::new(config.events_capacity) {
                Ok(poller) => pollers.push(poller),
                Err(e) => return abort_setup(listeners, &shared, e),
            }
        }

        let peers: Arc<[Arc<Notifier>]> = pollers.iter().map(|p| p.notifier()).collect();

        let mut loops = Vec::with_capacity(num_loops);
        for (index, poller) in pollers.into_iter().enumerate() {
            let event_loop = EventLoop::new(
                index,
                poller,
                Arc::clone(&peers),
                Arc::clone(&listeners),
                Arc::clone(&handler),
                Arc::clone(&shared),
                config.read_buffer_size,
            );
            match event_loop {
                Ok(event_loop) => loops.push(event_loop),
                Err(e) => {
                    drop(loops);
                    return abort_setup(listeners, &shared, e);
                }
            }
        }

        info!(
            "Serving {} listener(s) with {} loop(s), {} balancing",
            info.addrs.len(),
            num_loops,
            config.load_balance
        );

        let mut handles = Vec::with_capacity(num_loops);
        let mut spawn_error = None;
        for mut event_loop in loops {
            let loop_shared = Arc::clone(&shared);
            let index = event_loop.index();

            let spawned = thread::Builder::new()
                .name(format!("feox-loop-{}", index))
                .spawn(move || {
                    let _exit = ShutdownOnExit(loop_shared);
                    match event_loop.run() {
                        Ok(()) => {}
                        Err(e) if e.is_shutdown() => debug!("Loop {} shutting down", index),
                        Err(e) => error!("Loop {} failed: {}", index, e),
                    }
                    event_loop
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("Failed to spawn loop {}: {}", index, e);
                    shared.begin_shutdown();
                    spawn_error = Some(Error::from(e));
                    break;
                }
            }
        }

        shared.wait_for_shutdown();
        info!("Shutting down {} loop(s)", handles.len());

        for notifier in peers.iter() {
            if let Err(e) = notifier.notify(Note::Shutdown) {
                debug!("Shutdown note not delivered: {}", e);
            }
        }

        let mut stopped = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(event_loop) => stopped.push(event_loop),
                Err(_) => error!("Loop thread panicked"),
            }
        }

        for event_loop in &mut stopped {
            event_loop.close();
        }
        drop(stopped);

        let open = peers.iter().filter(|n| !n.is_closed()).count();
        if open > 0 {
            warn!("{} poller(s) left open by a failed loop", open);
        }
        drop(peers);

        let listeners = match Arc::try_unwrap(listeners) {
            Ok(listeners) => listeners,
            Err(_) => {
                warn!("Listeners still referenced at shutdown");
                Vec::new()
            }
        };

        finish(listeners, &handler, &shared, spawn_error.map_or(Ok(()), Err))
    }
}

/// Close listeners, mark the server stopped and run the shutdown hook
fn finish<H: EventHandler>(
    listeners: Vec<Listener>,
    handler: &Arc<H>,
    shared: &Shared,
    result: Result<()>,
) -> Result<()> {
    for listener in listeners {
        listener.close();
    }
    shared.set_state(ServerState::Stopped);
    handler.shutdown();
    info!("Server stopped");
    result
}

/// Setup failed after serving began: release everything without calling
/// any further callback
fn abort_setup(listeners: Arc<Vec<Listener>>, shared: &Shared, err: Error) -> Result<()> {
    error!("Server setup failed: {}", err);
    drop(listeners);
    shared.set_state(ServerState::Stopped);
    Err(err)
}

/// Signals shutdown when a loop thread ends, including by panic
struct ShutdownOnExit(Arc<Shared>);

impl Drop for ShutdownOnExit {
    fn drop(&mut self) {
        self.0.begin_shutdown();
    }
}

/// Bind `addrs` with default settings and serve until shutdown
pub fn serve<H: EventHandler>(handler: H, addrs: &[&str]) -> Result<()> {
    let config = Config {
        addrs: addrs.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    };
    Server::new(config, handler)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Conn;
    use std::time::Duration;

    struct Refuser;

    impl EventHandler for Refuser {
        type Client = ();

        fn accepted(&self, _conn: &Conn, _unix: bool) -> (Option<()>, Action) {
            (None, Action::Close)
        }
    }

    fn config() -> Config {
        Config {
            addrs: vec!["tcp://127.0.0.1:0".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_binds_and_stays_created() {
        let server = Server::new(config(), Refuser).unwrap();
        assert_eq!(server.state(), ServerState::Created);
        assert_eq!(server.num_loops(), 1);
        assert_eq!(server.addrs().len(), 1);
        assert_eq!(server.handle().connection_counts(), vec![0]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            addrs: vec!["bogus://x".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            Server::new(config, Refuser),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stop_before_run() {
        let server = Server::new(config(), Refuser).unwrap();
        let handle = server.handle();
        handle.stop();
        assert_eq!(handle.state(), ServerState::ShuttingDown);

        server.run().unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[test]
    fn test_stop_while_serving() {
        let server = Server::new(
            Config {
                loops: 3,
                ..config()
            },
            Refuser,
        )
        .unwrap();
        let handle = server.handle();

        let runner = thread::spawn(move || server.run());
        while handle.state() != ServerState::Serving {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        runner.join().unwrap().unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
        assert_eq!(handle.active_connections(), 0);
    }
}
