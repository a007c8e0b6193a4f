use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Token reserved for the cross-thread waker; descriptors use their own value
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Internal notification delivered through the poller's wake channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    /// Periodic tick for the loop that owns the ticker
    Tick,
    /// Reconsider connection `fd` if it is still the connection `id`
    Wake { fd: RawFd, id: u64 },
    /// Retry accepting on every listener
    Accept,
    /// Stop waiting; the server is shutting down
    Shutdown,
}

/// One unit of work handed to the `wait` callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ready {
    /// Descriptor `fd` reported readiness
    Fd(RawFd),
    /// A note posted through a [`Notifier`]
    Note(Note),
}

/// Thread-safe handle that posts notes to one poller and wakes it
pub struct Notifier {
    waker: Waker,
    notes: Sender<Note>,
    closed: Arc<AtomicBool>,
}

impl Notifier {
    /// Queue a note and force the owning poller's `wait` to deliver it
    pub fn notify(&self, note: Note) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PollerClosed);
        }
        self.notes.send(note).map_err(|_| Error::PollerClosed)?;
        self.waker.wake()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Interest-set mutations for a poller, usable while `wait` is dispatching
///
/// mio reports readiness edge-triggered, so every modification re-arms the
/// descriptor: if it is ready at that moment a fresh event is delivered.
pub struct Registrar<'a> {
    registry: &'a Registry,
}

impl Registrar<'_> {
    pub fn add_read(&self, fd: RawFd) -> Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token(fd), Interest::READABLE)?;
        Ok(())
    }

    pub fn add_read_write(&self, fd: RawFd) -> Result<()> {
        self.registry.register(
            &mut SourceFd(&fd),
            token(fd),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    pub fn mod_read(&self, fd: RawFd) -> Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), token(fd), Interest::READABLE)?;
        Ok(())
    }

    pub fn mod_read_write(&self, fd: RawFd) -> Result<()> {
        self.registry.reregister(
            &mut SourceFd(&fd),
            token(fd),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    pub fn remove_and_detach(&self, fd: RawFd) -> Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))?;
        Ok(())
    }
}

/// Readiness notification over a set of raw descriptors
///
/// Each event loop owns exactly one poller. Other threads reach it only
/// through its [`Notifier`].
pub struct Poller {
    poll: Option<Poll>,
    events: Events,
    notes: Receiver<Note>,
    notifier: Arc<Notifier>,
    closed: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (tx, rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        Ok(Self {
            poll: Some(poll),
            events: Events::with_capacity(events_capacity),
            notes: rx,
            notifier: Arc::new(Notifier {
                waker,
                notes: tx,
                closed: Arc::clone(&closed),
            }),
            closed,
        })
    }

    /// Handle for waking this poller from other threads
    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    pub fn registrar(&self) -> Result<Registrar<'_>> {
        let poll = self.poll.as_ref().ok_or(Error::PollerClosed)?;
        Ok(Registrar {
            registry: poll.registry(),
        })
    }

    pub fn add_read(&self, fd: RawFd) -> Result<()> {
        self.registrar()?.add_read(fd)
    }


    /// Block until descriptors are ready or notes arrive, invoking `f` for each
    ///
    /// Runs until `f` returns an error, which is handed back to the caller.
    /// A `Note::Shutdown` is passed to `f` like any other note; the callback
    /// decides that it ends the wait.
    pub fn wait<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&Registrar<'_>, Ready) -> Result<()>,
    {
        loop {
            let poll = self.poll.as_mut().ok_or(Error::PollerClosed)?;
            match poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let poll = self.poll.as_ref().ok_or(Error::PollerClosed)?;
            let registrar = Registrar {
                registry: poll.registry(),
            };

            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    while let Ok(note) = self.notes.try_recv() {
                        trace!("Poller note {:?}", note);
                        f(&registrar, Ready::Note(note))?;
                    }
                } else {
                    f(&registrar, Ready::Fd(event.token().0 as RawFd))?;
                }
            }
        }
    }

    /// Release the OS poller; calling it again is a no-op
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.poll.take();
        while self.notes.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.poll.is_none()
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_note_from_other_thread() {
        let mut poller = Poller::new(64).unwrap();
        let notifier = poller.notifier();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify(Note::Wake { fd: 7, id: 42 }).unwrap();
            notifier.notify(Note::Shutdown).unwrap();
        });

        let mut seen = Vec::new();
        let result = poller.wait(|_, ready| {
            seen.push(ready.clone());
            match ready {
                Ready::Note(Note::Shutdown) => Err(Error::Shutdown),
                _ => Ok(()),
            }
        });

        handle.join().unwrap();
        assert!(result.unwrap_err().is_shutdown());
        assert_eq!(
            seen,
            vec![
                Ready::Note(Note::Wake { fd: 7, id: 42 }),
                Ready::Note(Note::Shutdown)
            ]
        );
    }

    #[test]
    fn test_read_readiness() {
        let mut poller = Poller::new(64).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        poller.add_read(fd).unwrap();
        a.write_all(b"x").unwrap();

        let result = poller.wait(|_, ready| match ready {
            Ready::Fd(ready_fd) if ready_fd == fd => Err(Error::Shutdown),
            _ => Ok(()),
        });
        assert!(result.unwrap_err().is_shutdown());

        poller.registrar().unwrap().remove_and_detach(fd).unwrap();
    }

    #[test]
    fn test_mod_read_write_rearms() {
        let mut poller = Poller::new(64).unwrap();
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        poller.registrar().unwrap().add_read_write(fd).unwrap();

        // First writable edge, then a re-arm must deliver another one
        let mut hits = 0;
        let result = poller.wait(|registrar, ready| {
            if ready == Ready::Fd(fd) {
                hits += 1;
                if hits == 2 {
                    return Err(Error::Shutdown);
                }
                registrar.mod_read_write(fd)?;
            }
            Ok(())
        });
        assert!(result.unwrap_err().is_shutdown());
        assert_eq!(hits, 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut poller = Poller::new(8).unwrap();
        let notifier = poller.notifier();
        assert!(!poller.is_closed());

        poller.close();
        poller.close();

        assert!(poller.is_closed());
        assert!(notifier.is_closed());
        assert!(matches!(
            notifier.notify(Note::Tick),
            Err(Error::PollerClosed)
        ));
        assert!(matches!(poller.add_read(0), Err(Error::PollerClosed)));
        assert!(matches!(poller.wait(|_, _| Ok(())), Err(Error::PollerClosed)));
    }
}
