use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::{error, warn};

use crate::EventHandler;

const EVENT_CAPACITY: usize = 64;

struct Periodic {
    callback: Box<dyn FnMut()>,
    period: Duration,
    next_fire: Instant,
}

/// Single-threaded reactor driving every socket of one endpoint.
///
/// Sockets register a raw fd together with an [`EventHandler`]; re-registering
/// the same fd replaces the prior registration, which is how framed sockets
/// switch between read-only and read+write interest. A single repeating
/// callback slot drives the session timeout clock.
///
/// `run` dispatches readiness events until `stop` is called. Blocking entry
/// points (call, notify, future `get`) pump the loop by calling `run` in a
/// retry loop: whoever observes the awaited event stops the loop, the entry
/// point re-checks its condition and either returns or runs again. That only
/// works from outside the loop — a nested `run` returns immediately, so
/// callers pumping from inside a handler would spin without progress and
/// must check `is_running` first.
pub struct Reactor {
    poll: RefCell<Poll>,
    handlers: RefCell<HashMap<RawFd, Rc<dyn EventHandler>>>,
    periodic: RefCell<Option<Periodic>>,
    /// Bumped on every periodic install/cancel so a callback replacing
    /// itself is not clobbered when the tick returns.
    periodic_epoch: Cell<u64>,
    running: Cell<bool>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: RefCell::new(Poll::new()?),
            handlers: RefCell::new(HashMap::new()),
            periodic: RefCell::new(None),
            periodic_epoch: Cell::new(0),
            running: Cell::new(false),
        })
    }

    /// Registers `fd` for `interest`, replacing any prior registration of
    /// the same fd (handler included).
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Rc<dyn EventHandler>,
    ) -> io::Result<()> {
        let poll = self.poll.borrow();
        let mut handlers = self.handlers.borrow_mut();
        if handlers.contains_key(&fd) {
            poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        } else {
            poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        }
        handlers.insert(fd, handler);
        Ok(())
    }

    /// Drops all interests for `fd` and releases its handler. A no-op for
    /// unknown fds.
    pub fn deregister(&self, fd: RawFd) {
        if self.handlers.borrow_mut().remove(&fd).is_some() {
            if let Err(err) = self.poll.borrow().registry().deregister(&mut SourceFd(&fd)) {
                warn!(?err, fd, "reactor: deregister failed");
            }
        }
    }

    /// Installs the repeating callback, replacing any prior one. Callable
    /// from inside the running callback itself.
    pub fn set_periodic(&self, period: Duration, callback: Box<dyn FnMut()>) {
        self.periodic_epoch.set(self.periodic_epoch.get() + 1);
        *self.periodic.borrow_mut() =
            Some(Periodic { callback, period, next_fire: Instant::now() + period });
    }

    /// Cancels the repeating callback.
    pub fn clear_periodic(&self) {
        self.periodic_epoch.set(self.periodic_epoch.get() + 1);
        *self.periodic.borrow_mut() = None;
    }

    /// Requests the running `run` to unwind once the current event batch has
    /// been dispatched. Callable from inside handlers.
    #[inline]
    pub fn stop(&self) {
        self.running.set(false);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Dispatches readiness events and periodic ticks until `stop`.
    ///
    /// A nested call while the loop is already running returns immediately.
    /// The event batch in flight when `stop` fires is still dispatched in
    /// full: readiness edges are delivered once and must not be dropped.
    pub fn run(&self) {
        if self.running.replace(true) {
            return;
        }
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        while self.running.get() {
            let timeout = self.poll_timeout();
            if let Err(err) = self.poll.borrow_mut().poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "reactor: poll failed");
                self.running.set(false);
                return;
            }
            for event in events.iter() {
                let fd = event.token().0 as RawFd;
                // Clone the handler out so callbacks can re-register freely.
                let handler = self.handlers.borrow().get(&fd).cloned();
                let Some(handler) = handler else { continue };
                if event.is_error() {
                    handler.on_error();
                }
                if event.is_readable() || event.is_read_closed() {
                    handler.on_readable();
                }
                if event.is_writable() {
                    handler.on_writable();
                }
            }
            self.tick_periodic();
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        self.periodic
            .borrow()
            .as_ref()
            .map(|periodic| periodic.next_fire.saturating_duration_since(Instant::now()))
    }

    fn tick_periodic(&self) {
        let due =
            self.periodic.borrow().as_ref().is_some_and(|p| Instant::now() >= p.next_fire);
        if !due {
            return;
        }
        // Taken out of the slot for the duration of the call: the callback
        // may itself replace or cancel the periodic.
        let Some(mut periodic) = self.periodic.borrow_mut().take() else { return };
        let epoch = self.periodic_epoch.get();
        (periodic.callback)();
        if self.periodic_epoch.get() == epoch {
            periodic.next_fire = Instant::now() + periodic.period;
            *self.periodic.borrow_mut() = Some(periodic);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        os::fd::AsRawFd,
        rc::Rc,
        time::Duration,
    };

    use super::*;

    struct Reader {
        stream: RefCell<TcpStream>,
        received: Cell<usize>,
        reactor: Rc<Reactor>,
    }

    impl EventHandler for Reader {
        fn on_readable(&self) {
            let mut buf = [0_u8; 64];
            if let Ok(n) = self.stream.borrow_mut().read(&mut buf) {
                self.received.set(self.received.get() + n);
            }
            self.reactor.stop();
        }
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");
        (client, server)
    }

    #[test]
    fn periodic_fires_until_stopped() {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        let ticks = Rc::new(Cell::new(0));
        let (r, t) = (reactor.clone(), ticks.clone());
        reactor.set_periodic(
            Duration::from_millis(2),
            Box::new(move || {
                t.set(t.get() + 1);
                if t.get() == 3 {
                    r.stop();
                }
            }),
        );
        reactor.run();
        assert_eq!(ticks.get(), 3);
    }

    #[test]
    fn set_periodic_replaces_the_previous_callback() {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        let old_ticks = Rc::new(Cell::new(0));
        let t = old_ticks.clone();
        reactor.set_periodic(Duration::from_millis(1), Box::new(move || t.set(t.get() + 1)));
        let r = reactor.clone();
        reactor.set_periodic(Duration::from_millis(2), Box::new(move || r.stop()));
        reactor.run();
        assert_eq!(old_ticks.get(), 0);
    }

    #[test]
    fn readable_handler_sees_buffered_data() {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        let (mut client, server) = connected_pair();
        client.write_all(b"ping").expect("write");

        let fd = server.as_raw_fd();
        let reader = Rc::new(Reader {
            stream: RefCell::new(server),
            received: Cell::new(0),
            reactor: reactor.clone(),
        });
        reactor.register(fd, Interest::READABLE, reader.clone()).expect("register");
        reactor.run();
        assert_eq!(reader.received.get(), 4);
    }

    #[test]
    fn reregistering_replaces_the_handler() {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        let (mut client, server) = connected_pair();

        let fd = server.as_raw_fd();
        let stale = Rc::new(Reader {
            stream: RefCell::new(server.try_clone().expect("clone stream")),
            received: Cell::new(0),
            reactor: reactor.clone(),
        });
        let live = Rc::new(Reader {
            stream: RefCell::new(server),
            received: Cell::new(0),
            reactor: reactor.clone(),
        });
        reactor.register(fd, Interest::READABLE, stale.clone()).expect("register");
        reactor.register(fd, Interest::READABLE, live.clone()).expect("reregister");

        client.write_all(b"ping").expect("write");
        reactor.run();
        assert_eq!(stale.received.get(), 0);
        assert_eq!(live.received.get(), 4);
    }

    #[test]
    fn deregistered_fd_is_silent() {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        let (mut client, server) = connected_pair();

        let fd = server.as_raw_fd();
        let reader = Rc::new(Reader {
            stream: RefCell::new(server),
            received: Cell::new(0),
            reactor: reactor.clone(),
        });
        reactor.register(fd, Interest::READABLE, reader.clone()).expect("register");
        reactor.deregister(fd);

        client.write_all(b"ping").expect("write");
        let ticks = Rc::new(Cell::new(0));
        let (r, t) = (reactor.clone(), ticks.clone());
        reactor.set_periodic(
            Duration::from_millis(5),
            Box::new(move || {
                t.set(t.get() + 1);
                if t.get() == 2 {
                    r.stop();
                }
            }),
        );
        reactor.run();
        assert_eq!(reader.received.get(), 0);
    }

    #[test]
    fn run_resumes_after_stop() {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        let rounds = Rc::new(Cell::new(0));
        let (r, c) = (reactor.clone(), rounds.clone());
        reactor.set_periodic(
            Duration::from_millis(1),
            Box::new(move || {
                c.set(c.get() + 1);
                r.stop();
            }),
        );
        reactor.run();
        assert_eq!(rounds.get(), 1);
        reactor.run();
        assert_eq!(rounds.get(), 2);
    }
}
