use std::{
    any::Any,
    cell::{Cell, RefCell},
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
};

use mprpc_reactor::Reactor;
use rmpv::Value;
use tracing::{debug, warn};

use crate::{
    dispatch::{Dispatcher, Reply, Responder},
    message::Message,
    transport::{Listener, Sendable, Tcp, TransportBuilder},
};

/// Accept-side facade: one reactor, one dispatcher, any number of
/// listeners. Handed out as `Rc` because accepted sockets point back at it.
pub struct Server {
    me: Weak<Server>,
    reactor: Rc<Reactor>,
    dispatcher: Box<dyn Dispatcher>,
    listeners: RefCell<Vec<Rc<dyn Listener>>>,
    closed: Cell<bool>,
}

impl Server {
    pub fn new(dispatcher: impl Dispatcher + 'static) -> io::Result<Rc<Self>> {
        Ok(Self::with_reactor(dispatcher, Rc::new(Reactor::new()?)))
    }

    /// Shares an existing reactor, e.g. with a client living in the same
    /// thread.
    pub fn with_reactor(dispatcher: impl Dispatcher + 'static, reactor: Rc<Reactor>) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            reactor,
            dispatcher: Box::new(dispatcher),
            listeners: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        })
    }

    /// Binds `address` and starts accepting on the server's reactor. Returns
    /// the bound address, which is the way to recover the port after binding
    /// port 0.
    pub fn listen(&self, address: SocketAddr) -> io::Result<SocketAddr> {
        self.listen_with(address, &Tcp)
    }

    pub fn listen_with(
        &self,
        address: SocketAddr,
        builder: &dyn TransportBuilder,
    ) -> io::Result<SocketAddr> {
        if self.closed.get() {
            return Err(io::Error::other("server is closed"));
        }
        let me = self.me.upgrade().expect("called through the server handle");
        let listener = builder.server_transport(&me, address)?;
        let local = listener.local_addr()?;
        self.listeners.borrow_mut().push(listener);
        Ok(local)
    }

    /// Runs the reactor until `stop`.
    pub fn start(&self) {
        self.reactor.run();
    }

    /// Callable from inside a handler.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Sends a notification to every connected client on every listener; the
    /// frames drain as the server loop runs.
    pub fn notify_all(&self, method: &str, params: Vec<Value>) {
        let message = Message::Notification { method: method.to_owned(), params };
        for listener in self.listeners.borrow().iter() {
            listener.broadcast(message.clone());
        }
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// Idempotent; closes every listener and their accepted sockets.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for listener in self.listeners.take() {
            listener.close();
        }
    }

    pub(crate) fn on_request(
        &self,
        peer: Rc<dyn Sendable>,
        msgid: u32,
        method: String,
        params: Vec<Value>,
    ) {
        self.dispatch(&method, params, Responder::new(peer, msgid));
    }

    pub(crate) fn on_notify(&self, method: &str, params: Vec<Value>) {
        self.dispatch(method, params, Responder::null());
    }

    /// A panicking handler answers with the panic text; the server stays up.
    fn dispatch(&self, method: &str, params: Vec<Value>, responder: Responder) {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(method, params)));
        match outcome {
            Ok(Ok(Reply::Value(value))) => responder.set_result(value),
            Ok(Ok(Reply::Deferred(deferred))) => deferred.bind(responder),
            Ok(Err(err)) => {
                debug!(method, %err, "dispatch failed");
                responder.set_error(err.to_string());
            }
            Err(payload) => {
                let text = panic_text(payload.as_ref());
                warn!(method, %text, "handler panicked");
                responder.set_error(text);
            }
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_owned()
    }
}
