use std::{io, net::SocketAddr, rc::Rc, time::Duration};

use mprpc_reactor::Reactor;
use rmpv::Value;

use crate::{
    error::RpcError,
    future::CallFuture,
    session::{Session, TIMEOUT_TICK},
    transport::{ConnectOptions, Tcp, TransportBuilder},
};

/// Client construction knobs.
#[derive(Clone)]
pub struct ClientConfig {
    /// Per-call deadline; `Duration::ZERO` disables timeouts.
    pub timeout: Duration,
    /// Connect attempts before a call fails with a transport error.
    pub reconnect_limit: u32,
    /// Historical behaviour: treat loss of an established connection as a
    /// failed connect and re-enter the retry path.
    pub close_as_connect_failed: bool,
    /// Share an existing reactor instead of owning a fresh one.
    pub reactor: Option<Rc<Reactor>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            reconnect_limit: 5,
            close_as_connect_failed: false,
            reactor: None,
        }
    }
}

/// Facade over one session. The connection is established lazily by the
/// first call, notify or async request.
pub struct Client {
    session: Rc<Session>,
    reactor: Rc<Reactor>,
}

impl Client {
    pub fn new(address: SocketAddr) -> io::Result<Self> {
        Self::with_config(address, ClientConfig::default())
    }

    pub fn with_config(address: SocketAddr, config: ClientConfig) -> io::Result<Self> {
        Self::with_transport(address, config, &Tcp)
    }

    /// Plugs a non-default transport underneath the session.
    pub fn with_transport(
        address: SocketAddr,
        config: ClientConfig,
        builder: &dyn TransportBuilder,
    ) -> io::Result<Self> {
        let reactor = match config.reactor {
            Some(reactor) => reactor,
            None => Rc::new(Reactor::new()?),
        };
        let session = Session::new(reactor.clone(), address, config.timeout);
        let options = ConnectOptions {
            reconnect_limit: config.reconnect_limit,
            close_as_connect_failed: config.close_as_connect_failed,
        };
        let transport = builder.client_transport(&session, options)?;
        session.set_transport(transport);
        if !config.timeout.is_zero() {
            let weak = Rc::downgrade(&session);
            reactor.set_periodic(
                TIMEOUT_TICK,
                Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.step_timeouts();
                    }
                }),
            );
        }
        Ok(Self { session, reactor })
    }

    /// Blocking round trip: send the request, pump the loop, return the
    /// peer's answer.
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.session.call(method, params)
    }

    /// Fires the request and hands back the unresolved future.
    pub fn call_async(&self, method: &str, params: Vec<Value>) -> Rc<CallFuture> {
        self.session.send_request(method, params)
    }

    /// Returns once the notification has been flushed to the kernel.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        self.session.notify(method, params)
    }

    pub fn address(&self) -> SocketAddr {
        self.session.address()
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// Idempotent. Outstanding calls fail with a transport error; later
    /// operations on the client do too.
    pub fn close(&self) {
        self.reactor.clear_periodic();
        self.session.close();
    }
}
