mod tcp;

pub use tcp::Tcp;

use std::{io, net::SocketAddr, rc::Rc};

use crate::{error::RpcError, message::Message, server::Server, session::Session};

/// Invoked once the send queue holding the message has fully drained to the
/// kernel.
pub type SendDone = Box<dyn FnOnce()>;

/// Anything that can carry a frame to a peer.
pub trait Sendable {
    fn send_message(&self, message: Message, done: Option<SendDone>) -> Result<(), RpcError>;
}

/// Client-side connection manager owned by a session.
pub trait Transport: Sendable {
    /// Idempotent; pending sends are dropped and sockets closed.
    fn close(&self);
}

/// Server-side accept loop; owns its accepted sockets.
pub trait Listener {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Enqueues `message` on every accepted connection.
    fn broadcast(&self, message: Message);

    /// Idempotent; closes the listening socket and every accepted one.
    fn close(&self);
}

/// Connection behaviour knobs forwarded to a client transport.
#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    /// Connect attempts before the session is failed.
    pub reconnect_limit: u32,
    /// Historical behaviour: treat loss of an established connection as a
    /// failed connect and re-enter the retry path.
    pub close_as_connect_failed: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { reconnect_limit: 5, close_as_connect_failed: false }
    }
}

/// Builds concrete transports underneath the facades; [`Tcp`] is the
/// default.
pub trait TransportBuilder {
    fn client_transport(
        &self,
        session: &Rc<Session>,
        options: ConnectOptions,
    ) -> io::Result<Rc<dyn Transport>>;

    fn server_transport(
        &self,
        server: &Rc<Server>,
        address: SocketAddr,
    ) -> io::Result<Rc<dyn Listener>>;
}
