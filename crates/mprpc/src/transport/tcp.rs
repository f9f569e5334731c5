use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    rc::{Rc, Weak},
};

use mio::net::{TcpListener, TcpStream};
use mprpc_reactor::{EventHandler, Interest, Reactor};
use rmpv::Value;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::{
    codec::{self, Decoder},
    error::RpcError,
    message::Message,
    server::Server,
    session::Session,
    transport::{ConnectOptions, Listener, SendDone, Sendable, Transport, TransportBuilder},
};

/// Packed frames are queued in chunks of at most this size; one chunk is the
/// unit of a non-blocking write.
const CHUNK_SIZE: usize = 128 * 1024;
/// Unit of a non-blocking read into the streaming decoder.
const RECV_CHUNK: usize = 1024;
const LISTEN_BACKLOG: i32 = 5;

/// Default transport builder: MessagePack-RPC over plain TCP.
pub struct Tcp;

impl TransportBuilder for Tcp {
    fn client_transport(
        &self,
        session: &Rc<Session>,
        options: ConnectOptions,
    ) -> io::Result<Rc<dyn Transport>> {
        Ok(TcpClientTransport::new(session, options))
    }

    fn server_transport(
        &self,
        server: &Rc<Server>,
        address: SocketAddr,
    ) -> io::Result<Rc<dyn Listener>> {
        let listener = TcpServerTransport::bind(server, address)?;
        Ok(listener)
    }
}

/// Byte-level plumbing shared by both socket roles: the outbound chunk queue
/// and the streaming decoder for inbound bytes.
struct FramedStream {
    stream: TcpStream,
    fd: RawFd,
    out: VecDeque<Vec<u8>>,
    decoder: Decoder,
    /// Fires when the queue fully drains; the most recently installed wins.
    on_sent: Option<SendDone>,
}

enum ReadOutcome {
    /// Read until the kernel blocked; the decoder may hold complete frames.
    WouldBlock,
    /// Zero-length read: the peer closed.
    PeerClosed,
}

impl FramedStream {
    fn new(stream: TcpStream) -> Self {
        let fd = stream.as_raw_fd();
        Self { stream, fd, out: VecDeque::new(), decoder: Decoder::default(), on_sent: None }
    }

    fn enqueue(&mut self, message: Message, done: Option<SendDone>) -> Result<(), RpcError> {
        let bytes = codec::pack(message)?;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            self.out.push_back(chunk.to_vec());
        }
        self.on_sent = done;
        Ok(())
    }

    /// Writes queue-front chunks until drained or the kernel blocks.
    /// Ok(true) means the queue is empty.
    #[inline]
    fn flush(&mut self) -> io::Result<bool> {
        while let Some(front) = self.out.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    if n == front.len() {
                        self.out.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Reads until the kernel blocks, feeding the decoder.
    #[inline]
    fn fill(&mut self) -> io::Result<ReadOutcome> {
        let mut buf = [0_u8; RECV_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// Registration and teardown shared by both socket roles.
trait FramedPeer {
    fn io(&self) -> &RefCell<FramedStream>;
    fn reactor(&self) -> &Rc<Reactor>;
    fn handler(&self) -> Rc<dyn EventHandler>;
    fn dead(&self) -> &Cell<bool>;
    /// Role-specific error path.
    fn fail(&self);

    fn fd(&self) -> RawFd {
        self.io().borrow().fd
    }

    fn close_io(&self) {
        self.dead().set(true);
        let io = self.io().borrow();
        self.reactor().deregister(io.fd);
        let _ = io.stream.shutdown(Shutdown::Both);
    }

    /// Queues the frame and arms write interest; the drain happens on the
    /// next writability event.
    fn enqueue(&self, message: Message, done: Option<SendDone>) -> Result<(), RpcError> {
        self.io().borrow_mut().enqueue(message, done)?;
        self.reactor()
            .register(self.fd(), Interest::READABLE | Interest::WRITABLE, self.handler())
            .map_err(|err| RpcError::transport(format!("cannot watch socket: {err}")))
    }

    /// Drains the front of the queue; on empty, drops write interest and
    /// fires the completion callback.
    fn flush_ready(&self) {
        let flushed = self.io().borrow_mut().flush();
        match flushed {
            Ok(true) => {
                let done = self.io().borrow_mut().on_sent.take();
                if let Err(err) = self.reactor().register(self.fd(), Interest::READABLE, self.handler()) {
                    warn!(?err, "tcp: reregister after drain");
                    return self.fail();
                }
                if let Some(done) = done {
                    done();
                }
            }
            Ok(false) => {}
            Err(err) => {
                debug!(?err, "tcp: write");
                self.fail();
            }
        }
    }
}

/// One outbound connection: framed I/O plus the connecting-phase state
/// machine. The reactor's handler registration keeps it alive.
struct ClientSocket {
    me: Weak<ClientSocket>,
    reactor: Rc<Reactor>,
    transport: Weak<TcpClientTransport>,
    io: RefCell<FramedStream>,
    connecting: Cell<bool>,
    dead: Cell<bool>,
}

impl ClientSocket {
    fn connect(transport: &Rc<TcpClientTransport>, address: SocketAddr) -> io::Result<Rc<Self>> {
        let stream = TcpStream::connect(address)?;
        let _ = stream.set_nodelay(true);
        let socket = Rc::new_cyclic(|me| Self {
            me: me.clone(),
            reactor: transport.reactor.clone(),
            transport: Rc::downgrade(transport),
            io: RefCell::new(FramedStream::new(stream)),
            connecting: Cell::new(true),
            dead: Cell::new(false),
        });
        let fd = socket.io.borrow().fd;
        transport.reactor.register(
            fd,
            Interest::READABLE | Interest::WRITABLE,
            socket.clone(),
        )?;
        Ok(socket)
    }

    fn rc(&self) -> Rc<Self> {
        self.me.upgrade().expect("socket is alive while its handler runs")
    }

    /// The writable edge of a non-blocking connect. A pending socket error
    /// here means the connect failed.
    fn finish_connect(&self) {
        match self.io.borrow().stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => {
                debug!(?err, "tcp: connect failed");
                return self.fail();
            }
        }
        self.connecting.set(false);
        // Read-only until something is queued; flushing the buffered backlog
        // below re-arms write interest per message.
        if let Err(err) = self.reactor.register(self.fd(), Interest::READABLE, self.handler()) {
            warn!(?err, "tcp: reregister after connect");
            return self.fail();
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.on_connect(&self.rc());
        }
    }

    fn drain_messages(&self) {
        loop {
            if self.dead.get() {
                return;
            }
            let decoded = self.io.borrow_mut().decoder.next();
            match decoded {
                Ok(Some(Message::Response { msgid, error, result })) => {
                    let Some(transport) = self.transport.upgrade() else { return };
                    transport.forward_response(msgid, error, result);
                }
                Ok(Some(other)) => {
                    debug!(?other, "tcp: unexpected frame on a client connection, dropping");
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(%err, "tcp: protocol error, closing connection");
                    return self.fail();
                }
            }
        }
    }
}

impl FramedPeer for ClientSocket {
    fn io(&self) -> &RefCell<FramedStream> {
        &self.io
    }

    fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    fn handler(&self) -> Rc<dyn EventHandler> {
        self.rc()
    }

    fn dead(&self) -> &Cell<bool> {
        &self.dead
    }

    /// A connect-phase failure goes to the retry logic, loss of an
    /// established connection to the transport's close handling.
    fn fail(&self) {
        if self.dead.replace(true) {
            return;
        }
        let was_connecting = self.connecting.get();
        self.close_io();
        let Some(transport) = self.transport.upgrade() else { return };
        if was_connecting {
            transport.on_connect_failed();
        } else {
            transport.on_close(&self.rc());
        }
    }
}

impl EventHandler for ClientSocket {
    fn on_readable(&self) {
        if self.dead.get() {
            return;
        }
        if self.connecting.get() {
            // Connect completion can surface as read and write readiness in
            // the same event.
            self.finish_connect();
            if self.dead.get() || self.connecting.get() {
                return;
            }
        }
        let outcome = self.io.borrow_mut().fill();
        match outcome {
            Ok(ReadOutcome::WouldBlock) => self.drain_messages(),
            Ok(ReadOutcome::PeerClosed) => {
                self.drain_messages();
                debug!("tcp: peer closed");
                self.fail();
            }
            Err(err) => {
                debug!(?err, "tcp: read");
                self.fail();
            }
        }
    }

    fn on_writable(&self) {
        if self.dead.get() {
            return;
        }
        if self.connecting.get() {
            self.finish_connect();
        } else {
            self.flush_ready();
        }
    }

    fn on_error(&self) {
        if self.dead.get() {
            return;
        }
        debug!("tcp: socket error");
        self.fail();
    }
}

impl Sendable for ClientSocket {
    fn send_message(&self, message: Message, done: Option<SendDone>) -> Result<(), RpcError> {
        if self.dead.get() {
            return Err(RpcError::transport("connection is closed"));
        }
        self.enqueue(message, done)
    }
}

/// Client-side connection manager: lazy connect on first send, bounded
/// retries, ordered replay of messages buffered while disconnected.
struct TcpClientTransport {
    me: Weak<TcpClientTransport>,
    session: Weak<Session>,
    reactor: Rc<Reactor>,
    address: SocketAddr,
    options: ConnectOptions,
    /// Gate: at most one in-flight connect attempt.
    connecting: Cell<bool>,
    /// Retry budget consumed by the current connect cycle.
    attempts: Cell<u32>,
    pending: RefCell<Vec<(Message, Option<SendDone>)>>,
    sockets: RefCell<Vec<Rc<ClientSocket>>>,
    closed: Cell<bool>,
}

impl TcpClientTransport {
    fn new(session: &Rc<Session>, options: ConnectOptions) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            session: Rc::downgrade(session),
            reactor: session.reactor().clone(),
            address: session.address(),
            options,
            connecting: Cell::new(false),
            attempts: Cell::new(0),
            pending: RefCell::new(Vec::new()),
            sockets: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        })
    }

    fn rc(&self) -> Rc<Self> {
        self.me.upgrade().expect("transport is alive while its sockets run")
    }

    fn start_connect(&self) {
        if let Err(err) = ClientSocket::connect(&self.rc(), self.address) {
            debug!(?err, address = %self.address, "tcp: connect");
            self.on_connect_failed();
        }
    }

    fn on_connect(&self, socket: &Rc<ClientSocket>) {
        if self.closed.get() {
            socket.close_io();
            return;
        }
        debug!(address = %self.address, "tcp: connected");
        self.connecting.set(false);
        self.attempts.set(0);
        self.sockets.borrow_mut().push(socket.clone());
        let pending = self.pending.take();
        for (message, done) in pending {
            if let Err(err) = socket.send_message(message, done) {
                warn!(%err, "tcp: dropping buffered message");
            }
        }
    }

    fn on_connect_failed(&self) {
        if self.closed.get() {
            return;
        }
        if self.attempts.get() < self.options.reconnect_limit {
            // Re-arm the gate: a loss-triggered reconnect enters here with
            // `connecting` already cleared by the earlier success.
            self.connecting.set(true);
            self.attempts.set(self.attempts.get() + 1);
            self.start_connect();
        } else {
            self.connecting.set(false);
            self.attempts.set(0);
            self.pending.borrow_mut().clear();
            if let Some(session) = self.session.upgrade() {
                session.on_connect_failed(RpcError::transport("Retry connection over the limit"));
            }
        }
    }

    /// Loss of an established connection.
    fn on_close(&self, socket: &Rc<ClientSocket>) {
        if self.closed.get() {
            return;
        }
        let mut sockets = self.sockets.borrow_mut();
        let known = sockets.iter().position(|s| Rc::ptr_eq(s, socket));
        if let Some(index) = known {
            sockets.swap_remove(index);
        }
        drop(sockets);
        if known.is_none() || self.options.close_as_connect_failed {
            // A socket we never promoted lost its connection mid-handshake;
            // legacy mode additionally funnels every loss through here.
            self.on_connect_failed();
        } else if let Some(session) = self.session.upgrade() {
            session.on_connect_failed(RpcError::transport("connection closed by peer"));
        }
    }

    fn forward_response(&self, msgid: u32, error: Value, result: Value) {
        if let Some(session) = self.session.upgrade() {
            session.on_response(msgid, error, result);
        }
    }
}

impl Sendable for TcpClientTransport {
    fn send_message(&self, message: Message, done: Option<SendDone>) -> Result<(), RpcError> {
        if self.closed.get() {
            return Err(RpcError::transport("transport is closed"));
        }
        let socket = self.sockets.borrow().first().cloned();
        if let Some(socket) = socket {
            socket.send_message(message, done)
        } else {
            self.pending.borrow_mut().push((message, done));
            if !self.connecting.replace(true) {
                self.attempts.set(1);
                self.start_connect();
            }
            Ok(())
        }
    }
}

impl Transport for TcpClientTransport {
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for socket in self.sockets.take() {
            socket.close_io();
        }
        self.pending.borrow_mut().clear();
        self.connecting.set(false);
        self.attempts.set(0);
    }
}

/// One accepted connection; routes inbound frames to the owning server.
struct ServerSocket {
    me: Weak<ServerSocket>,
    reactor: Rc<Reactor>,
    server: Weak<Server>,
    listener: Weak<TcpServerTransport>,
    io: RefCell<FramedStream>,
    dead: Cell<bool>,
}

impl ServerSocket {
    fn accepted(listener: &Rc<TcpServerTransport>, stream: TcpStream) -> io::Result<Rc<Self>> {
        let _ = stream.set_nodelay(true);
        let socket = Rc::new_cyclic(|me| Self {
            me: me.clone(),
            reactor: listener.reactor.clone(),
            server: listener.server.clone(),
            listener: Rc::downgrade(listener),
            io: RefCell::new(FramedStream::new(stream)),
            dead: Cell::new(false),
        });
        let fd = socket.io.borrow().fd;
        listener.reactor.register(fd, Interest::READABLE, socket.clone())?;
        Ok(socket)
    }

    fn rc(&self) -> Rc<Self> {
        self.me.upgrade().expect("socket is alive while its handler runs")
    }

    fn drain_messages(&self) {
        loop {
            if self.dead.get() {
                return;
            }
            let decoded = self.io.borrow_mut().decoder.next();
            match decoded {
                Ok(Some(Message::Request { msgid, method, params })) => {
                    let Some(server) = self.server.upgrade() else { return };
                    server.on_request(self.rc(), msgid, method, params);
                }
                Ok(Some(Message::Notification { method, params })) => {
                    let Some(server) = self.server.upgrade() else { return };
                    server.on_notify(&method, params);
                }
                Ok(Some(Message::Response { .. })) => {
                    debug!("tcp: response frame on a server connection, dropping");
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(%err, "tcp: protocol error, closing connection");
                    return self.fail();
                }
            }
        }
    }
}

impl FramedPeer for ServerSocket {
    fn io(&self) -> &RefCell<FramedStream> {
        &self.io
    }

    fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    fn handler(&self) -> Rc<dyn EventHandler> {
        self.rc()
    }

    fn dead(&self) -> &Cell<bool> {
        &self.dead
    }

    fn fail(&self) {
        if self.dead.replace(true) {
            return;
        }
        self.close_io();
        if let Some(listener) = self.listener.upgrade() {
            listener.on_close(&self.rc());
        }
    }
}

impl EventHandler for ServerSocket {
    fn on_readable(&self) {
        if self.dead.get() {
            return;
        }
        let outcome = self.io.borrow_mut().fill();
        match outcome {
            Ok(ReadOutcome::WouldBlock) => self.drain_messages(),
            Ok(ReadOutcome::PeerClosed) => {
                self.drain_messages();
                debug!("tcp: peer closed");
                self.fail();
            }
            Err(err) => {
                debug!(?err, "tcp: read");
                self.fail();
            }
        }
    }

    fn on_writable(&self) {
        if self.dead.get() {
            return;
        }
        self.flush_ready();
    }

    fn on_error(&self) {
        if self.dead.get() {
            return;
        }
        debug!("tcp: socket error");
        self.fail();
    }
}

impl Sendable for ServerSocket {
    fn send_message(&self, message: Message, done: Option<SendDone>) -> Result<(), RpcError> {
        if self.dead.get() {
            return Err(RpcError::transport("connection is closed"));
        }
        self.enqueue(message, done)
    }
}

/// Accept loop plus ownership of every accepted socket.
struct TcpServerTransport {
    me: Weak<TcpServerTransport>,
    reactor: Rc<Reactor>,
    server: Weak<Server>,
    listener: TcpListener,
    fd: RawFd,
    sockets: RefCell<Vec<Rc<ServerSocket>>>,
    closed: Cell<bool>,
}

impl TcpServerTransport {
    fn bind(server: &Rc<Server>, address: SocketAddr) -> io::Result<Rc<Self>> {
        let listener = bind_listener(address)?;
        let fd = listener.as_raw_fd();
        let transport = Rc::new_cyclic(|me| Self {
            me: me.clone(),
            reactor: server.reactor().clone(),
            server: Rc::downgrade(server),
            listener,
            fd,
            sockets: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        });
        transport.reactor.register(fd, Interest::READABLE, transport.clone())?;
        Ok(transport)
    }

    fn on_close(&self, socket: &Rc<ServerSocket>) {
        if self.closed.get() {
            return;
        }
        let mut sockets = self.sockets.borrow_mut();
        if let Some(index) = sockets.iter().position(|s| Rc::ptr_eq(s, socket)) {
            sockets.swap_remove(index);
        }
    }
}

impl EventHandler for TcpServerTransport {
    fn on_readable(&self) {
        if self.closed.get() {
            return;
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(?peer, "tcp: client connected");
                    let Some(me) = self.me.upgrade() else { return };
                    match ServerSocket::accepted(&me, stream) {
                        Ok(socket) => self.sockets.borrow_mut().push(socket),
                        Err(err) => warn!(?err, "tcp: could not watch accepted socket"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "tcp: accept");
                    return;
                }
            }
        }
    }
}

impl Listener for TcpServerTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn broadcast(&self, message: Message) {
        for socket in self.sockets.borrow().iter() {
            if let Err(err) = socket.send_message(message.clone(), None) {
                debug!(%err, "tcp: broadcast skipped a connection");
            }
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for socket in self.sockets.take() {
            socket.close_io();
        }
        self.reactor.deregister(self.fd);
    }
}

/// REUSEADDR, non-blocking, fixed backlog; `mio`'s own bind would pick the
/// backlog for us.
fn bind_listener(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}
