use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use mprpc_reactor::Reactor;
use rmpv::Value;
use tracing::debug;

use crate::{
    error::RpcError,
    future::CallFuture,
    message::{MSGID_MAX, Message},
    transport::Transport,
};

/// Interval of the timeout clock; call deadlines count these ticks.
pub(crate) const TIMEOUT_TICK: Duration = Duration::from_secs(1);

/// Client-side protocol engine.
///
/// Correlates outbound requests with inbound responses through the request
/// table: `send_request` allocates a msgid and parks a future under it, the
/// transport feeds `on_response` which pops and resolves the future. Entries
/// leave the table on response, timeout, connection failure or close, and a
/// msgid is retired before the generator can ever reuse it.
pub struct Session {
    reactor: Rc<Reactor>,
    address: SocketAddr,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    table: RefCell<HashMap<u32, Rc<CallFuture>>>,
    next_msgid: Cell<u32>,
    timeout_ticks: Option<u32>,
    closed: Cell<bool>,
}

impl Session {
    pub(crate) fn new(reactor: Rc<Reactor>, address: SocketAddr, timeout: Duration) -> Rc<Self> {
        let timeout_ticks = if timeout.is_zero() {
            None
        } else {
            Some(timeout.as_millis().div_ceil(TIMEOUT_TICK.as_millis()).max(1) as u32)
        };
        Rc::new(Self {
            reactor,
            address,
            transport: RefCell::new(None),
            table: RefCell::new(HashMap::new()),
            next_msgid: Cell::new(0),
            timeout_ticks,
            closed: Cell::new(false),
        })
    }

    pub(crate) fn set_transport(&self, transport: Rc<dyn Transport>) {
        *self.transport.borrow_mut() = Some(transport);
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// Allocates a msgid, parks a future in the request table and ships the
    /// request frame. On a closed session the future comes back already
    /// failed.
    pub fn send_request(&self, method: &str, params: Vec<Value>) -> Rc<CallFuture> {
        let future = CallFuture::new(self.reactor.clone(), self.timeout_ticks);
        let Some(transport) = self.transport_handle() else {
            future.set_error(RpcError::transport("session is closed"));
            return future;
        };
        let msgid = self.next_msgid();
        self.table.borrow_mut().insert(msgid, future.clone());
        let message = Message::Request { msgid, method: method.to_owned(), params };
        if let Err(err) = transport.send_message(message, None) {
            self.table.borrow_mut().remove(&msgid);
            future.set_error(err);
        }
        future
    }

    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.send_request(method, params).get()
    }

    /// Sends a notification and pumps the loop until the frame has been
    /// flushed to the kernel (or the session dies underneath it). From
    /// inside a running loop the flush cannot be awaited and the attempt
    /// fails fast instead.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        let Some(transport) = self.transport_handle() else {
            return Err(RpcError::transport("session is closed"));
        };
        let flushed = Rc::new(Cell::new(false));
        let done = {
            let flushed = flushed.clone();
            let reactor = self.reactor.clone();
            Box::new(move || {
                flushed.set(true);
                reactor.stop();
            })
        };
        let message = Message::Notification { method: method.to_owned(), params };
        transport.send_message(message, Some(done))?;
        while !flushed.get() && !self.closed.get() {
            if self.reactor.is_running() {
                // Inside a dispatch handler the loop cannot be pumped from
                // here; the frame stays queued and drains as the outer loop
                // runs, but the flush cannot be awaited.
                return Err(RpcError::transport(
                    "cannot block on a running loop; the notification stays queued",
                ));
            }
            self.reactor.run();
        }
        if flushed.get() {
            Ok(())
        } else {
            Err(RpcError::transport("session closed before the notification was sent"))
        }
    }

    /// Idempotent. Outstanding futures fail instead of dangling so a blocked
    /// `get` cannot hang forever.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(transport) = self.transport.borrow_mut().take() {
            transport.close();
        }
        let drained: Vec<_> = self.table.borrow_mut().drain().map(|(_, f)| f).collect();
        for future in drained {
            future.set_error(RpcError::transport("session is closed"));
        }
    }

    /// Response routing. Unknown msgids (late responses of timed-out calls)
    /// are dropped without effect.
    pub(crate) fn on_response(&self, msgid: u32, error: Value, result: Value) {
        let Some(future) = self.table.borrow_mut().remove(&msgid) else {
            debug!(msgid, "late or unknown response, dropping");
            return;
        };
        if error.is_nil() {
            future.set_result(result);
        } else {
            future.set_error(RpcError::Remote(error));
        }
        self.reactor.stop();
    }

    /// The transport gave up: every outstanding call fails with `reason` and
    /// the session closes.
    pub(crate) fn on_connect_failed(&self, reason: RpcError) {
        let drained: Vec<_> = self.table.borrow_mut().drain().map(|(_, f)| f).collect();
        for future in drained {
            future.set_error(reason.clone());
        }
        self.close();
        self.reactor.stop();
    }

    /// Periodic tick: ages every pending call and expires those whose budget
    /// ran out, stopping the loop so blocked `get`s observe the failure.
    pub(crate) fn step_timeouts(&self) {
        let expired: Vec<u32> = self
            .table
            .borrow()
            .iter()
            .filter(|(_, future)| future.step_timeout())
            .map(|(msgid, _)| *msgid)
            .collect();
        if expired.is_empty() {
            return;
        }
        self.reactor.stop();
        let mut table = self.table.borrow_mut();
        for msgid in expired {
            if let Some(future) = table.remove(&msgid) {
                future.set_error(RpcError::Timeout);
            }
        }
    }

    fn next_msgid(&self) -> u32 {
        let msgid = self.next_msgid.get();
        self.next_msgid.set(if msgid >= MSGID_MAX { 0 } else { msgid + 1 });
        msgid
    }

    fn transport_handle(&self) -> Option<Rc<dyn Transport>> {
        if self.closed.get() {
            return None;
        }
        self.transport.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Rc<Session> {
        let reactor = Rc::new(Reactor::new().expect("reactor"));
        Session::new(reactor, "127.0.0.1:9199".parse().unwrap(), Duration::ZERO)
    }

    #[test]
    fn msgids_wrap_at_the_generator_limit() {
        let session = session();
        session.next_msgid.set(MSGID_MAX - 1);
        assert_eq!(session.next_msgid(), MSGID_MAX - 1);
        assert_eq!(session.next_msgid(), MSGID_MAX);
        assert_eq!(session.next_msgid(), 0);
        assert_eq!(session.next_msgid(), 1);
    }

    #[test]
    fn requests_on_a_closed_session_fail_immediately() {
        let session = session();
        session.close();
        let future = session.send_request("ping", vec![]);
        assert!(matches!(future.try_get(), Some(Err(RpcError::Transport(_)))));
        assert!(matches!(session.notify("ping", vec![]), Err(RpcError::Transport(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let session = session();
        session.close();
        session.close();
    }

    #[test]
    fn late_responses_are_dropped_silently() {
        let session = session();
        session.on_response(7, Value::Nil, Value::from(1));
    }
}
