use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use rmpv::Value;
use thiserror::Error;
use tracing::debug;

use crate::{message::Message, transport::Sendable};

/// What a handler produced for one request.
pub enum Reply {
    /// Respond immediately with this value.
    Value(Value),
    /// The response will be produced later through the carried
    /// [`AsyncResult`].
    Deferred(AsyncResult),
}

impl Reply {
    pub fn value(value: impl Into<Value>) -> Self {
        Reply::Value(value.into())
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reply::Deferred(_) => f.debug_tuple("Deferred").finish(),
        }
    }
}

impl From<AsyncResult> for Reply {
    fn from(deferred: AsyncResult) -> Self {
        Reply::Deferred(deferred)
    }
}

/// Dispatch-layer failure; stringified into the error slot of the response
/// frame.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("'{0}' method not found")]
    NoMethod(String),
    #[error("{0}")]
    Handler(String),
}

/// Name-addressable set of method implementations a server dispatches into.
pub trait Dispatcher {
    fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Reply, DispatchError>;
}

pub type Handler = Box<dyn Fn(Vec<Value>) -> Result<Reply, String>>;

/// Ready-made [`Dispatcher`]: a map from method name to handler closure.
#[derive(Default)]
pub struct Methods {
    table: HashMap<String, Handler>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler of
    /// that name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> Result<Reply, String> + 'static,
    ) {
        self.table.insert(name.into(), Box::new(handler));
    }
}

impl Dispatcher for Methods {
    fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Reply, DispatchError> {
        let Some(handler) = self.table.get(method) else {
            return Err(DispatchError::NoMethod(method.to_owned()));
        };
        handler(params).map_err(DispatchError::Handler)
    }
}

/// One-shot handle that emits the response frame for a given msgid.
///
/// At most one frame per msgid; later calls are no-ops. A responder without
/// a peer (notifications) drops results.
pub(crate) struct Responder {
    peer: Option<Rc<dyn Sendable>>,
    msgid: u32,
    sent: Cell<bool>,
}

impl Responder {
    pub(crate) fn new(peer: Rc<dyn Sendable>, msgid: u32) -> Self {
        Self { peer: Some(peer), msgid, sent: Cell::new(false) }
    }

    pub(crate) fn null() -> Self {
        Self { peer: None, msgid: 0, sent: Cell::new(false) }
    }

    pub(crate) fn set_result(&self, value: impl Into<Value>) {
        self.respond(value.into(), Value::Nil);
    }

    pub(crate) fn set_error(&self, error: impl Into<Value>) {
        self.respond(Value::Nil, error.into());
    }

    fn respond(&self, result: Value, error: Value) {
        if self.sent.replace(true) {
            return;
        }
        let Some(peer) = &self.peer else { return };
        let message = Message::Response { msgid: self.msgid, error, result };
        if let Err(err) = peer.send_message(message, None) {
            debug!(%err, msgid = self.msgid, "response dropped");
        }
    }
}

/// Marker a handler returns when the response will be produced later.
///
/// The handler keeps a clone and completes it from a subsequent loop
/// callback. Completion and responder binding can happen in either order: the
/// first side parks its half, the second replays it.
#[derive(Clone, Default)]
pub struct AsyncResult {
    inner: Rc<RefCell<AsyncInner>>,
}

#[derive(Default)]
struct AsyncInner {
    responder: Option<Responder>,
    /// Parked (result, error) pair when completed before binding.
    outcome: Option<(Value, Value)>,
}

impl AsyncResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_result(&self, value: impl Into<Value>) {
        self.complete(value.into(), Value::Nil);
    }

    pub fn set_error(&self, error: impl Into<Value>) {
        self.complete(Value::Nil, error.into());
    }

    fn complete(&self, result: Value, error: Value) {
        let inner = self.inner.borrow();
        if let Some(responder) = &inner.responder {
            responder.respond(result, error);
        } else {
            drop(inner);
            self.inner.borrow_mut().outcome = Some((result, error));
        }
    }

    pub(crate) fn bind(&self, responder: Responder) {
        let mut inner = self.inner.borrow_mut();
        if let Some((result, error)) = inner.outcome.take() {
            responder.respond(result, error);
        }
        inner.responder = Some(responder);
    }
}
