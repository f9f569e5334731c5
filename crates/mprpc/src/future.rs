use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use mprpc_reactor::Reactor;
use rmpv::Value;
use tracing::error;

use crate::error::RpcError;

enum CallState {
    Pending,
    Resolved(Value),
    Failed(RpcError),
}

/// Pending result of one outstanding request.
///
/// Held by the caller and, until terminal, by the session's request table.
/// Exactly one terminal transition happens over its lifetime.
pub struct CallFuture {
    reactor: Rc<Reactor>,
    state: RefCell<CallState>,
    /// Remaining ticks of the session timeout clock; `None` never expires.
    ticks_left: Cell<Option<u32>>,
}

impl CallFuture {
    pub(crate) fn new(reactor: Rc<Reactor>, timeout_ticks: Option<u32>) -> Rc<Self> {
        Rc::new(Self {
            reactor,
            state: RefCell::new(CallState::Pending),
            ticks_left: Cell::new(timeout_ticks),
        })
    }

    /// Pumps the reactor until the call is terminal, then returns the
    /// outcome.
    ///
    /// Refuses to block from inside a running loop (a dispatch handler on a
    /// shared reactor): pumping from there cannot make progress, so the
    /// attempt fails fast with a transport error. The future itself stays
    /// valid and can still be observed with [`try_get`](Self::try_get).
    pub fn get(&self) -> Result<Value, RpcError> {
        loop {
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            if self.reactor.is_running() {
                return Err(RpcError::transport(
                    "cannot block on a running loop; poll the future with try_get instead",
                ));
            }
            self.reactor.run();
        }
    }

    /// Non-blocking peek; `None` while still pending.
    pub fn try_get(&self) -> Option<Result<Value, RpcError>> {
        match &*self.state.borrow() {
            CallState::Pending => None,
            CallState::Resolved(value) => Some(Ok(value.clone())),
            CallState::Failed(err) => Some(Err(err.clone())),
        }
    }

    pub fn is_done(&self) -> bool {
        self.try_get().is_some()
    }

    pub(crate) fn set_result(&self, value: Value) {
        self.transition(CallState::Resolved(value));
    }

    pub(crate) fn set_error(&self, err: RpcError) {
        self.transition(CallState::Failed(err));
    }

    fn transition(&self, next: CallState) {
        let mut state = self.state.borrow_mut();
        if !matches!(*state, CallState::Pending) {
            debug_assert!(false, "future resolved twice");
            error!("future resolved twice, keeping the first outcome");
            return;
        }
        *state = next;
    }

    /// One tick of the timeout clock; true exactly when this tick expired
    /// the call.
    pub(crate) fn step_timeout(&self) -> bool {
        match self.ticks_left.get() {
            Some(1) => {
                self.ticks_left.set(None);
                true
            }
            Some(n) if n > 1 => {
                self.ticks_left.set(Some(n - 1));
                false
            }
            _ => false,
        }
    }
}
