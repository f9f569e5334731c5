use rmpv::Value;
use thiserror::Error;

/// Failure taxonomy for calls, transports and framing.
///
/// `Clone` so one transport failure can fan out to every pending future.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// Malformed frame, unknown tag or mismatched arity. Fatal to the
    /// connection that produced it, never to the process.
    #[error("invalid MessagePack-RPC protocol: {0}")]
    Protocol(String),

    /// Connect retries exhausted, peer gone, or operation on a closed
    /// object.
    #[error("{0}")]
    Transport(String),

    /// The request outlived its deadline.
    #[error("Request timed out")]
    Timeout,

    /// The server answered with a non-nil error value.
    #[error("remote error: {0}")]
    Remote(Value),

    /// No handler registered under the requested name. Server side only;
    /// on the wire it becomes the error slot of the response.
    #[error("'{0}' method not found")]
    NoMethod(String),

    /// Pack-side failure or a value conversion that did not fit.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl RpcError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}
