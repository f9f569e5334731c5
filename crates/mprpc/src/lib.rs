//! MessagePack-RPC over non-blocking TCP.
//!
//! Frames are MessagePack arrays tagged 0/1/2 (request/response/notify)
//! with no framing beyond MessagePack itself. Everything runs on a
//! single-threaded reactor: blocking entry points — [`Client::call`],
//! [`Client::notify`], [`CallFuture::get`] — pump the loop until the event
//! they are waiting for has fired.
//!
//! ```no_run
//! use mprpc::{Client, params};
//!
//! let client = Client::new("127.0.0.1:18800".parse().unwrap()).unwrap();
//! let sum = client.call("sum", params![1, 2]).unwrap();
//! assert_eq!(sum, mprpc::Value::from(3));
//! ```

mod client;
mod codec;
pub mod dispatch;
mod error;
mod future;
mod message;
mod server;
mod session;
mod stub;
pub mod transport;
mod value;

pub use client::{Client, ClientConfig};
pub use dispatch::{AsyncResult, DispatchError, Dispatcher, Methods, Reply};
pub use error::RpcError;
pub use future::CallFuture;
pub use message::Message;
pub use mprpc_reactor::{EventHandler, Interest, Reactor};
pub use rmpv::Value;
pub use server::Server;
pub use session::Session;
pub use value::FromValue;
