mod handler;
mod reactor;

pub use handler::EventHandler;
pub use mio::Interest;
pub use reactor::Reactor;
