/// Callbacks the reactor delivers to the owner of a registered fd.
///
/// Owners are shared (`Rc`) between the reactor and their transport, so the
/// callbacks take `&self` and mutable state lives behind interior
/// mutability.
pub trait EventHandler {
    /// The fd has data to read, or the peer closed its half of the stream.
    fn on_readable(&self) {}

    /// The fd accepts writes. Also the completion edge of a non-blocking
    /// connect.
    fn on_writable(&self) {}

    /// The fd is in an error state.
    fn on_error(&self) {}
}
