#![allow(dead_code)]

use std::{net::SocketAddr, rc::Rc, sync::mpsc, thread};

use mprpc::{Methods, Reactor, Reply, Server, Value};

/// Development helper: installs a fmt subscriber when `RUST_LOG` is set.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Runs a server on its own thread and reactor. Clients end it by sending
/// the `shutdown` notification; the join handle resolves once the loop has
/// unwound.
pub fn spawn_server(
    build: impl FnOnce(&Rc<Reactor>, &mut Methods) + Send + 'static,
) -> (SocketAddr, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        init_tracing();
        let reactor = Rc::new(Reactor::new().expect("server reactor"));
        let mut methods = Methods::new();
        let stop = reactor.clone();
        methods.insert("shutdown", move |_| {
            stop.stop();
            Ok(Reply::value(Value::Nil))
        });
        build(&reactor, &mut methods);
        let server = Server::with_reactor(methods, reactor);
        let addr =
            server.listen("127.0.0.1:0".parse().expect("loopback address")).expect("listen");
        tx.send(addr).expect("publish the bound address");
        server.start();
        server.close();
    });
    (rx.recv().expect("server address"), handle)
}
