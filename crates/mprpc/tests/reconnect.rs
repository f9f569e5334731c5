mod support;

use std::{
    io::{self, Read},
    net::{SocketAddr, TcpListener},
    thread,
    time::Duration,
};

use mprpc::{Client, ClientConfig, Reply, RpcError, Value, params};
use support::spawn_server;

fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

#[test]
fn retries_exhaust_with_a_transport_error() {
    let config = ClientConfig { reconnect_limit: 3, ..Default::default() };
    let client = Client::with_config(unused_addr(), config).expect("client");

    let err = client.call("ping", params![]).expect_err("nobody is listening");
    assert!(matches!(err, RpcError::Transport(_)));
    assert_eq!(err.to_string(), "Retry connection over the limit");

    // Retry exhaustion kills the session for good.
    assert!(matches!(client.call("ping", params![]), Err(RpcError::Transport(_))));
    client.close();
}

#[test]
fn losing_an_established_connection_fails_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = [0_u8; 256];
        let _ = stream.read(&mut buf); // the request frame
        drop(stream); // hang up mid-session
        // A default-mode client must not come back.
        thread::sleep(Duration::from_millis(300));
        listener.set_nonblocking(true).expect("nonblocking");
        matches!(listener.accept(), Err(ref err) if err.kind() == io::ErrorKind::WouldBlock)
    });

    let client = Client::new(addr).expect("client");
    let err = client.call("ping", params![]).expect_err("the peer hung up");
    assert!(matches!(err, RpcError::Transport(_)));
    assert_eq!(err.to_string(), "connection closed by peer");

    // The loss killed the session instead of re-entering the retry path.
    assert!(matches!(client.call("ping", params![]), Err(RpcError::Transport(_))));
    assert!(peer.join().expect("peer thread"), "unexpected reconnect attempt");
    client.close();
}

#[test]
fn legacy_mode_funnels_loss_back_into_the_retry_path() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = [0_u8; 256];
        let _ = stream.read(&mut buf);
        drop(stream);
        // Legacy mode treats the loss as a failed connect and reconnects.
        let (mut retry, _) = listener.accept().expect("reconnect attempt");
        // Hold the replacement connection open until the client hangs up.
        let mut sink = [0_u8; 256];
        while matches!(retry.read(&mut sink), Ok(n) if n > 0) {}
        true
    });

    let config = ClientConfig {
        timeout: Duration::from_secs(1),
        close_as_connect_failed: true,
        ..Default::default()
    };
    let client = Client::with_config(addr, config).expect("client");
    // The request died with the first connection and is never answered, so
    // the call runs into its deadline while the transport reconnects.
    let err = client.call("ping", params![]).expect_err("no reply on the new connection");
    assert_eq!(err, RpcError::Timeout);

    client.close();
    assert!(peer.join().expect("peer thread"));
}

#[test]
fn a_fresh_client_reaches_a_later_server() {
    let (addr, server) = spawn_server(|_, methods| {
        methods.insert("ping", |_| Ok(Reply::value(true)));
    });
    let client = Client::new(addr).expect("client");
    assert_eq!(client.call("ping", params![]).expect("ping"), Value::from(true));

    client.notify("shutdown", params![]).expect("shutdown");
    client.close();
    server.join().expect("server thread");
}
