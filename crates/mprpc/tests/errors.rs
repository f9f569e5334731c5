mod support;

use mprpc::{Client, Reply, RpcError, Value, params};
use support::spawn_server;

fn fallible_methods(methods: &mut mprpc::Methods) {
    methods.insert("ping", |_| Ok(Reply::value(true)));
    methods.insert("crash", |params| {
        let divisor = params[0].as_i64().ok_or("crash: bad argument")?;
        Ok(Reply::value(10 / divisor))
    });
}

#[test]
fn unknown_methods_fail_the_call_but_not_the_server() {
    let (addr, server) = spawn_server(|_, methods| fallible_methods(methods));
    let client = Client::new(addr).expect("client");

    let err = client.call("nope", params![]).expect_err("no such method");
    assert!(matches!(err, RpcError::Remote(_)));
    assert!(err.to_string().contains("method not found"), "got: {err}");

    assert_eq!(client.call("ping", params![]).expect("ping"), Value::from(true));

    client.notify("shutdown", params![]).expect("shutdown");
    client.close();
    server.join().expect("server thread");
}

#[test]
fn panicking_handlers_fail_the_call_but_not_the_server() {
    let (addr, server) = spawn_server(|_, methods| fallible_methods(methods));
    let client = Client::new(addr).expect("client");

    let err = client.call("crash", params![0]).expect_err("division by zero");
    assert!(matches!(err, RpcError::Remote(_)));
    assert!(err.to_string().contains("divide by zero"), "got: {err}");

    assert_eq!(client.call("ping", params![]).expect("ping"), Value::from(true));

    client.notify("shutdown", params![]).expect("shutdown");
    client.close();
    server.join().expect("server thread");
}
