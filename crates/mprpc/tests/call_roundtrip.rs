mod support;

use mprpc::{Client, Reply, Value, params};
use support::spawn_server;

fn sum_methods(methods: &mut mprpc::Methods) {
    methods.insert("sum", |params| {
        let x = params[0].as_i64().ok_or("sum: bad argument")?;
        let y = params[1].as_i64().ok_or("sum: bad argument")?;
        Ok(Reply::value(x + y))
    });
}

#[test]
fn call_returns_the_sum() {
    let (addr, server) = spawn_server(|_, methods| sum_methods(methods));
    let client = Client::new(addr).expect("client");

    assert_eq!(client.call("sum", params![1, 2]).expect("sum"), Value::from(3));

    client.notify("shutdown", params![]).expect("shutdown");
    client.close();
    server.join().expect("server thread");
}

#[test]
fn async_calls_resolve_by_msgid_not_by_get_order() {
    let (addr, server) = spawn_server(|_, methods| sum_methods(methods));
    let client = Client::new(addr).expect("client");

    let first = client.call_async("sum", params![1, 2]);
    let second = client.call_async("sum", params![10, 20]);
    assert_eq!(second.get().expect("second"), Value::from(30));
    assert_eq!(first.get().expect("first"), Value::from(3));
    assert!(first.is_done() && second.is_done());

    client.notify("shutdown", params![]).expect("shutdown");
    client.close();
    server.join().expect("server thread");
}

#[test]
fn calls_after_close_fail_with_a_transport_error() {
    let (addr, server) = spawn_server(|_, methods| sum_methods(methods));
    let client = Client::new(addr).expect("client");

    assert_eq!(client.call("sum", params![1, 2]).expect("sum"), Value::from(3));
    client.notify("shutdown", params![]).expect("shutdown");
    client.close();
    assert!(matches!(client.call("sum", params![1, 2]), Err(mprpc::RpcError::Transport(_))));
    server.join().expect("server thread");
}
