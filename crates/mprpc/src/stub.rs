//! Typed client stubs.
//!
//! The runtime surface is dynamically typed: `call("sum", params![1, 2])`.
//! For a fixed service contract, [`rpc_stubs!`] generates a wrapper struct
//! with one typed method per remote procedure, so the method name and the
//! result conversion live in one place:
//!
//! ```no_run
//! use mprpc::{Client, rpc_stubs};
//!
//! rpc_stubs! {
//!     struct Calculator {
//!         fn sum(x: i64, y: i64) -> i64;
//!         notify reset();
//!     }
//! }
//!
//! let client = Client::new("127.0.0.1:18800".parse().unwrap()).unwrap();
//! let calc = Calculator::new(client);
//! assert_eq!(calc.sum(1, 2).unwrap(), 3);
//! calc.reset().unwrap();
//! ```

/// Generates a typed wrapper over [`Client`](crate::Client).
///
/// `fn name(args) -> T;` becomes a blocking call whose result converts via
/// [`FromValue`](crate::FromValue); `notify name(args);` becomes a
/// notification.
#[macro_export]
macro_rules! rpc_stubs {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($body:tt)*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            client: $crate::Client,
        }

        impl $name {
            $vis fn new(client: $crate::Client) -> Self {
                Self { client }
            }

            $vis fn client(&self) -> &$crate::Client {
                &self.client
            }

            $crate::rpc_stubs!(@methods $($body)*);
        }
    };

    (@methods) => {};

    (@methods fn $method:ident($($arg:ident : $ty:ty),* $(,)?) -> $ret:ty; $($rest:tt)*) => {
        pub fn $method(&self, $($arg: $ty),*) -> ::std::result::Result<$ret, $crate::RpcError> {
            let result = self.client.call(stringify!($method), $crate::params![$($arg),*])?;
            <$ret as $crate::FromValue>::from_value(result)
        }
        $crate::rpc_stubs!(@methods $($rest)*);
    };

    (@methods notify $method:ident($($arg:ident : $ty:ty),* $(,)?); $($rest:tt)*) => {
        pub fn $method(&self, $($arg: $ty),*) -> ::std::result::Result<(), $crate::RpcError> {
            self.client.notify(stringify!($method), $crate::params![$($arg),*])
        }
        $crate::rpc_stubs!(@methods $($rest)*);
    };
}
