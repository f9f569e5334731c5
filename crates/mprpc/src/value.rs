use rmpv::Value;

use crate::error::RpcError;

/// Conversion out of a decoded MessagePack value; call results and generated
/// stubs go through this.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, RpcError>;
}

fn mismatch(expected: &str, got: &Value) -> RpcError {
    RpcError::Encoding(format!("expected {expected}, got {got}"))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Nil => Ok(()),
            other => Err(mismatch("nil", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Boolean(b) => Ok(b),
            other => Err(mismatch("a boolean", &other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Integer(n) => n.as_i64().ok_or_else(|| {
                RpcError::Encoding(format!("integer out of i64 range: {n}"))
            }),
            other => Err(mismatch("an integer", &other)),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Integer(n) => n.as_u64().ok_or_else(|| {
                RpcError::Encoding(format!("integer out of u64 range: {n}"))
            }),
            other => Err(mismatch("an unsigned integer", &other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide)
            .map_err(|_| RpcError::Encoding(format!("integer out of i32 range: {wide}")))
    }
}

impl FromValue for u32 {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        let wide = u64::from_value(value)?;
        u32::try_from(wide)
            .map_err(|_| RpcError::Encoding(format!("integer out of u32 range: {wide}")))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::F64(f) => Ok(f),
            Value::F32(f) => Ok(f64::from(f)),
            other => Err(mismatch("a float", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| RpcError::Encoding("string is not valid UTF-8".into())),
            other => Err(mismatch("a string", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch("an array", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Builds the `Vec<Value>` parameter list of a call from heterogeneous
/// arguments.
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($arg:expr),+ $(,)?) => { ::std::vec![$($crate::Value::from($arg)),+] };
}
