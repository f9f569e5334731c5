use rmpv::Value;

use crate::error::RpcError;

pub(crate) const REQUEST: u64 = 0;
pub(crate) const RESPONSE: u64 = 1;
pub(crate) const NOTIFY: u64 = 2;

/// Highest msgid handed out before the generator wraps back to 0.
pub(crate) const MSGID_MAX: u32 = 1 << 30;

/// One MessagePack-RPC frame: a tagged array of length 4 (request,
/// response) or 3 (notification).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { msgid: u32, method: String, params: Vec<Value> },
    /// Exactly one of `error`/`result` is non-nil on a well-behaved peer.
    Response { msgid: u32, error: Value, result: Value },
    Notification { method: String, params: Vec<Value> },
}

impl Message {
    pub(crate) fn into_value(self) -> Value {
        match self {
            Message::Request { msgid, method, params } => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(msgid),
                Value::from(method),
                Value::Array(params),
            ]),
            Message::Response { msgid, error, result } => Value::Array(vec![
                Value::from(RESPONSE),
                Value::from(msgid),
                error,
                result,
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFY),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }

    /// Validates a decoded frame: array, length in {3, 4}, known tag, arity
    /// matching the tag.
    pub(crate) fn from_value(value: Value) -> Result<Self, RpcError> {
        let Value::Array(fields) = value else {
            return Err(RpcError::protocol(format!("message is not an array: {value}")));
        };
        let len = fields.len();
        if len != 3 && len != 4 {
            return Err(RpcError::protocol(format!("message of length {len}")));
        }
        let mut fields = fields.into_iter();
        let tag = uint_field(fields.next(), "tag")?;
        match (tag, len) {
            (REQUEST, 4) => Ok(Message::Request {
                msgid: msgid_field(fields.next())?,
                method: method_field(fields.next())?,
                params: params_field(fields.next())?,
            }),
            (RESPONSE, 4) => Ok(Message::Response {
                msgid: msgid_field(fields.next())?,
                error: fields.next().unwrap_or(Value::Nil),
                result: fields.next().unwrap_or(Value::Nil),
            }),
            (NOTIFY, 3) => Ok(Message::Notification {
                method: method_field(fields.next())?,
                params: params_field(fields.next())?,
            }),
            (tag, len) => {
                Err(RpcError::protocol(format!("unknown message: tag = {tag}, length = {len}")))
            }
        }
    }
}

fn uint_field(value: Option<Value>, what: &str) -> Result<u64, RpcError> {
    match value {
        Some(Value::Integer(n)) => {
            n.as_u64().ok_or_else(|| RpcError::protocol(format!("negative {what}")))
        }
        other => Err(RpcError::protocol(format!("bad {what}: {other:?}"))),
    }
}

fn msgid_field(value: Option<Value>) -> Result<u32, RpcError> {
    let n = uint_field(value, "msgid")?;
    u32::try_from(n).map_err(|_| RpcError::protocol(format!("msgid out of range: {n}")))
}

/// Method names are normalised to text whether the peer packed them as `str`
/// or as raw bytes.
fn method_field(value: Option<Value>) -> Result<String, RpcError> {
    match value {
        Some(Value::String(s)) => Ok(String::from_utf8_lossy(&s.into_bytes()).into_owned()),
        Some(Value::Binary(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        other => Err(RpcError::protocol(format!("bad method name: {other:?}"))),
    }
}

fn params_field(value: Option<Value>) -> Result<Vec<Value>, RpcError> {
    match value {
        Some(Value::Array(params)) => Ok(params),
        other => Err(RpcError::protocol(format!("params are not an array: {other:?}"))),
    }
}
