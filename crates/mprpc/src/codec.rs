use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use rmpv::decode::{self, read_value};
use rmpv::encode::write_value;

use crate::{error::RpcError, message::Message};

/// Packs one frame into a standalone byte buffer.
pub(crate) fn pack(message: Message) -> Result<Vec<u8>, RpcError> {
    let value = message.into_value();
    let mut buf = Vec::new();
    write_value(&mut buf, &value).map_err(|err| RpcError::Encoding(err.to_string()))?;
    Ok(buf)
}

/// Streaming frame decoder.
///
/// `feed` appends raw bytes as they arrive off the socket; `next` yields
/// complete frames. A truncated tail stays buffered until the rest arrives,
/// arbitrary re-chunking of the byte stream is invisible to callers.
#[derive(Default)]
pub(crate) struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn next(&mut self) -> Result<Option<Message>, RpcError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        match read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);
                Message::from_value(value).map(Some)
            }
            Err(err) if is_truncation(&err) => Ok(None),
            Err(err) => Err(RpcError::protocol(format!("undecodable frame: {err}"))),
        }
    }
}

/// EOF mid-value means the rest of the frame has not arrived yet.
fn is_truncation(err: &decode::Error) -> bool {
    matches!(
        err,
        decode::Error::InvalidMarkerRead(io) | decode::Error::InvalidDataRead(io)
            if io.kind() == io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Request {
                msgid: 0,
                method: "sum".into(),
                params: vec![Value::from(1), Value::from(2)],
            },
            Message::Response { msgid: 0, error: Value::Nil, result: Value::from(3) },
            Message::Notification { method: "log".into(), params: vec![Value::from("hi")] },
        ]
    }

    #[test]
    fn frames_survive_a_round_trip() {
        for message in sample_messages() {
            let bytes = pack(message.clone()).expect("pack");
            let mut decoder = Decoder::default();
            decoder.feed(&bytes);
            assert_eq!(decoder.next().expect("decode"), Some(message));
            assert_eq!(decoder.next().expect("tail"), None);
        }
    }

    #[test]
    fn byte_at_a_time_feeding_is_transparent() {
        let expected = sample_messages();
        let mut wire = Vec::new();
        for message in expected.clone() {
            wire.extend(pack(message).expect("pack"));
        }

        let mut decoder = Decoder::default();
        let mut decoded = Vec::new();
        for byte in wire {
            decoder.feed(&[byte]);
            while let Some(message) = decoder.next().expect("decode") {
                decoded.push(message);
            }
        }
        assert_eq!(decoded, expected);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let first = pack(Message::Notification { method: "a".into(), params: vec![] }).unwrap();
        let second = pack(Message::Notification { method: "b".into(), params: vec![] }).unwrap();
        let mut decoder = Decoder::default();
        decoder.feed(&[first, second].concat());
        assert!(decoder.next().unwrap().is_some());
        assert!(decoder.next().unwrap().is_some());
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn reserved_marker_is_a_protocol_error() {
        let mut decoder = Decoder::default();
        decoder.feed(&[0xc1]);
        assert!(matches!(decoder.next(), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn truncated_frame_waits_for_the_rest() {
        let bytes =
            pack(Message::Notification { method: "ping".into(), params: vec![] }).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let mut decoder = Decoder::default();
        decoder.feed(head);
        assert_eq!(decoder.next().expect("partial"), None);
        decoder.feed(tail);
        assert!(decoder.next().expect("complete").is_some());
    }
}
