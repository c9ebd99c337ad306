use std::io::{Cursor, ErrorKind};

use bytes::{Buf, BytesMut};
use rmpv::Value;

use crate::{RpcError, RpcResult};

const KIND_REQUEST: u64 = 0;
const KIND_RESPONSE: u64 = 1;
const KIND_NOTIFICATION: u64 = 2;

/// One MessagePack-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u64,
        method: String,
        params: Vec<Value>,
    },
    Response {
        id: u64,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    pub fn into_value(self) -> Value {
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(KIND_REQUEST),
                Value::from(id),
                Value::from(method),
                Value::Array(params),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(KIND_RESPONSE),
                Value::from(id),
                error,
                result,
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(KIND_NOTIFICATION),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }

    pub fn from_value(value: Value) -> RpcResult<Self> {
        let Value::Array(items) = value else {
            return Err(RpcError::Protocol(format!("frame is not an array: {value}")));
        };
        let mut items = items.into_iter();
        let kind = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RpcError::Protocol("frame missing message kind".into()))?;

        match kind {
            KIND_REQUEST => {
                let id = take_u64(&mut items, "request id")?;
                let method = take_string(&mut items, "request method")?;
                let params = take_params(&mut items)?;
                Ok(Message::Request { id, method, params })
            }
            KIND_RESPONSE => {
                let id = take_u64(&mut items, "response id")?;
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                Ok(Message::Response { id, error, result })
            }
            KIND_NOTIFICATION => {
                let method = take_string(&mut items, "notification method")?;
                let params = take_params(&mut items)?;
                Ok(Message::Notification { method, params })
            }
            other => Err(RpcError::Protocol(format!("unknown message kind {other}"))),
        }
    }
}

fn take_u64(items: &mut impl Iterator<Item = Value>, what: &str) -> RpcResult<u64> {
    items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::Protocol(format!("{what} missing or not an unsigned integer")))
}

fn take_string(items: &mut impl Iterator<Item = Value>, what: &str) -> RpcResult<String> {
    match items.next() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| RpcError::Protocol(format!("{what} is not valid utf-8"))),
        Some(Value::Binary(bytes)) => String::from_utf8(bytes)
            .map_err(|_| RpcError::Protocol(format!("{what} is not valid utf-8"))),
        _ => Err(RpcError::Protocol(format!("{what} missing"))),
    }
}

fn take_params(items: &mut impl Iterator<Item = Value>) -> RpcResult<Vec<Value>> {
    match items.next() {
        Some(Value::Array(params)) => Ok(params),
        None | Some(Value::Nil) => Ok(Vec::new()),
        Some(other) => Err(RpcError::Protocol(format!("params are not an array: {other}"))),
    }
}

pub fn encode(message: Message) -> RpcResult<Vec<u8>> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &message.into_value())
        .map_err(|err| RpcError::Encode(err.to_string()))?;
    Ok(out)
}

/// Pops the next complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a partial value; the caller
/// should read more bytes and try again. Nothing is consumed in that case.
pub fn decode_next(buf: &mut BytesMut) -> RpcResult<Option<Message>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(&buf[..]);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => {
            let consumed = cursor.position() as usize;
            buf.advance(consumed);
            Message::from_value(value).map(Some)
        }
        Err(rmpv::decode::Error::InvalidMarkerRead(err))
        | Err(rmpv::decode::Error::InvalidDataRead(err))
            if err.kind() == ErrorKind::UnexpectedEof =>
        {
            Ok(None)
        }
        Err(err) => Err(RpcError::Decode(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout_matches_wire_format() {
        let bytes = encode(Message::Request {
            id: 7,
            method: "nvim_win_get_cursor".into(),
            params: vec![Value::from(1)],
        })
        .expect("encode");
        let value = rmpv::decode::read_value(&mut &bytes[..]).expect("decode");
        assert_eq!(
            value,
            Value::Array(vec![
                Value::from(0),
                Value::from(7),
                Value::from("nvim_win_get_cursor"),
                Value::Array(vec![Value::from(1)]),
            ])
        );
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let bytes = encode(Message::Notification {
            method: "redraw".into(),
            params: vec![Value::from("x".repeat(64))],
        })
        .expect("encode");

        let mut buf = BytesMut::from(&bytes[..bytes.len() - 5]);
        assert!(decode_next(&mut buf).expect("partial ok").is_none());
        assert_eq!(buf.len(), bytes.len() - 5, "partial decode must not consume");

        buf.extend_from_slice(&bytes[bytes.len() - 5..]);
        let message = decode_next(&mut buf).expect("decode").expect("complete frame");
        assert!(matches!(message, Message::Notification { ref method, .. } if method == "redraw"));
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        for id in 1..=3u64 {
            buf.extend_from_slice(
                &encode(Message::Response {
                    id,
                    error: Value::Nil,
                    result: Value::from(id * 10),
                })
                .expect("encode"),
            );
        }
        let mut ids = Vec::new();
        while let Some(Message::Response { id, result, .. }) = decode_next(&mut buf).expect("decode")
        {
            assert_eq!(result.as_u64(), Some(id * 10));
            ids.push(id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_unknown_kind() {
        let value = Value::Array(vec![Value::from(9), Value::from(1)]);
        let err = Message::from_value(value).expect_err("unknown kind");
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
