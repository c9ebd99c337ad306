use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;
use transport_msgpack::{Client, Value, rmpv};

use super::{
    BufferHandle, CursorPosition, RemoteSurface, SurfaceError, SurfaceResult, WindowHandle,
};

/// Ext type ids Neovim advertises in its API metadata.
const EXT_BUFFER: i8 = 0;
const EXT_WINDOW: i8 = 1;

/// Neovim API binding over a MessagePack-RPC connection.
#[derive(Clone)]
pub struct NvimSurface {
    client: Arc<Client>,
}

impl NvimSurface {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    pub async fn command(&self, command: &str) -> SurfaceResult<()> {
        trace!(target = "pager::nvim", command, "nvim_command");
        self.client
            .call("nvim_command", vec![Value::from(command)])
            .await?;
        Ok(())
    }

    pub async fn current_buffer(&self) -> SurfaceResult<BufferHandle> {
        let reply = self.client.call("nvim_get_current_buf", Vec::new()).await?;
        decode_handle(&reply, EXT_BUFFER, "nvim_get_current_buf").map(BufferHandle)
    }

    pub async fn current_window(&self) -> SurfaceResult<WindowHandle> {
        let reply = self.client.call("nvim_get_current_win", Vec::new()).await?;
        decode_handle(&reply, EXT_WINDOW, "nvim_get_current_win").map(WindowHandle)
    }

    pub async fn set_buffer_option(
        &self,
        buffer: BufferHandle,
        name: &str,
        value: Value,
    ) -> SurfaceResult<()> {
        self.client
            .call(
                "nvim_buf_set_option",
                vec![encode_handle(EXT_BUFFER, buffer.0), Value::from(name), value],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSurface for NvimSurface {
    async fn window_buffer(&self, window: WindowHandle) -> SurfaceResult<BufferHandle> {
        let reply = self
            .client
            .call("nvim_win_get_buf", vec![encode_handle(EXT_WINDOW, window.0)])
            .await?;
        decode_handle(&reply, EXT_BUFFER, "nvim_win_get_buf").map(BufferHandle)
    }

    async fn window_cursor(&self, window: WindowHandle) -> SurfaceResult<CursorPosition> {
        let reply = self
            .client
            .call("nvim_win_get_cursor", vec![encode_handle(EXT_WINDOW, window.0)])
            .await?;
        decode_position(&reply)
    }

    async fn set_lines(
        &self,
        buffer: BufferHandle,
        start: i64,
        end: i64,
        strict: bool,
        lines: &[Bytes],
    ) -> SurfaceResult<()> {
        // Lines go out as msgpack bin so input that is not valid UTF-8 passes through untouched.
        let replacement = lines
            .iter()
            .map(|line| Value::Binary(line.to_vec()))
            .collect::<Vec<_>>();
        self.client
            .call(
                "nvim_buf_set_lines",
                vec![
                    encode_handle(EXT_BUFFER, buffer.0),
                    Value::from(start),
                    Value::from(end),
                    Value::from(strict),
                    Value::Array(replacement),
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_cursor(&self, window: WindowHandle, position: CursorPosition) -> SurfaceResult<()> {
        self.client
            .call(
                "nvim_win_set_cursor",
                vec![
                    encode_handle(EXT_WINDOW, window.0),
                    Value::Array(vec![Value::from(position.row), Value::from(position.col)]),
                ],
            )
            .await?;
        Ok(())
    }
}

fn encode_handle(ext: i8, id: i64) -> Value {
    let mut data = Vec::with_capacity(9);
    // Writing into a Vec cannot fail.
    let _ = rmpv::encode::write_value(&mut data, &Value::from(id));
    Value::Ext(ext, data)
}

fn decode_handle(value: &Value, expected_ext: i8, call: &'static str) -> SurfaceResult<i64> {
    match value {
        Value::Ext(ext, data) if *ext == expected_ext => rmpv::decode::read_value(&mut &data[..])
            .ok()
            .and_then(|inner| inner.as_i64())
            .ok_or_else(|| SurfaceError::UnexpectedReply {
                call,
                detail: format!("undecodable handle payload {data:?}"),
            }),
        Value::Integer(id) => id.as_i64().ok_or_else(|| SurfaceError::UnexpectedReply {
            call,
            detail: format!("handle out of range: {id}"),
        }),
        other => Err(SurfaceError::UnexpectedReply {
            call,
            detail: format!("expected handle, got {other}"),
        }),
    }
}

fn decode_position(value: &Value) -> SurfaceResult<CursorPosition> {
    let coords = value
        .as_array()
        .filter(|items| items.len() == 2)
        .and_then(|items| Some(CursorPosition::new(items[0].as_i64()?, items[1].as_i64()?)));
    coords.ok_or_else(|| SurfaceError::UnexpectedReply {
        call: "nvim_win_get_cursor",
        detail: format!("expected [row, col], got {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_survive_ext_encoding() {
        for id in [0i64, 1, 1000, 65_536, i64::from(i32::MAX)] {
            let encoded = encode_handle(EXT_WINDOW, id);
            assert_eq!(decode_handle(&encoded, EXT_WINDOW, "test").unwrap(), id);
        }
    }

    #[test]
    fn handle_with_wrong_ext_type_is_rejected() {
        let encoded = encode_handle(EXT_WINDOW, 1000);
        let err = decode_handle(&encoded, EXT_BUFFER, "nvim_win_get_buf").unwrap_err();
        assert!(matches!(
            err,
            SurfaceError::UnexpectedReply { call: "nvim_win_get_buf", .. }
        ));
    }

    #[test]
    fn plain_integer_handles_are_accepted() {
        assert_eq!(decode_handle(&Value::from(3), EXT_BUFFER, "test").unwrap(), 3);
    }

    #[test]
    fn cursor_reply_decodes_row_and_col() {
        let reply = Value::Array(vec![Value::from(42), Value::from(7)]);
        assert_eq!(decode_position(&reply).unwrap(), CursorPosition::new(42, 7));
        assert!(decode_position(&Value::Array(vec![Value::from(1)])).is_err());
    }
}
