//! The remote, append-only text surface the pipeline renders into.
//!
//! [`RemoteSurface`] is the only seam between the write pipeline and the
//! editor: `nvim` implements it over MessagePack-RPC, `mock` in memory.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use transport_msgpack::RpcError;

pub mod mock;
pub mod nvim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub i64);

/// Cursor as the editor reports it: `row` is 1-based, `col` is a 0-based byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorPosition {
    pub row: i64,
    pub col: i64,
}

impl CursorPosition {
    pub const fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }
}

/// Buffer the pipeline writes into and the window that may be following it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceTarget {
    pub buffer: BufferHandle,
    pub window: WindowHandle,
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("unexpected reply to {call}: {detail}")]
    UnexpectedReply { call: &'static str, detail: String },
    #[error("surface call {call} failed: {detail}")]
    Failed { call: &'static str, detail: String },
}

pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// Line and cursor operations against a bound buffer/window pair.
///
/// `start`/`end` follow the editor's convention: zero-based, end-exclusive,
/// and `-1` means "past the last line".
#[async_trait]
pub trait RemoteSurface: Send + Sync {
    async fn window_buffer(&self, window: WindowHandle) -> SurfaceResult<BufferHandle>;

    async fn window_cursor(&self, window: WindowHandle) -> SurfaceResult<CursorPosition>;

    async fn set_lines(
        &self,
        buffer: BufferHandle,
        start: i64,
        end: i64,
        strict: bool,
        lines: &[Bytes],
    ) -> SurfaceResult<()>;

    async fn set_cursor(&self, window: WindowHandle, position: CursorPosition) -> SurfaceResult<()>;
}
