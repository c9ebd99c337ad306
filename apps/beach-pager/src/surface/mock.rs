use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    BufferHandle, CursorPosition, RemoteSurface, SurfaceError, SurfaceResult, SurfaceTarget,
    WindowHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    WindowBuffer,
    WindowCursor,
    SetLines,
    SetCursor,
}

impl MockCall {
    fn name(self) -> &'static str {
        match self {
            MockCall::WindowBuffer => "window_buffer",
            MockCall::WindowCursor => "window_cursor",
            MockCall::SetLines => "set_lines",
            MockCall::SetCursor => "set_cursor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub start: i64,
    pub end: i64,
    pub strict: bool,
    pub lines: Vec<Bytes>,
}

impl RecordedWrite {
    pub fn is_replace(&self) -> bool {
        self.start == 0 && self.end == -1
    }

    pub fn is_append(&self) -> bool {
        self.start == -1 && self.end == -1
    }

    pub fn text(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}

struct MockState {
    buffer: BufferHandle,
    window: WindowHandle,
    shown_buffer: BufferHandle,
    content: Vec<Bytes>,
    cursor: CursorPosition,
    writes: Vec<RecordedWrite>,
    cursor_moves: Vec<CursorPosition>,
    failures: VecDeque<MockCall>,
}

/// In-memory surface modelling one editor window showing one buffer.
///
/// The buffer starts as a single empty line with the cursor on it, the way a
/// fresh editor buffer does. Calls can be delayed and made to fail, and the
/// surface tracks how many calls overlap so tests can check write exclusivity.
pub struct MockSurface {
    state: Mutex<MockState>,
    write_latency: Duration,
    active_calls: AtomicUsize,
    max_active_calls: AtomicUsize,
    writes_seen: watch::Sender<usize>,
}

impl MockSurface {
    pub const BUFFER: BufferHandle = BufferHandle(1);
    pub const WINDOW: WindowHandle = WindowHandle(1000);

    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every `set_lines` call sleeps for `write_latency` before applying.
    pub fn with_latency(write_latency: Duration) -> Self {
        let (writes_seen, _) = watch::channel(0);
        Self {
            state: Mutex::new(MockState {
                buffer: Self::BUFFER,
                window: Self::WINDOW,
                shown_buffer: Self::BUFFER,
                content: vec![Bytes::new()],
                cursor: CursorPosition::new(1, 0),
                writes: Vec::new(),
                cursor_moves: Vec::new(),
                failures: VecDeque::new(),
            }),
            write_latency,
            active_calls: AtomicUsize::new(0),
            max_active_calls: AtomicUsize::new(0),
            writes_seen,
        }
    }

    pub fn target(&self) -> SurfaceTarget {
        let state = self.state.lock();
        SurfaceTarget {
            buffer: state.buffer,
            window: state.window,
        }
    }

    /// Queues a one-shot failure for the next invocation of `call`.
    pub fn fail_next(&self, call: MockCall) {
        self.state.lock().failures.push_back(call);
    }

    /// Points the window at another buffer, as if the user switched away.
    pub fn show_buffer(&self, buffer: BufferHandle) {
        self.state.lock().shown_buffer = buffer;
    }

    pub fn place_cursor(&self, position: CursorPosition) {
        self.state.lock().cursor = position;
    }

    pub fn cursor(&self) -> CursorPosition {
        self.state.lock().cursor
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    pub fn cursor_moves(&self) -> Vec<CursorPosition> {
        self.state.lock().cursor_moves.clone()
    }

    pub fn content(&self) -> Vec<String> {
        self.state
            .lock()
            .content
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Highest number of surface calls that were ever running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active_calls.load(Ordering::SeqCst)
    }

    /// Resolves once at least `count` writes have been applied.
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.writes_seen.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    fn enter(&self, call: MockCall) -> SurfaceResult<CallGuard<'_>> {
        let active = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_calls.fetch_max(active, Ordering::SeqCst);
        let guard = CallGuard { surface: self };

        let mut state = self.state.lock();
        if let Some(pos) = state.failures.iter().position(|queued| *queued == call) {
            state.failures.remove(pos);
            return Err(SurfaceError::Failed {
                call: call.name(),
                detail: "injected failure".into(),
            });
        }
        Ok(guard)
    }

    fn check_window(state: &MockState, window: WindowHandle, call: MockCall) -> SurfaceResult<()> {
        if window != state.window {
            return Err(SurfaceError::Failed {
                call: call.name(),
                detail: format!("Invalid window id: {}", window.0),
            });
        }
        Ok(())
    }
}

impl Default for MockSurface {
    fn default() -> Self {
        Self::new()
    }
}

struct CallGuard<'a> {
    surface: &'a MockSurface,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.surface.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSurface for MockSurface {
    async fn window_buffer(&self, window: WindowHandle) -> SurfaceResult<BufferHandle> {
        let _guard = self.enter(MockCall::WindowBuffer)?;
        let state = self.state.lock();
        Self::check_window(&state, window, MockCall::WindowBuffer)?;
        Ok(state.shown_buffer)
    }

    async fn window_cursor(&self, window: WindowHandle) -> SurfaceResult<CursorPosition> {
        let _guard = self.enter(MockCall::WindowCursor)?;
        let state = self.state.lock();
        Self::check_window(&state, window, MockCall::WindowCursor)?;
        Ok(state.cursor)
    }

    async fn set_lines(
        &self,
        buffer: BufferHandle,
        start: i64,
        end: i64,
        strict: bool,
        lines: &[Bytes],
    ) -> SurfaceResult<()> {
        let _guard = self.enter(MockCall::SetLines)?;
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }

        let applied = {
            let mut state = self.state.lock();
            if buffer != state.buffer {
                return Err(SurfaceError::Failed {
                    call: MockCall::SetLines.name(),
                    detail: format!("Invalid buffer id: {}", buffer.0),
                });
            }
            let len = state.content.len() as i64;
            let resolve = |index: i64| if index < 0 { len + 1 + index } else { index };
            let (from, to) = (resolve(start), resolve(end));
            if strict && (from > len || to > len || from > to) {
                return Err(SurfaceError::Failed {
                    call: MockCall::SetLines.name(),
                    detail: "Index out of bounds".into(),
                });
            }
            let (from, to) = (from.clamp(0, len) as usize, to.clamp(0, len) as usize);
            state.content.splice(from..to, lines.iter().cloned());
            if state.content.is_empty() {
                state.content.push(Bytes::new());
            }
            let last_row = state.content.len() as i64;
            if state.cursor.row > last_row {
                state.cursor.row = last_row;
            }
            state.writes.push(RecordedWrite {
                start,
                end,
                strict,
                lines: lines.to_vec(),
            });
            state.writes.len()
        };
        self.writes_seen.send_replace(applied);
        Ok(())
    }

    async fn set_cursor(&self, window: WindowHandle, position: CursorPosition) -> SurfaceResult<()> {
        let _guard = self.enter(MockCall::SetCursor)?;
        let mut state = self.state.lock();
        Self::check_window(&state, window, MockCall::SetCursor)?;
        if position.row < 1 || position.row > state.content.len() as i64 {
            return Err(SurfaceError::Failed {
                call: MockCall::SetCursor.name(),
                detail: "Cursor position outside buffer".into(),
            });
        }
        state.cursor = position;
        state.cursor_moves.push(position);
        Ok(())
    }
}
