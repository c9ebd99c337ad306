use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use beach_pager::lines::LineBatch;
use beach_pager::pipeline::{PipelineConfig, PipelineError, WritePipeline};
use beach_pager::surface::mock::{MockCall, MockSurface};
use beach_pager::surface::{
    BufferHandle, CursorPosition, RemoteSurface, SurfaceResult, WindowHandle,
};
use bytes::Bytes;

fn batch(lines: &[&str]) -> LineBatch {
    lines
        .iter()
        .map(|line| Bytes::copy_from_slice(line.as_bytes()))
        .collect()
}

fn spawn(surface: &Arc<MockSurface>) -> WritePipeline {
    WritePipeline::spawn(Arc::clone(surface), surface.target(), PipelineConfig::default())
}

/// Delegates to a [`MockSurface`] but panics inside `set_lines` once armed.
struct PanickingSurface {
    inner: MockSurface,
    panic_next_write: AtomicBool,
}

impl PanickingSurface {
    fn new() -> Self {
        Self {
            inner: MockSurface::new(),
            panic_next_write: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.panic_next_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSurface for PanickingSurface {
    async fn window_buffer(&self, window: WindowHandle) -> SurfaceResult<BufferHandle> {
        self.inner.window_buffer(window).await
    }

    async fn window_cursor(&self, window: WindowHandle) -> SurfaceResult<CursorPosition> {
        self.inner.window_cursor(window).await
    }

    async fn set_lines(
        &self,
        buffer: BufferHandle,
        start: i64,
        end: i64,
        strict: bool,
        lines: &[Bytes],
    ) -> SurfaceResult<()> {
        if self.panic_next_write.swap(false, Ordering::SeqCst) {
            panic!("set_lines blew up");
        }
        self.inner.set_lines(buffer, start, end, strict, lines).await
    }

    async fn set_cursor(&self, window: WindowHandle, position: CursorPosition) -> SurfaceResult<()> {
        self.inner.set_cursor(window, position).await
    }
}

fn spawn_panicking(surface: &Arc<PanickingSurface>) -> WritePipeline {
    WritePipeline::spawn(
        Arc::clone(surface),
        surface.inner.target(),
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn batches_queued_together_become_one_replace_write() {
    let surface = Arc::new(MockSurface::new());
    let pipeline = spawn(&surface);

    pipeline.submit(batch(&["a", "b"])).await.unwrap();
    pipeline.submit(batch(&["c"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    let writes = surface.writes();
    assert!(writes[0].is_replace());
    assert_eq!(writes[0].text(), vec!["a", "b", "c"]);
    assert_eq!(surface.content(), vec!["a", "b", "c"]);
    assert_eq!(report.batches_submitted, 2);
    assert_eq!(report.lines_written, 3);
}

#[tokio::test]
async fn close_after_last_write_issues_empty_append() {
    let surface = Arc::new(MockSurface::new());
    let pipeline = spawn(&surface);

    pipeline.submit(batch(&["x"])).await.unwrap();
    surface.wait_for_writes(1).await;
    let report = pipeline.wait().await.unwrap();

    let writes = surface.writes();
    assert_eq!(writes.len(), 2);
    assert!(writes[0].is_replace());
    assert!(writes[1].is_append());
    assert!(writes[1].lines.is_empty());
    assert_eq!(report.writes_issued, 2);
    assert_eq!(surface.content(), vec!["x"]);
}

#[tokio::test]
async fn close_without_input_still_signals_completion() {
    let surface = Arc::new(MockSurface::new());
    let report = spawn(&surface).wait().await.unwrap();

    let writes = surface.writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].is_replace());
    assert!(writes[0].lines.is_empty());
    assert_eq!(report.writes_issued, 1);
    assert_eq!(report.lines_written, 0);
}

#[tokio::test]
async fn submit_after_close_is_rejected() {
    let surface = Arc::new(MockSurface::new());
    let mut pipeline = spawn(&surface);
    pipeline.close();

    let err = pipeline.submit(batch(&["late"])).await.unwrap_err();
    assert!(matches!(err, PipelineError::Closed));
    pipeline.wait().await.unwrap();
}

#[test_timeout::tokio_timeout_test(secs = 10, start_paused)]
async fn batches_arriving_during_a_write_are_merged() {
    let surface = Arc::new(MockSurface::with_latency(Duration::from_millis(100)));
    let pipeline = spawn(&surface);

    pipeline.submit(batch(&["1"])).await.unwrap();
    // Let the first write reach the surface and start its slow call.
    tokio::time::sleep(Duration::from_millis(10)).await;

    pipeline.submit(batch(&["2"])).await.unwrap();
    pipeline.submit(batch(&["3"])).await.unwrap();
    pipeline.submit(batch(&["4"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    let writes = surface.writes();
    assert_eq!(writes.len(), 2, "three queued batches must share one write");
    assert_eq!(writes[0].text(), vec!["1"]);
    assert!(writes[1].is_append());
    assert_eq!(writes[1].text(), vec!["2", "3", "4"]);
    assert_eq!(report.batches_coalesced, 2);
    assert_eq!(surface.max_concurrency(), 1);
}

#[test_timeout::tokio_timeout_test(secs = 20, start_paused)]
async fn order_is_preserved_under_backpressure() {
    let surface = Arc::new(MockSurface::with_latency(Duration::from_millis(5)));
    let pipeline = WritePipeline::spawn(
        Arc::clone(&surface),
        surface.target(),
        PipelineConfig { queue_capacity: 4 },
    );
    let sender = pipeline.sender().unwrap();

    let producer = tokio::spawn(async move {
        for i in 0..200 {
            let lines: Vec<String> = (0..3).map(|j| format!("{i}:{j}")).collect();
            let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
            sender.submit(batch(&refs)).await.unwrap();
            if i % 7 == 0 {
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        }
    });
    producer.await.unwrap();
    let report = pipeline.wait().await.unwrap();

    let expected: Vec<String> = (0..200)
        .flat_map(|i| (0..3).map(move |j| format!("{i}:{j}")))
        .collect();
    assert_eq!(surface.content(), expected);

    let writes = surface.writes();
    assert!(writes[0].is_replace());
    assert!(writes[1..].iter().all(|write| write.is_append()));
    let written: Vec<String> = writes.iter().flat_map(|write| write.text()).collect();
    assert_eq!(written, expected);

    assert_eq!(surface.max_concurrency(), 1);
    assert_eq!(report.batches_submitted, 200);
    assert_eq!(report.lines_written, 600);
    assert_eq!(report.writes_failed, 0);
    assert!(report.writes_issued < 200, "slow writes should coalesce");
}

#[tokio::test]
async fn cursor_on_tail_follows_new_lines() {
    let surface = Arc::new(MockSurface::new());
    let pipeline = spawn(&surface);

    pipeline.submit(batch(&["a", "b", "c"])).await.unwrap();
    surface.wait_for_writes(1).await;

    surface.place_cursor(CursorPosition::new(3, 2));
    pipeline.submit(batch(&["d", "e"])).await.unwrap();
    while surface.cursor() != CursorPosition::new(5, 2) {
        tokio::task::yield_now().await;
    }

    // Scrolled away from the tail: later writes leave the cursor alone.
    surface.place_cursor(CursorPosition::new(2, 0));
    pipeline.submit(batch(&["f"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    assert_eq!(surface.cursor(), CursorPosition::new(2, 0));
    assert_eq!(surface.cursor_moves(), vec![CursorPosition::new(5, 2)]);
    assert_eq!(surface.content(), vec!["a", "b", "c", "d", "e", "f"]);
    assert_eq!(report.lines_written, 6);
}

#[test_timeout::tokio_timeout_test(secs = 10, start_paused)]
async fn failed_first_write_keeps_replace_mode() {
    let surface = Arc::new(MockSurface::new());
    let pipeline = spawn(&surface);

    surface.fail_next(MockCall::SetLines);
    pipeline.submit(batch(&["lost"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    pipeline.submit(batch(&["kept"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    let writes = surface.writes();
    assert!(writes[0].is_replace());
    assert_eq!(writes[0].text(), vec!["kept"]);
    assert_eq!(surface.content(), vec!["kept"]);
    assert_eq!(report.writes_issued, 3);
    assert_eq!(report.writes_failed, 1);
    assert_eq!(report.lines_written, 1);
}

#[test_timeout::tokio_timeout_test(secs = 10, start_paused)]
async fn pipeline_continues_after_a_failed_write() {
    let surface = Arc::new(MockSurface::new());
    let pipeline = spawn(&surface);

    pipeline.submit(batch(&["a"])).await.unwrap();
    surface.wait_for_writes(1).await;

    surface.fail_next(MockCall::WindowBuffer);
    pipeline.submit(batch(&["b"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    pipeline.submit(batch(&["c"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    assert_eq!(surface.content(), vec!["a", "c"]);
    assert_eq!(report.writes_failed, 1);
    assert_eq!(report.lines_written, 2);
    assert_eq!(report.batches_submitted, 3);
}

#[test_timeout::tokio_timeout_test(secs = 10, start_paused)]
async fn wait_flushes_batches_from_cloned_senders() {
    let surface = Arc::new(MockSurface::with_latency(Duration::from_millis(20)));
    let pipeline = spawn(&surface);
    let sender = pipeline.sender().unwrap();

    pipeline.submit(batch(&["early"])).await.unwrap();
    let late = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.submit(batch(&["late"])).await.unwrap();
    });

    let report = pipeline.wait().await.unwrap();
    late.await.unwrap();

    assert_eq!(surface.content(), vec!["early", "late"]);
    assert_eq!(report.lines_written, 2);
}

#[test_timeout::tokio_timeout_test(secs = 10, start_paused)]
async fn panicking_first_write_counts_as_failed() {
    let surface = Arc::new(PanickingSurface::new());
    let pipeline = spawn_panicking(&surface);

    surface.arm();
    pipeline.submit(batch(&["lost"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    pipeline.submit(batch(&["kept"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    let writes = surface.inner.writes();
    assert!(writes[0].is_replace(), "nothing landed yet, so replace again");
    assert_eq!(writes[0].text(), vec!["kept"]);
    assert!(writes[1..].iter().all(|write| write.is_append()));
    assert_eq!(surface.inner.content(), vec!["kept"]);
    assert_eq!(report.writes_issued, 3);
    assert_eq!(report.writes_failed, 1);
    assert_eq!(report.lines_written, 1);
}

#[test_timeout::tokio_timeout_test(secs = 10, start_paused)]
async fn panicking_later_write_does_not_stall_pipeline() {
    let surface = Arc::new(PanickingSurface::new());
    let pipeline = spawn_panicking(&surface);

    pipeline.submit(batch(&["a"])).await.unwrap();
    surface.inner.wait_for_writes(1).await;

    surface.arm();
    pipeline.submit(batch(&["b"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    pipeline.submit(batch(&["c"])).await.unwrap();
    let report = pipeline.wait().await.unwrap();

    let writes = surface.inner.writes();
    assert!(writes[0].is_replace());
    assert!(writes[1..].iter().all(|write| write.is_append()));
    assert_eq!(surface.inner.content(), vec!["a", "c"]);
    assert_eq!(report.writes_failed, 1);
    assert_eq!(report.lines_written, 2);
}
