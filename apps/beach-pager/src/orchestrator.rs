//! Wires stdin, the line splitter, the write pipeline, and the editor session.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::config::PagerConfig;
use crate::lines::{LineBatch, LineSplitter, SplitMode};
use crate::pipeline::{BatchSender, PipelineError, PipelineReport, WritePipeline};
use crate::session::Session;
use crate::surface::{RemoteSurface, SurfaceTarget};
use crate::telemetry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    pub chunks: u64,
    pub bytes: u64,
    pub lines: u64,
}

#[derive(Debug, Error)]
pub enum InputError {
    /// Reading stopped early; everything read before the error was submitted.
    #[error("failed to read input after {} bytes: {source}", .stats.bytes)]
    Read {
        #[source]
        source: io::Error,
        stats: InputStats,
    },
    #[error(transparent)]
    Submit(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub input: InputStats,
    pub report: PipelineReport,
}

/// Reads `reader` to the end in chunks of at most `chunk_bytes`, submitting
/// the lines of each chunk as one batch.
pub async fn pump_input<R>(
    mut reader: R,
    sender: &BatchSender,
    mode: SplitMode,
    chunk_bytes: usize,
) -> Result<InputStats, InputError>
where
    R: AsyncRead + Unpin,
{
    let chunk_bytes = chunk_bytes.max(1);
    let mut splitter = LineSplitter::new(mode);
    let mut stats = InputStats::default();
    let mut buf = BytesMut::with_capacity(chunk_bytes);

    let read_error = loop {
        buf.reserve(chunk_bytes);
        let read = {
            let mut window = (&mut buf).limit(chunk_bytes);
            reader.read_buf(&mut window).await
        };
        match read {
            Ok(0) => break None,
            Ok(n) => {
                let chunk = buf.split().freeze();
                stats.chunks += 1;
                stats.bytes += n as u64;
                let batch = splitter.push(&chunk);
                submit(sender, batch, &mut stats).await?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => break Some(err),
        }
    };

    if let Some(tail) = splitter.finish() {
        submit(sender, vec![tail], &mut stats).await?;
    }

    match read_error {
        Some(source) => Err(InputError::Read { source, stats }),
        None => {
            debug!(
                target = "pager::input",
                chunks = stats.chunks,
                bytes = stats.bytes,
                lines = stats.lines,
                "input exhausted"
            );
            Ok(stats)
        }
    }
}

async fn submit(
    sender: &BatchSender,
    batch: LineBatch,
    stats: &mut InputStats,
) -> Result<(), PipelineError> {
    if batch.is_empty() {
        return Ok(());
    }
    stats.lines += batch.len() as u64;
    sender.submit(batch).await
}

/// Streams `reader` into `target` and waits for the final write.
///
/// A read error still lets every batch submitted before it reach the
/// surface; the error is returned once the pipeline has drained.
pub async fn stream_into<S, R>(
    surface: Arc<S>,
    target: SurfaceTarget,
    reader: R,
    config: &PagerConfig,
) -> Result<RunSummary>
where
    S: RemoteSurface + 'static,
    R: AsyncRead + Unpin,
{
    let mut pipeline = WritePipeline::spawn(surface, target, config.pipeline.clone());
    let sender = pipeline
        .sender()
        .context("write pipeline closed before input started")?;
    pipeline.close();

    let input = pump_input(reader, &sender, config.split_mode, config.read_chunk_bytes).await;
    drop(sender);

    let report = pipeline
        .wait()
        .await
        .context("write pipeline did not drain")?;
    let input = input.context("streaming input")?;
    Ok(RunSummary { input, report })
}

/// Runs the pager against stdin until input ends and the output is flushed.
pub async fn run(config: PagerConfig) -> Result<RunSummary> {
    let session = Session::open(&config)
        .await
        .context("failed to open editor session")?;
    debug!(
        target = "pager::run",
        address = session.address(),
        spawned = session.spawned(),
        "streaming stdin into editor"
    );

    let streamed = stream_into(
        session.surface(),
        session.target(),
        tokio::io::stdin(),
        &config,
    )
    .await;
    telemetry::flush();

    match &streamed {
        Ok(summary) => info!(
            target = "pager::run",
            bytes = summary.input.bytes,
            lines = summary.report.lines_written,
            writes = summary.report.writes_issued,
            failed = summary.report.writes_failed,
            "input complete"
        ),
        Err(err) => warn!(target = "pager::run", error = %format!("{err:#}"), "input ended early"),
    }

    session
        .finish()
        .await
        .context("failed to close editor session")?;
    streamed
}
