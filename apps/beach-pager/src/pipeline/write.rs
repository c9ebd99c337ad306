use std::fmt;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::surface::{CursorPosition, RemoteSurface, SurfaceError, SurfaceTarget};
use crate::telemetry::{self, PerfGuard};

use super::state::WriteJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    QueryBuffer,
    QueryCursor,
    SetLines,
    MoveCursor,
}

impl fmt::Display for WriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WriteStep::QueryBuffer => "query window buffer",
            WriteStep::QueryCursor => "query cursor",
            WriteStep::SetLines => "set lines",
            WriteStep::MoveCursor => "move cursor",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{step} failed: {source}")]
    Surface {
        step: WriteStep,
        #[source]
        source: SurfaceError,
    },
    #[error("write task aborted: {0}")]
    Aborted(String),
}

impl WriteError {
    fn at(step: WriteStep) -> impl FnOnce(SurfaceError) -> WriteError {
        move |source| WriteError::Surface { step, source }
    }
}

/// What one write did, reported back to the coordinator exactly once.
#[derive(Debug)]
pub struct WriteOutcome {
    pub seq: u64,
    /// The line replacement reached the surface.
    pub landed: bool,
    /// Lines now on the surface because of this write.
    pub lines_applied: usize,
    /// The cursor was advanced to keep following the tail.
    pub followed: bool,
    pub error: Option<WriteError>,
}

impl WriteOutcome {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            landed: false,
            lines_applied: 0,
            followed: false,
            error: None,
        }
    }

    /// Outcome for a write whose task died before it could report.
    pub fn aborted(seq: u64, reason: impl Into<String>) -> Self {
        Self {
            error: Some(WriteError::Aborted(reason.into())),
            ..Self::new(seq)
        }
    }
}

/// Runs one write against the surface.
///
/// Never fails: surface errors abort the remaining steps and are carried in
/// the returned outcome, so the caller always gets its completion signal.
pub async fn perform_write<S>(surface: &S, target: SurfaceTarget, job: &WriteJob) -> WriteOutcome
where
    S: RemoteSurface + ?Sized,
{
    let _perf = PerfGuard::new("pager_write");
    let mut outcome = WriteOutcome::new(job.seq);
    if let Err(err) = write_steps(surface, target, job, &mut outcome).await {
        warn!(
            target = "pager::write",
            seq = job.seq,
            mode = ?job.mode,
            lines = job.lines.len(),
            error = %err,
            "write abandoned"
        );
        outcome.error = Some(err);
    } else {
        debug!(
            target = "pager::write",
            seq = job.seq,
            mode = ?job.mode,
            lines = job.lines.len(),
            batches = job.batches,
            followed = outcome.followed,
            "write applied"
        );
    }
    telemetry::record_gauge("pager_write_lines", job.lines.len() as u64);
    outcome
}

async fn write_steps<S>(
    surface: &S,
    target: SurfaceTarget,
    job: &WriteJob,
    outcome: &mut WriteOutcome,
) -> Result<(), WriteError>
where
    S: RemoteSurface + ?Sized,
{
    let shown = surface
        .window_buffer(target.window)
        .await
        .map_err(WriteError::at(WriteStep::QueryBuffer))?;

    // Follow only when the window shows our buffer with the cursor on the last written line.
    let follow_from = if shown == target.buffer {
        let cursor = surface
            .window_cursor(target.window)
            .await
            .map_err(WriteError::at(WriteStep::QueryCursor))?;
        trace!(
            target = "pager::write",
            seq = job.seq,
            row = cursor.row,
            col = cursor.col,
            lines_before = job.lines_before,
            "cursor sampled"
        );
        (cursor.row == job.lines_before).then_some(cursor)
    } else {
        None
    };

    let (start, end) = job.mode.range();
    surface
        .set_lines(target.buffer, start, end, true, &job.lines)
        .await
        .map_err(WriteError::at(WriteStep::SetLines))?;
    outcome.landed = true;
    outcome.lines_applied = job.lines.len();

    if let Some(cursor) = follow_from {
        if !job.lines.is_empty() {
            let next = CursorPosition::new(cursor.row + job.lines.len() as i64, cursor.col);
            surface
                .set_cursor(target.window, next)
                .await
                .map_err(WriteError::at(WriteStep::MoveCursor))?;
            outcome.followed = true;
        }
    }
    Ok(())
}
