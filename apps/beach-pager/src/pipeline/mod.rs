//! Coalescing write pipeline.
//!
//! Producers submit line batches; one coordinator task keeps at most one
//! write in flight against the [`RemoteSurface`] and folds every batch that
//! arrives meanwhile into the next write. Closing the input triggers exactly
//! one final write, after which [`WritePipeline::wait`] returns.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::lines::LineBatch;
use crate::surface::{RemoteSurface, SurfaceTarget};
use crate::telemetry;

pub mod state;
pub mod write;

use state::{Coalescer, Command, Event, WriteJob};
use write::{WriteOutcome, perform_write};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Inbound batches buffered before `submit` starts waiting.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline input already closed")]
    Closed,
    #[error("pipeline coordinator failed: {0}")]
    Coordinator(String),
}

/// Totals for one pipeline run, returned by [`WritePipeline::wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub batches_submitted: u64,
    pub batches_coalesced: u64,
    pub writes_issued: u64,
    pub writes_failed: u64,
    pub lines_written: i64,
}

/// Cloneable submit side of a pipeline.
#[derive(Clone)]
pub struct BatchSender {
    inbound: mpsc::Sender<LineBatch>,
}

impl BatchSender {
    pub async fn submit(&self, batch: LineBatch) -> Result<(), PipelineError> {
        self.inbound
            .send(batch)
            .await
            .map_err(|_| PipelineError::Closed)
    }
}

pub struct WritePipeline {
    sender: Option<BatchSender>,
    coordinator: JoinHandle<PipelineReport>,
}

impl WritePipeline {
    pub fn spawn<S>(surface: Arc<S>, target: SurfaceTarget, config: PipelineConfig) -> Self
    where
        S: RemoteSurface + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let coordinator = tokio::spawn(coordinate(surface, target, inbound_rx));
        Self {
            sender: Some(BatchSender { inbound: inbound_tx }),
            coordinator,
        }
    }

    /// Queues a batch for writing. Waits only while the inbound queue is full.
    pub async fn submit(&self, batch: LineBatch) -> Result<(), PipelineError> {
        match &self.sender {
            Some(sender) => sender.submit(batch).await,
            None => Err(PipelineError::Closed),
        }
    }

    /// Submit handle for producers on other tasks. Clones keep the input open
    /// until they are dropped.
    pub fn sender(&self) -> Option<BatchSender> {
        self.sender.clone()
    }

    /// Signals that no more batches will be submitted through this handle.
    pub fn close(&mut self) {
        if self.sender.take().is_some() {
            trace!(target = "pager::pipeline", "input closed");
        }
    }

    /// Closes the input and waits until the final write has completed.
    pub async fn wait(mut self) -> Result<PipelineReport, PipelineError> {
        self.close();
        self.coordinator
            .await
            .map_err(|err| PipelineError::Coordinator(err.to_string()))
    }
}

async fn coordinate<S>(
    surface: Arc<S>,
    target: SurfaceTarget,
    mut inbound: mpsc::Receiver<LineBatch>,
) -> PipelineReport
where
    S: RemoteSurface + 'static,
{
    let mut coalescer = Coalescer::new();
    let mut in_flight: Option<(u64, JoinHandle<WriteOutcome>)> = None;
    let mut input_open = true;

    loop {
        let event = tokio::select! {
            received = inbound.recv(), if input_open => match received {
                Some(first) => {
                    let mut batches = vec![first];
                    while let Ok(extra) = inbound.try_recv() {
                        batches.push(extra);
                    }
                    telemetry::record_gauge("pager_batches_per_wakeup", batches.len() as u64);
                    Event::Submitted(batches)
                }
                None => {
                    input_open = false;
                    Event::InputClosed
                }
            },
            outcome = join_write(&mut in_flight), if in_flight.is_some() => {
                Event::WriteFinished(outcome)
            },
            else => break,
        };

        if matches!(event, Event::WriteFinished(_)) {
            in_flight = None;
        }

        match coalescer.handle(event) {
            Some(Command::StartWrite(job)) => {
                trace!(
                    target = "pager::pipeline",
                    seq = job.seq,
                    mode = ?job.mode,
                    lines = job.lines.len(),
                    batches = job.batches,
                    is_final = job.is_final,
                    "starting write"
                );
                in_flight = Some((job.seq, spawn_write(Arc::clone(&surface), target, job)));
            }
            Some(Command::Complete) => break,
            None => {}
        }
    }

    let stats = coalescer.stats();
    let report = PipelineReport {
        batches_submitted: stats.batches_submitted,
        batches_coalesced: stats.batches_coalesced,
        writes_issued: stats.writes_issued,
        writes_failed: stats.writes_failed,
        lines_written: coalescer.write_state().lines_written,
    };
    info!(
        target = "pager::pipeline",
        batches = report.batches_submitted,
        coalesced = report.batches_coalesced,
        writes = report.writes_issued,
        failed = report.writes_failed,
        lines = report.lines_written,
        "pipeline drained"
    );
    report
}

fn spawn_write<S>(surface: Arc<S>, target: SurfaceTarget, job: WriteJob) -> JoinHandle<WriteOutcome>
where
    S: RemoteSurface + 'static,
{
    tokio::spawn(async move { perform_write(surface.as_ref(), target, &job).await })
}

/// Resolves with the in-flight write's outcome. A write task that panicked
/// still yields an outcome so the coordinator never waits forever.
async fn join_write(slot: &mut Option<(u64, JoinHandle<WriteOutcome>)>) -> WriteOutcome {
    let Some((seq, handle)) = slot.as_mut() else {
        return std::future::pending().await;
    };
    match handle.await {
        Ok(outcome) => outcome,
        Err(err) => {
            debug!(target = "pager::pipeline", seq = *seq, error = %err, "write task died");
            WriteOutcome::aborted(*seq, err.to_string())
        }
    }
}
