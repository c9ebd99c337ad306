//! Pure transition core of the coalescing pipeline.
//!
//! [`Coalescer`] holds everything the coordinator owns (pending batches, the
//! first-write flag, the written-line count) and turns events into at most
//! one command. It does no I/O, which keeps every transition unit-testable.

use bytes::Bytes;

use crate::lines::LineBatch;

use super::write::WriteOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole surface; used until one write has landed.
    Replace,
    /// Append after the last line.
    Append,
}

impl WriteMode {
    /// `(start, end)` line range handed to the surface.
    pub const fn range(self) -> (i64, i64) {
        match self {
            WriteMode::Replace => (0, -1),
            WriteMode::Append => (-1, -1),
        }
    }
}

/// One write, fully described at the moment it is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteJob {
    pub seq: u64,
    pub mode: WriteMode,
    pub lines: Vec<Bytes>,
    /// Number of submitted batches merged into this write.
    pub batches: usize,
    /// Lines known to be on the surface before this write; drives follow mode.
    pub lines_before: i64,
    /// Set on the write issued after input closed.
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteState {
    pub first_write: bool,
    pub lines_written: i64,
}

impl Default for WriteState {
    fn default() -> Self {
        Self {
            first_write: true,
            lines_written: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Writing,
    /// Input closed. `final_issued` flips once the last write is in flight.
    Draining { final_issued: bool },
    Done,
}

#[derive(Debug)]
pub enum Event {
    /// Batches taken from the inbound queue in one go, in submission order.
    Submitted(Vec<LineBatch>),
    WriteFinished(WriteOutcome),
    InputClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    StartWrite(WriteJob),
    Complete,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerStats {
    pub batches_submitted: u64,
    /// Batches that rode along in a write another batch started.
    pub batches_coalesced: u64,
    pub writes_issued: u64,
    pub writes_failed: u64,
}

#[derive(Debug)]
pub struct Coalescer {
    phase: Phase,
    pending: Vec<LineBatch>,
    state: WriteState,
    next_seq: u64,
    stats: CoalescerStats,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            pending: Vec::new(),
            state: WriteState::default(),
            next_seq: 0,
            stats: CoalescerStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn write_state(&self) -> WriteState {
        self.state
    }

    pub fn stats(&self) -> CoalescerStats {
        self.stats
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    pub fn write_in_flight(&self) -> bool {
        matches!(self.phase, Phase::Writing | Phase::Draining { .. })
    }

    pub fn handle(&mut self, event: Event) -> Option<Command> {
        match event {
            Event::Submitted(batches) => self.on_submitted(batches),
            Event::WriteFinished(outcome) => self.on_write_finished(outcome),
            Event::InputClosed => self.on_input_closed(),
        }
    }

    fn on_submitted(&mut self, batches: Vec<LineBatch>) -> Option<Command> {
        if batches.is_empty() {
            return None;
        }
        self.stats.batches_submitted += batches.len() as u64;
        match self.phase {
            Phase::Idle => {
                self.pending.extend(batches);
                self.phase = Phase::Writing;
                Some(Command::StartWrite(self.take_job(false)))
            }
            Phase::Writing | Phase::Draining { final_issued: false } => {
                self.pending.extend(batches);
                None
            }
            Phase::Draining { final_issued: true } | Phase::Done => {
                // The sender is gone before the final write is issued, so this
                // cannot happen; keep the lines rather than drop them silently.
                tracing::error!(
                    target = "pager::pipeline",
                    phase = ?self.phase,
                    batches = batches.len(),
                    "batches arrived after the final write was issued"
                );
                self.pending.extend(batches);
                None
            }
        }
    }

    fn on_write_finished(&mut self, outcome: WriteOutcome) -> Option<Command> {
        if outcome.landed {
            self.state.first_write = false;
        }
        self.state.lines_written += outcome.lines_applied as i64;
        if outcome.error.is_some() {
            self.stats.writes_failed += 1;
        }

        match self.phase {
            Phase::Writing => {
                if self.pending.is_empty() {
                    self.phase = Phase::Idle;
                    None
                } else {
                    Some(Command::StartWrite(self.take_job(false)))
                }
            }
            Phase::Draining { final_issued: false } => {
                self.phase = Phase::Draining { final_issued: true };
                Some(Command::StartWrite(self.take_job(true)))
            }
            Phase::Draining { final_issued: true } => {
                self.phase = Phase::Done;
                Some(Command::Complete)
            }
            Phase::Idle | Phase::Done => {
                tracing::error!(
                    target = "pager::pipeline",
                    phase = ?self.phase,
                    "write completion with no write in flight"
                );
                None
            }
        }
    }

    fn on_input_closed(&mut self) -> Option<Command> {
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Draining { final_issued: true };
                Some(Command::StartWrite(self.take_job(true)))
            }
            Phase::Writing => {
                self.phase = Phase::Draining { final_issued: false };
                None
            }
            Phase::Draining { .. } | Phase::Done => None,
        }
    }

    fn take_job(&mut self, is_final: bool) -> WriteJob {
        let batches = std::mem::take(&mut self.pending);
        let batch_count = batches.len();
        let lines = batches.into_iter().flatten().collect();
        let mode = if self.state.first_write {
            WriteMode::Replace
        } else {
            WriteMode::Append
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stats.writes_issued += 1;
        self.stats.batches_coalesced += batch_count.saturating_sub(1) as u64;
        WriteJob {
            seq,
            mode,
            lines,
            batches: batch_count,
            lines_before: self.state.lines_written,
            is_final,
        }
    }
}
