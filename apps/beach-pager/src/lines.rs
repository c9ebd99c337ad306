//! Turning raw input chunks into line batches.

use bytes::{Bytes, BytesMut};

/// Ordered lines cut from one input chunk, without their `\n` terminators.
pub type LineBatch = Vec<Bytes>;

/// How chunk boundaries that fall inside a line are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SplitMode {
    /// Hold an unterminated trailing fragment until the next chunk completes it.
    #[default]
    Carry,
    /// Split every chunk independently; a line straddling two reads becomes two lines.
    Raw,
}

/// Lazily splits `chunk` on `\n` without copying.
///
/// Empty fragments are preserved, so `"a\n\nb"` yields `a`, ``, `b` and a chunk
/// ending in `\n` yields a trailing empty fragment.
pub fn split_lines(chunk: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    let mut start = 0usize;
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        match chunk[start..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let line = chunk.slice(start..start + offset);
                start += offset + 1;
                Some(line)
            }
            None => {
                done = true;
                Some(chunk.slice(start..))
            }
        }
    })
}

/// Reassembles lines that straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: BytesMut,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every line completed by `chunk`; the unterminated tail is kept
    /// for the next call.
    pub fn push(&mut self, chunk: &Bytes) -> LineBatch {
        let mut fragments = split_lines(chunk);
        let mut batch = LineBatch::new();

        // split_lines always yields at least one fragment.
        let Some(mut pending) = fragments.next() else {
            return batch;
        };
        for next in fragments {
            let complete = if self.partial.is_empty() {
                pending
            } else {
                self.partial.extend_from_slice(&pending);
                self.partial.split().freeze()
            };
            batch.push(complete);
            pending = next;
        }
        self.partial.extend_from_slice(&pending);
        batch
    }

    /// Releases the buffered tail at end of input, if there is one.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.partial.split().freeze())
        }
    }

    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }
}

/// Applies a [`SplitMode`] across a sequence of chunks.
#[derive(Debug)]
pub enum LineSplitter {
    Carry(LineAssembler),
    Raw,
}

impl LineSplitter {
    pub fn new(mode: SplitMode) -> Self {
        match mode {
            SplitMode::Carry => LineSplitter::Carry(LineAssembler::new()),
            SplitMode::Raw => LineSplitter::Raw,
        }
    }

    pub fn push(&mut self, chunk: &Bytes) -> LineBatch {
        match self {
            LineSplitter::Carry(assembler) => assembler.push(chunk),
            LineSplitter::Raw => split_lines(chunk).collect(),
        }
    }

    pub fn finish(&mut self) -> Option<Bytes> {
        match self {
            LineSplitter::Carry(assembler) => assembler.finish(),
            LineSplitter::Raw => None,
        }
    }
}
