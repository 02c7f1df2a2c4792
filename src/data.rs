//! The span recorder: a single test execution over a byte buffer.
//!
//! A [`ConjectureData`] hands bytes to the test function through `draw_bits`
//! and friends, recording every draw, block boundary, and span so the engine
//! and shrinker can reason about the structure of the run afterwards. Once a
//! terminal status is set the recorder is frozen and all further draws fail
//! with [`StopTest`].

use std::collections::HashMap;
use std::fmt;

use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Final status of a test execution. The ordering is meaningful: a higher
/// status dominates when merging observations about the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// The test needed more bytes than the buffer could provide.
    Overrun = 0,
    /// The test rejected this input as unsatisfiable.
    Invalid = 1,
    /// The test ran to completion without failing.
    Valid = 2,
    /// The test failed with some interesting origin.
    Interesting = 3,
}

impl Default for Status {
    fn default() -> Self {
        Status::Valid
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Overrun => "OVERRUN",
            Status::Invalid => "INVALID",
            Status::Valid => "VALID",
            Status::Interesting => "INTERESTING",
        };
        f.write_str(s)
    }
}

/// Signal that the current test execution has ended and control should
/// unwind back to the runner. Carried through `Result` so test functions can
/// propagate it with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTest;

/// A contiguous byte range produced by a single bit draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
}

impl Block {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One recorded call to `draw_bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRecord {
    pub n_bits: u64,
    pub value: u64,
    pub forced: bool,
}

/// A labelled region of the buffer, possibly nested inside another span.
/// Span 0 always covers the whole buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub label: u64,
    pub parent: Option<usize>,
    pub start: usize,
    pub end: usize,
    pub discarded: bool,
}

/// Observer hook for recording the shape of an execution as it happens.
/// The prefix tree implements this to learn draw boundaries and outcomes.
pub trait DataObserver {
    fn draw_value(&mut self, n_bits: u64, value: u64, forced: bool) {
        let _ = (n_bits, value, forced);
    }

    /// The subtree below the current position will never be interesting.
    fn kill_branch(&mut self) {}

    fn conclude(&mut self, status: Status) {
        let _ = status;
    }
}

/// Where draw bytes come from.
enum DrawSource {
    /// Replay an existing buffer exactly; running past its end is an overrun.
    Replay(Vec<u8>),
    /// Serve bytes from a fixed prefix, then fresh random bytes.
    Prefix { prefix: Vec<u8>, rng: ChaCha8Rng },
}

/// Records a single test execution.
pub struct ConjectureData {
    source: DrawSource,
    /// Bytes consumed so far, masked to the widths actually drawn.
    buffer: Vec<u8>,
    pub max_length: usize,
    pub status: Status,
    pub origin: Option<u64>,
    pub frozen: bool,
    blocks: Vec<Block>,
    draws: Vec<DrawRecord>,
    spans: Vec<Span>,
    span_stack: Vec<usize>,
    events: Vec<String>,
    observer: Option<Box<dyn DataObserver>>,
}

impl ConjectureData {
    /// A recorder that replays `buffer` exactly.
    pub fn for_buffer(buffer: &[u8]) -> Self {
        let max_length = buffer.len();
        Self::new(DrawSource::Replay(buffer.to_vec()), max_length)
    }

    /// A recorder that serves `prefix` first and random bytes afterwards.
    pub fn for_prefix(prefix: Vec<u8>, seed: u64, max_length: usize) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(seed);
        Self::new(DrawSource::Prefix { prefix, rng }, max_length)
    }

    /// A fully random recorder.
    pub fn for_random(seed: u64, max_length: usize) -> Self {
        Self::for_prefix(Vec::new(), seed, max_length)
    }

    fn new(source: DrawSource, max_length: usize) -> Self {
        let top = Span {
            label: 0,
            parent: None,
            start: 0,
            end: 0,
            discarded: false,
        };
        ConjectureData {
            source,
            buffer: Vec::new(),
            max_length,
            status: Status::default(),
            origin: None,
            frozen: false,
            blocks: Vec::new(),
            draws: Vec::new(),
            spans: vec![top],
            span_stack: vec![0],
            events: Vec::new(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn DataObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn index(&self) -> usize {
        self.buffer.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Draw `n_bits` bits (at most 64) as a big-endian integer, consuming
    /// `ceil(n_bits / 8)` bytes. A `forced` value is written into the buffer
    /// verbatim instead of being read from the draw source.
    pub fn draw_bits(&mut self, n_bits: u64, forced: Option<u64>) -> Result<u64, StopTest> {
        if self.frozen {
            return Err(StopTest);
        }
        assert!(n_bits <= 64, "cannot draw more than 64 bits at once");
        if n_bits == 0 {
            return Ok(0);
        }
        let n_bytes = ((n_bits + 7) / 8) as usize;
        let start = self.buffer.len();
        if start + n_bytes > self.max_length {
            self.conclude(Status::Overrun, None)?;
        }

        let mask: u64 = if n_bits == 64 {
            u64::MAX
        } else {
            (1u64 << n_bits) - 1
        };
        let mut bytes = match forced {
            Some(v) => {
                debug_assert_eq!(v & mask, v, "forced value wider than draw");
                int_to_bytes(v, n_bytes)
            }
            None => self.source_bytes(start, n_bytes)?,
        };
        // Mask the high byte so the buffer is canonical for this draw width.
        if n_bits % 8 != 0 {
            bytes[0] &= ((1u16 << (n_bits % 8)) - 1) as u8;
        }
        let value = bytes_to_int(&bytes) & mask;

        self.buffer.extend_from_slice(&bytes);
        let end = self.buffer.len();
        self.blocks.push(Block { start, end });
        self.draws.push(DrawRecord {
            n_bits,
            value,
            forced: forced.is_some(),
        });
        if let Some(observer) = self.observer.as_mut() {
            observer.draw_value(n_bits, value, forced.is_some());
        }
        Ok(value)
    }

    fn source_bytes(&mut self, start: usize, n_bytes: usize) -> Result<Vec<u8>, StopTest> {
        if let DrawSource::Replay(buf) = &self.source {
            if start + n_bytes > buf.len() {
                self.conclude(Status::Overrun, None)?;
            }
        }
        match &mut self.source {
            DrawSource::Replay(buf) => Ok(buf[start..start + n_bytes].to_vec()),
            DrawSource::Prefix { prefix, rng } => {
                let mut out = Vec::with_capacity(n_bytes);
                for i in 0..n_bytes {
                    let pos = start + i;
                    if pos < prefix.len() {
                        out.push(prefix[pos]);
                    } else {
                        out.push((rng.next_u32() & 0xff) as u8);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Draw `n` whole bytes.
    pub fn draw_bytes(&mut self, n: usize) -> Result<Vec<u8>, StopTest> {
        let start = self.buffer.len();
        for _ in 0..n {
            self.draw_bits(8, None)?;
        }
        Ok(self.buffer[start..].to_vec())
    }

    /// Write `bytes` into the buffer as forced draws. The bytes appear in the
    /// result verbatim and count against `max_length`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StopTest> {
        for &b in bytes {
            self.draw_bits(8, Some(u64::from(b)))?;
        }
        Ok(())
    }

    /// Open a nested span. Labels are opaque to the engine. Inert once the
    /// recorder is frozen.
    pub fn start_span(&mut self, label: u64) {
        if self.frozen {
            return;
        }
        let parent = *self.span_stack.last().unwrap();
        let span = Span {
            label,
            parent: Some(parent),
            start: self.buffer.len(),
            end: self.buffer.len(),
            discarded: false,
        };
        self.spans.push(span);
        self.span_stack.push(self.spans.len() - 1);
    }

    /// Close the innermost open span. Discarded spans mark bytes the shrinker
    /// may delete wholesale, and prune the matching branch of the search tree.
    pub fn stop_span(&mut self, discard: bool) {
        if self.frozen {
            return;
        }
        assert!(
            self.span_stack.len() > 1,
            "stop_span without a matching start_span"
        );
        let idx = self.span_stack.pop().unwrap();
        self.spans[idx].end = self.buffer.len();
        self.spans[idx].discarded = discard;
        if discard {
            if let Some(observer) = self.observer.as_mut() {
                observer.kill_branch();
            }
        }
    }

    /// Record a named event for end-of-run statistics.
    pub fn note_event(&mut self, name: &str) {
        self.events.push(name.to_owned());
    }

    pub fn mark_interesting(&mut self, origin: u64) -> Result<(), StopTest> {
        self.conclude(Status::Interesting, Some(origin))
    }

    pub fn mark_invalid(&mut self) -> Result<(), StopTest> {
        self.conclude(Status::Invalid, None)
    }

    pub fn mark_overrun(&mut self) -> Result<(), StopTest> {
        self.conclude(Status::Overrun, None)
    }

    fn conclude(&mut self, status: Status, origin: Option<u64>) -> Result<(), StopTest> {
        if self.frozen {
            // The first conclusion wins; a test running on past its mark
            // just keeps getting told to stop.
            return Err(StopTest);
        }
        self.status = status;
        self.origin = origin;
        self.freeze();
        Err(StopTest)
    }

    /// Close any open spans and seal the recorder. Idempotent.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        while self.span_stack.len() > 1 {
            let idx = self.span_stack.pop().unwrap();
            self.spans[idx].end = self.buffer.len();
        }
        self.span_stack.pop();
        self.spans[0].end = self.buffer.len();
        self.frozen = true;
        if let Some(observer) = self.observer.as_mut() {
            observer.conclude(self.status);
        }
    }

    /// The immutable record of this execution. Must be frozen first.
    pub fn as_result(&self) -> ConjectureResult {
        assert!(self.frozen, "as_result called before freeze");
        ConjectureResult {
            status: self.status,
            origin: self.origin,
            buffer: self.buffer.clone(),
            blocks: self.blocks.clone(),
            draws: self.draws.clone(),
            spans: self.spans.clone(),
            events: self.events.clone(),
        }
    }
}

/// Frozen record of a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConjectureResult {
    pub status: Status,
    pub origin: Option<u64>,
    pub buffer: Vec<u8>,
    pub blocks: Vec<Block>,
    pub draws: Vec<DrawRecord>,
    pub spans: Vec<Span>,
    pub events: Vec<String>,
}

impl ConjectureResult {
    pub fn has_discards(&self) -> bool {
        self.spans.iter().any(|s| s.discarded)
    }

    /// A synthetic overrun record for a buffer the tree already knows cannot
    /// complete. Carries no structure.
    pub fn overrun(buffer: Vec<u8>) -> Self {
        ConjectureResult {
            status: Status::Overrun,
            origin: None,
            buffer,
            blocks: Vec::new(),
            draws: Vec::new(),
            spans: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Event names with multiplicity, for run statistics.
    pub fn event_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in &self.events {
            *counts.entry(event.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Big-endian bytes of `value`, exactly `n_bytes` wide.
pub(crate) fn int_to_bytes(value: u64, n_bytes: usize) -> Vec<u8> {
    let mut out = vec![0u8; n_bytes];
    let mut v = value;
    for i in (0..n_bytes).rev() {
        out[i] = (v & 0xff) as u8;
        v >>= 8;
    }
    debug_assert_eq!(v, 0, "value does not fit in n_bytes");
    out
}

/// Big-endian integer from at most 8 bytes.
pub(crate) fn bytes_to_int(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for &b in bytes {
        v = (v << 8) | u64::from(b);
    }
    v
}
