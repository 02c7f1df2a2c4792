//! Shrinking: reducing a failing buffer to a shortlex-minimal one.
//!
//! "Simpler" is defined by [`sort_key`]: shorter buffers beat longer ones,
//! ties break lexicographically. The [`Shrinker`] runs a fixed set of passes
//! to a fixed point, only ever accepting candidates that still fail with the
//! same origin and are strictly smaller under the key. Every accepted shrink
//! is mirrored into the secondary database key by the runner.

use std::collections::{BTreeMap, HashSet};

use byteorder::{BigEndian, ByteOrder};

use crate::data::ConjectureResult;
use crate::engine::{ConjectureRunner, Interrupt, TestFn};

/// Shortlex ordering key: length first, then byte content.
pub fn sort_key(buffer: &[u8]) -> (usize, &[u8]) {
    (buffer.len(), buffer)
}

/// Binary-search style minimizer for a single unsigned integer. Tries the
/// trivial values first, then progressively knocks bits off the top and
/// bottom of the current value.
pub struct Minimizer<'p, E> {
    current: u64,
    seen: HashSet<u64>,
    predicate: &'p mut dyn FnMut(u64) -> Result<bool, E>,
}

impl<'p, E> Minimizer<'p, E> {
    /// Minimize `initial` subject to `predicate`, which must hold for
    /// `initial` itself.
    pub fn minimize(
        initial: u64,
        predicate: &'p mut dyn FnMut(u64) -> Result<bool, E>,
    ) -> Result<u64, E> {
        let mut seen = HashSet::new();
        seen.insert(initial);
        let mut minimizer = Minimizer {
            current: initial,
            seen,
            predicate,
        };
        if minimizer.short_circuit()? {
            return Ok(minimizer.current);
        }
        loop {
            let before = minimizer.current;
            minimizer.shift_right()?;
            minimizer.shrink_by_multiples(2)?;
            minimizer.shrink_by_multiples(1)?;
            if minimizer.current == before {
                break;
            }
        }
        Ok(minimizer.current)
    }

    fn consider(&mut self, value: u64) -> Result<bool, E> {
        if value >= self.current || self.seen.contains(&value) {
            return Ok(false);
        }
        self.seen.insert(value);
        if (self.predicate)(value)? {
            self.current = value;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn short_circuit(&mut self) -> Result<bool, E> {
        for v in 0..2 {
            if self.consider(v)? {
                return Ok(true);
            }
        }
        self.mask_high_bits()?;
        Ok(self.current <= 1)
    }

    fn bit_length(value: u64) -> u32 {
        64 - value.leading_zeros()
    }

    fn shift_right(&mut self) -> Result<(), E> {
        let base = self.current;
        for k in 1..=Self::bit_length(base) {
            let shifted = base >> k;
            if shifted == 0 {
                break;
            }
            if self.consider(shifted)? {
                break;
            }
        }
        Ok(())
    }

    fn mask_high_bits(&mut self) -> Result<(), E> {
        let base = self.current;
        let n = Self::bit_length(base);
        for k in 1..n {
            let mask = (1u64 << (n - k)) - 1;
            if self.consider(base & mask)? {
                break;
            }
        }
        Ok(())
    }

    fn shrink_by_multiples(&mut self, k: u64) -> Result<(), E> {
        let base = self.current;
        for n in 1u64.. {
            let delta = match n.checked_mul(k) {
                Some(d) => d,
                None => break,
            };
            let value = match base.checked_sub(delta) {
                Some(v) => v,
                None => break,
            };
            if !self.consider(value)? {
                break;
            }
        }
        Ok(())
    }
}

/// Minimizes one failure origin held by the runner.
pub(crate) struct Shrinker<'a> {
    runner: &'a mut ConjectureRunner,
    origin: u64,
    current: ConjectureResult,
}

impl<'a> Shrinker<'a> {
    pub(crate) fn new(
        runner: &'a mut ConjectureRunner,
        origin: u64,
        initial: ConjectureResult,
    ) -> Self {
        Shrinker {
            runner,
            origin,
            current: initial,
        }
    }

    /// Run all passes to a fixed point. The shrink budget is enforced by the
    /// runner, which stops the whole run once `max_shrinks` improvements
    /// have been accepted.
    pub(crate) fn shrink(mut self, test: &mut TestFn<'_>) -> Result<ConjectureResult, Interrupt> {
        if self.runner.shrink_budget_exhausted() {
            return Err(Interrupt::Exit(crate::engine::ExitReason::MaxShrinks));
        }
        if self.current.buffer.iter().all(|&b| b == 0) {
            // Already at the global minimum for its length.
            return Ok(self.current);
        }
        loop {
            let before = self.current.buffer.clone();
            self.remove_discarded(test)?;
            self.delete_spans(test)?;
            self.delete_blocks(test)?;
            self.zero_spans(test)?;
            self.minimize_individual_blocks(test)?;
            self.lower_common_block_offset(test)?;
            self.block_program_minus_xx(test)?;
            if self.current.buffer == before {
                break;
            }
        }
        Ok(self.current)
    }

    /// Offer a candidate buffer. Accepted only if it runs to the same
    /// failure origin with a strictly smaller buffer.
    fn incorporate(&mut self, candidate: Vec<u8>, test: &mut TestFn<'_>) -> Result<bool, Interrupt> {
        if sort_key(&candidate) >= sort_key(&self.current.buffer) {
            return Ok(false);
        }
        let result = self.runner.cached_test_function(&candidate, test)?;
        let accepted = result.status == crate::data::Status::Interesting
            && result.origin == Some(self.origin)
            && sort_key(&result.buffer) < sort_key(&self.current.buffer);
        if accepted {
            self.current = result;
        }
        if self.runner.shrink_budget_exhausted() {
            return Err(Interrupt::Exit(crate::engine::ExitReason::MaxShrinks));
        }
        Ok(accepted)
    }

    /// Drop the bytes of every discarded span in a single step, repeating
    /// while the reduced test case still has discards.
    fn remove_discarded(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        while self.current.has_discards() {
            let mut keep = vec![true; self.current.buffer.len()];
            let mut any = false;
            for span in &self.current.spans {
                if span.discarded {
                    for flag in &mut keep[span.start..span.end] {
                        if *flag {
                            *flag = false;
                            any = true;
                        }
                    }
                }
            }
            if !any {
                // Only zero-length discards remain; nothing to delete.
                break;
            }
            let candidate: Vec<u8> = self
                .current
                .buffer
                .iter()
                .zip(&keep)
                .filter(|(_, &k)| k)
                .map(|(&b, _)| b)
                .collect();
            if !self.incorporate(candidate, test)? {
                break;
            }
        }
        Ok(())
    }

    /// Try deleting whole spans, innermost last recorded first.
    fn delete_spans(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut i = self.current.spans.len();
        while i > 1 {
            i -= 1;
            if i >= self.current.spans.len() {
                continue;
            }
            let span = self.current.spans[i].clone();
            if span.start == span.end {
                continue;
            }
            let mut candidate = self.current.buffer[..span.start].to_vec();
            candidate.extend_from_slice(&self.current.buffer[span.end.min(self.current.buffer.len())..]);
            self.incorporate(candidate, test)?;
        }
        Ok(())
    }

    /// Try deleting individual blocks, last first.
    fn delete_blocks(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut i = self.current.blocks.len();
        while i > 0 {
            i -= 1;
            if i >= self.current.blocks.len() {
                continue;
            }
            let block = self.current.blocks[i];
            let mut candidate = self.current.buffer[..block.start].to_vec();
            candidate.extend_from_slice(&self.current.buffer[block.end.min(self.current.buffer.len())..]);
            self.incorporate(candidate, test)?;
        }
        Ok(())
    }

    /// Replace span contents with zero bytes of the same length.
    fn zero_spans(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut i = 0;
        while i < self.current.spans.len() {
            let span = self.current.spans[i].clone();
            let end = span.end.min(self.current.buffer.len());
            if span.start < end && self.current.buffer[span.start..end].iter().any(|&b| b != 0) {
                let mut candidate = self.current.buffer.clone();
                for b in &mut candidate[span.start..end] {
                    *b = 0;
                }
                self.incorporate(candidate, test)?;
            }
            i += 1;
        }
        Ok(())
    }

    /// Treat each block as a big-endian integer and minimize it towards zero.
    fn minimize_individual_blocks(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut i = 0;
        while i < self.current.blocks.len() {
            let value = match self.block_value(i) {
                Some(v) if v > 0 => v,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let mut predicate =
                |v: u64| -> Result<bool, Interrupt> { self.try_block_value(i, v, test) };
            Minimizer::minimize(value, &mut predicate)?;
            i += 1;
        }
        Ok(())
    }

    fn block_value(&self, i: usize) -> Option<u64> {
        let block = self.current.blocks.get(i)?;
        let width = block.len();
        if width == 0 || width > 8 || block.end > self.current.buffer.len() {
            return None;
        }
        Some(BigEndian::read_uint(
            &self.current.buffer[block.start..block.end],
            width,
        ))
    }

    fn try_block_value(
        &mut self,
        i: usize,
        value: u64,
        test: &mut TestFn<'_>,
    ) -> Result<bool, Interrupt> {
        let block = match self.current.blocks.get(i) {
            Some(b) => *b,
            None => return Ok(false),
        };
        let width = block.len();
        if width == 0 || width > 8 || block.end > self.current.buffer.len() {
            return Ok(false);
        }
        if width < 8 && value >> (8 * width) != 0 {
            return Ok(false);
        }
        let mut candidate = self.current.buffer.clone();
        BigEndian::write_uint(&mut candidate[block.start..block.end], value, width);
        self.incorporate(candidate, test)
    }

    /// Blocks with identical nonzero contents often encode the same logical
    /// value; lower them all together.
    fn lower_common_block_offset(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut groups: BTreeMap<Vec<u8>, Vec<usize>> = BTreeMap::new();
        for (i, block) in self.current.blocks.iter().enumerate() {
            if block.end > self.current.buffer.len() || block.len() == 0 || block.len() > 8 {
                continue;
            }
            let content = self.current.buffer[block.start..block.end].to_vec();
            if content.iter().any(|&b| b != 0) {
                groups.entry(content).or_insert_with(Vec::new).push(i);
            }
        }
        for (content, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let width = content.len();
            let value = BigEndian::read_uint(&content, width);
            let mut predicate = |v: u64| -> Result<bool, Interrupt> {
                if width < 8 && v >> (8 * width) != 0 {
                    return Ok(false);
                }
                let mut candidate = self.current.buffer.clone();
                for &i in &members {
                    let block = match self.current.blocks.get(i) {
                        Some(b) => *b,
                        None => return Ok(false),
                    };
                    if block.len() != width || block.end > candidate.len() {
                        return Ok(false);
                    }
                    BigEndian::write_uint(&mut candidate[block.start..block.end], v, width);
                }
                self.incorporate(candidate, test)
            };
            Minimizer::minimize(value, &mut predicate)?;
        }
        Ok(())
    }

    /// The "-XX" block program: decrement a block and delete the two blocks
    /// after it. Catches length-prefixed structures where shrinking the
    /// count must drop elements at the same time.
    fn block_program_minus_xx(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut i = 0;
        loop {
            if i + 2 >= self.current.blocks.len() {
                break;
            }
            let value = match self.block_value(i) {
                Some(v) if v > 0 => v,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let here = self.current.blocks[i];
            let delete_start = self.current.blocks[i + 1].start;
            let delete_end = self.current.blocks[i + 2].end.min(self.current.buffer.len());
            let width = here.len();
            let mut candidate = self.current.buffer[..delete_start].to_vec();
            candidate.extend_from_slice(&self.current.buffer[delete_end..]);
            BigEndian::write_uint(&mut candidate[here.start..here.end], value - 1, width);
            if !self.incorporate(candidate, test)? {
                i += 1;
            }
        }
        Ok(())
    }
}
