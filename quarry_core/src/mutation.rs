//! Byte-level havoc mutation.

use crate::exec::RunStatus;
use crate::sample::Sample;
use crate::RngType;
use rand::prelude::*;
use std::any::Any;
use std::cmp::min;
use std::ops::Range;
use std::sync::Arc;

/// Mutation strategy driven by the engine's fuzz loop.
///
/// The engine owns one mutator per worker and one opaque context per
/// corpus entry; the context is created lazily because entries restored
/// from disk may never be fuzzed at all.
pub trait Mutator {
    fn create_context(&mut self, sample: &Sample) -> Box<dyn Any + Send>;

    /// Called once before a round of mutations against one corpus entry.
    fn init_round(&mut self, sample: &Sample, context: &mut Box<dyn Any + Send>);

    /// Mutate `sample` in place. Returning `false` ends the round.
    fn mutate(&mut self, sample: &mut Sample, rng: &mut RngType, corpus: &[Arc<Sample>]) -> bool;

    /// Outcome of the run of the mutated sample.
    fn notify_result(&mut self, status: RunStatus, new_coverage: bool);
}

/// Mutations dispensed per round before the entry goes back to the queue.
pub const HAVOC_ROUND_LEN: u64 = 512;

// A mutation operation; returns true if it changed the buffer.
type MutateOperation = fn(&mut Vec<u8>, &mut RngType, &[Arc<Sample>]) -> bool;

const MUTATE_OPERATIONS: [MutateOperation; 12] = [
    flip_bit,
    overwrite_random_byte,
    perturb8,
    perturb16,
    perturb32,
    replace_magic,
    erase_block,
    insert_random_block,
    insert_repeated_block,
    overwrite_within,
    shuffle_block,
    splice_corpus,
];

/// Stacked random byte mutations with an occasional splice from the
/// shared corpus.
#[derive(Default)]
pub struct HavocMutator {
    rounds_left: u64,
}

struct HavocContext {
    rounds_started: u64,
}

impl HavocMutator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mutator for HavocMutator {
    fn create_context(&mut self, _sample: &Sample) -> Box<dyn Any + Send> {
        Box::new(HavocContext { rounds_started: 0 })
    }

    fn init_round(&mut self, _sample: &Sample, context: &mut Box<dyn Any + Send>) {
        if let Some(ctx) = context.downcast_mut::<HavocContext>() {
            ctx.rounds_started += 1;
        }
        self.rounds_left = HAVOC_ROUND_LEN;
    }

    fn mutate(&mut self, sample: &mut Sample, rng: &mut RngType, corpus: &[Arc<Sample>]) -> bool {
        if self.rounds_left == 0 {
            return false;
        }
        self.rounds_left -= 1;

        let buf = sample.bytes_mut();
        if buf.is_empty() {
            buf.push(rng.gen());
            return true;
        }

        let mut mutated = false;
        let mut tries = 0;
        while tries < 16 && (!mutated || rng.gen_ratio(1, 3)) {
            let op = MUTATE_OPERATIONS.choose(rng).unwrap();
            mutated |= op(buf, rng, corpus);
            tries += 1;
        }
        true
    }

    fn notify_result(&mut self, _status: RunStatus, _new_coverage: bool) {}
}

/// Length of the block an operation works on; the buffer must hold at
/// least 2 bytes.
#[inline]
fn rand_op_len(rng: &mut RngType, len: usize) -> usize {
    debug_assert!(len >= 2);
    let max = min(len, 64);
    rng.gen_range(2..=max)
}

#[inline]
fn rand_op_range(rng: &mut RngType, len: usize) -> Range<usize> {
    let op_len = rand_op_len(rng, len);
    let start = rng.gen_range(0..=(len - op_len));
    start..(start + op_len)
}

fn flip_bit(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    let pos = rng.gen_range(0..buf.len());
    buf[pos] ^= 1 << rng.gen_range(0..8);
    true
}

fn overwrite_random_byte(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    let pos = rng.gen_range(0..buf.len());
    buf[pos] = rng.gen();
    true
}

fn perturb_scalar(buf: &mut [u8], rng: &mut RngType, width: usize) -> bool {
    if buf.len() < width {
        return false;
    }
    let pos = rng.gen_range(0..=(buf.len() - width));
    let delta = rng.gen_range(1..=35i64);
    let delta = if rng.gen() { delta } else { -delta };
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(&buf[pos..pos + width]);
    let v = u64::from_le_bytes(raw).wrapping_add(delta as u64);
    buf[pos..pos + width].copy_from_slice(&v.to_le_bytes()[..width]);
    true
}

fn perturb8(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    perturb_scalar(buf, rng, 1)
}

fn perturb16(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    perturb_scalar(buf, rng, 2)
}

fn perturb32(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    perturb_scalar(buf, rng, 4)
}

const MAGIC16: [u16; 7] = [0, 1, 0x7f, 0x80, 0xff, 0x7fff, 0x8000];
const MAGIC32: [u32; 6] = [0, 1, 0x7fff_ffff, 0x8000_0000, 0xffff_ffff, 0x0001_0000];

fn replace_magic(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    if rng.gen() {
        if buf.len() < 2 {
            return false;
        }
        let pos = rng.gen_range(0..=(buf.len() - 2));
        let v = *MAGIC16.choose(rng).unwrap();
        let v = if rng.gen() { v.swap_bytes() } else { v };
        buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
    } else {
        if buf.len() < 4 {
            return false;
        }
        let pos = rng.gen_range(0..=(buf.len() - 4));
        let v = *MAGIC32.choose(rng).unwrap();
        let v = if rng.gen() { v.swap_bytes() } else { v };
        buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }
    true
}

fn erase_block(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let r = rand_op_range(rng, buf.len());
    buf.drain(r);
    true
}

fn insert_random_block(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    let len: usize = rng.gen_range(2..=64);
    let dst = rng.gen_range(0..=buf.len());
    let block: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    buf.splice(dst..dst, block);
    true
}

fn insert_repeated_block(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    let byte = *[0x00u8, 0xff, rng.gen()].choose(rng).unwrap();
    let len: usize = rng.gen_range(2..=64);
    let dst = rng.gen_range(0..=buf.len());
    buf.splice(dst..dst, std::iter::repeat(byte).take(len));
    true
}

/// Duplicates a block to another position within the buffer.
fn overwrite_within(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let op_len = rand_op_len(rng, buf.len());
    let src = rng.gen_range(0..=(buf.len() - op_len));
    let dst = rng.gen_range(0..=(buf.len() - op_len));
    if src == dst {
        return false;
    }
    buf.copy_within(src..src + op_len, dst);
    true
}

fn shuffle_block(buf: &mut Vec<u8>, rng: &mut RngType, _corpus: &[Arc<Sample>]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let r = rand_op_range(rng, buf.len());
    buf[r].shuffle(rng);
    true
}

/// Overwrites a block with bytes taken from a random corpus sample.
fn splice_corpus(buf: &mut Vec<u8>, rng: &mut RngType, corpus: &[Arc<Sample>]) -> bool {
    let other = match corpus.choose(rng) {
        Some(s) if s.len() >= 2 => s,
        _ => return false,
    };
    if buf.len() < 2 {
        return false;
    }
    let op_len = min(rand_op_len(rng, other.len()), buf.len());
    let src = rng.gen_range(0..=(other.len() - op_len));
    let dst = rng.gen_range(0..=(buf.len() - op_len));
    buf[dst..dst + op_len].copy_from_slice(&other.as_bytes()[src..src + op_len]);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn round_budget_is_enforced() {
        let mut m = HavocMutator::new();
        let mut rng = RngType::seed_from_u64(7);
        let sample = Sample::new(vec![0u8; 32]);
        let mut ctx = m.create_context(&sample);
        m.init_round(&sample, &mut ctx);

        let mut dispensed = 0u64;
        let mut work = sample.clone();
        while m.mutate(&mut work, &mut rng, &[]) {
            dispensed += 1;
            work = sample.clone();
        }
        assert_eq!(dispensed, HAVOC_ROUND_LEN);
    }

    #[test]
    fn mutate_changes_bytes() {
        let mut m = HavocMutator::new();
        let mut rng = RngType::seed_from_u64(1);
        let sample = Sample::new(vec![0u8; 64]);
        let mut ctx = m.create_context(&sample);
        m.init_round(&sample, &mut ctx);

        let mut changed = 0;
        for _ in 0..64 {
            let mut work = sample.clone();
            assert!(m.mutate(&mut work, &mut rng, &[]));
            if work != sample {
                changed += 1;
            }
        }
        assert!(changed > 0);
    }

    #[test]
    fn empty_sample_grows() {
        let mut m = HavocMutator::new();
        let mut rng = RngType::seed_from_u64(3);
        let sample = Sample::new(Vec::new());
        let mut ctx = m.create_context(&sample);
        m.init_round(&sample, &mut ctx);

        let mut work = sample.clone();
        assert!(m.mutate(&mut work, &mut rng, &[]));
        assert!(!work.is_empty());
    }

    #[test]
    fn splice_copies_from_corpus() {
        let mut rng = RngType::seed_from_u64(11);
        let corpus = vec![Arc::new(Sample::new(vec![0xaa; 16]))];
        let mut buf = vec![0u8; 16];
        assert!(splice_corpus(&mut buf, &mut rng, &corpus));
        assert!(buf.iter().any(|b| *b == 0xaa));
    }
}
