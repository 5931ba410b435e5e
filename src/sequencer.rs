//! Global arrival sequence shared by both message kinds.
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues strictly increasing, contiguous arrival indices.
///
/// The counter is the only state shared between the reader and the writer
/// thread. Each finalized message takes exactly one value, and the caller
/// must hand that value to the sink before taking the next one.
#[derive(Debug, Default)]
pub struct Sequencer {
    first: u64,
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            first,
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to [`Sequencer::next`] will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    /// Number of values handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - self.first
    }
}
