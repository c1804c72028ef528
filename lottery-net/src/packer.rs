//! Greedy batch packer.
//!
//! Turns a forward-only stream of wagers into a stream of [`Batch`]es that
//! each respect two bounds: at most `max_count` wagers, and a complete
//! `RegisterBatch` frame of at most `max_bytes`.  Every batch is maximal: the
//! wager that follows it in the source would have broken one of the bounds.
//!
//! ```text
//!  source ─▶ [w1 w2 w3] [w4 w5] [w6 …] ─▶ session
//!                      ▲
//!                      └ w4 did not fit; it seeds the next batch
//! ```

use thiserror::Error;

use crate::frame::{batch_overhead, BET_LEN_PREFIX, MAX_BET_LEN, MAX_FRAME_LEN};
use crate::wager::{SourceError, Wager, WAGER_FIXED_LEN};

/// Default number of wagers per batch.
pub const DEFAULT_MAX_COUNT: usize = 100;
/// Default frame size budget per batch (8 KiB).
pub const DEFAULT_MAX_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum PackError {
    /// The wager source failed.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// A single wager cannot fit in any batch.  Fatal configuration error.
    #[error("wager of {size} bytes (holder {holder_id}) cannot fit a {budget}-byte batch")]
    WagerTooLarge {
        holder_id: u32,
        size: usize,
        budget: usize,
    },
    #[error("invalid batch limits: {0}")]
    InvalidLimits(&'static str),
}

/// Count and byte bounds for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl BatchLimits {
    pub fn new(max_count: usize, max_bytes: usize) -> Result<Self, PackError> {
        let limits = Self {
            max_count,
            max_bytes,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Reject bounds under which not even an empty-named wager fits.
    pub fn validate(&self) -> Result<(), PackError> {
        if self.max_count == 0 {
            return Err(PackError::InvalidLimits("max count must be at least 1"));
        }
        if self.max_bytes < batch_overhead(1) + WAGER_FIXED_LEN {
            return Err(PackError::InvalidLimits(
                "max bytes is smaller than a single minimal wager frame",
            ));
        }
        if self.max_bytes > MAX_FRAME_LEN {
            return Err(PackError::InvalidLimits(
                "max bytes exceeds the largest frame a server accepts",
            ));
        }
        Ok(())
    }
}

/// A group of wagers sent in one `RegisterBatch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    wagers: Vec<Wager>,
    payload_len: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.wagers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wagers.is_empty()
    }

    pub fn wagers(&self) -> &[Wager] {
        &self.wagers
    }

    pub fn into_wagers(self) -> Vec<Wager> {
        self.wagers
    }

    /// Sum of the wagers' serialized sizes, without framing.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Size of the complete `RegisterBatch` frame for this batch.
    pub fn frame_len(&self) -> usize {
        batch_overhead(self.len()) + self.payload_len
    }

    fn push(&mut self, wager: Wager) {
        self.payload_len += wager.encoded_len();
        self.wagers.push(wager);
    }
}

/// Lazily packs wagers from `I` into batches.
///
/// Yields `Err` at most once; the packer is exhausted afterwards.  Limits
/// built by hand are checked on the first call to `next`.
pub struct BatchPacker<I> {
    source: I,
    limits: BatchLimits,
    /// A wager read from the source that did not fit the previous batch.
    carry: Option<Wager>,
    done: bool,
}

impl<I> BatchPacker<I>
where
    I: Iterator<Item = Result<Wager, SourceError>>,
{
    pub fn new(source: I, limits: BatchLimits) -> Self {
        Self {
            source,
            limits,
            carry: None,
            done: false,
        }
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn next_wager(&mut self) -> Option<Result<Wager, SourceError>> {
        self.carry.take().map(Ok).or_else(|| self.source.next())
    }

    /// Bytes `wager` adds to a batch: its body plus its length prefix.
    fn cost(wager: &Wager) -> usize {
        BET_LEN_PREFIX + wager.encoded_len()
    }

    fn check_fits_alone(&self, wager: &Wager) -> Result<(), PackError> {
        let size = wager.encoded_len();
        if size > MAX_BET_LEN || batch_overhead(1) + size > self.limits.max_bytes {
            return Err(PackError::WagerTooLarge {
                holder_id: wager.holder_id,
                size,
                budget: self.limits.max_bytes,
            });
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<Option<Batch>, PackError> {
        self.limits.validate()?;
        let mut batch = Batch::default();
        let mut frame_len = batch_overhead(0);

        while batch.len() < self.limits.max_count {
            let wager = match self.next_wager() {
                None => break,
                Some(res) => res?,
            };
            self.check_fits_alone(&wager)?;

            let cost = Self::cost(&wager);
            if frame_len + cost > self.limits.max_bytes {
                self.carry = Some(wager);
                break;
            }
            frame_len += cost;
            batch.push(wager);
        }

        Ok((!batch.is_empty()).then_some(batch))
    }
}

impl<I> Iterator for BatchPacker<I>
where
    I: Iterator<Item = Result<Wager, SourceError>>,
{
    type Item = Result<Batch, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.carry = None;
                Some(Err(e))
            }
        }
    }
}
