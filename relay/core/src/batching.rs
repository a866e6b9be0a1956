//! Batching Policy
//!
//! Decides whether the accumulated content of a stream should be flushed to
//! subscribers now. The decision is a pure function of the running token
//! estimate and two flags; the caller owns all state.
//!
//! # Boundary skipping
//!
//! The default cadence flushes when the running count is an exact multiple of
//! the batch size. Because the count advances by `ceil(bytes / 4)` per delta,
//! a single large delta can step over a multiple (18 → 35 with a batch of 30)
//! and no threshold flush fires for that boundary. [`FlushCadence::BoundaryCrossing`]
//! flushes whenever a boundary was crossed instead; it is opt-in because
//! clients may depend on the exact-multiple cadence.

use serde::{Deserialize, Serialize};

/// Default number of estimated tokens between non-essential flushes
pub const DEFAULT_BATCH_SIZE: u32 = 30;

/// Estimated token count of a content delta: `ceil(bytes / 4)`
#[must_use]
pub fn estimate_tokens(delta: &str) -> u32 {
    let tokens = delta.len().div_ceil(4);
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Exact-multiple flush rule
///
/// `is_done || (token_count > 0 && token_count % batch_size == 0) || is_first_content_chunk`
///
/// A `batch_size` of 0 disables threshold flushes.
#[must_use]
pub fn should_flush(
    token_count: u32,
    is_first_content_chunk: bool,
    is_done: bool,
    batch_size: u32,
) -> bool {
    is_done
        || is_first_content_chunk
        || (batch_size > 0 && token_count > 0 && token_count % batch_size == 0)
}

/// How threshold flushes are scheduled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushCadence {
    /// Flush when the running count equals a multiple of the batch size
    #[default]
    ExactMultiple,
    /// Flush when `floor(count / batch_size)` increased since the previous count
    BoundaryCrossing,
}

/// Batching policy: batch size plus cadence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingPolicy {
    /// Estimated tokens between threshold flushes
    pub batch_size: u32,
    /// Threshold rule
    pub cadence: FlushCadence,
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            cadence: FlushCadence::ExactMultiple,
        }
    }
}

impl BatchingPolicy {
    /// Policy with the given batch size and the default cadence
    #[must_use]
    pub fn with_batch_size(batch_size: u32) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Decide whether to flush after the count moved from `previous_count` to `token_count`
    #[must_use]
    pub fn decide(
        &self,
        previous_count: u32,
        token_count: u32,
        is_first_content_chunk: bool,
        is_done: bool,
    ) -> bool {
        match self.cadence {
            FlushCadence::ExactMultiple => {
                should_flush(token_count, is_first_content_chunk, is_done, self.batch_size)
            }
            FlushCadence::BoundaryCrossing => {
                is_done
                    || is_first_content_chunk
                    || (self.batch_size > 0
                        && token_count / self.batch_size > previous_count / self.batch_size)
            }
        }
    }
}
