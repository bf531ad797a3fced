use thiserror::Error;

use super::types::{BlockRange, Height};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeResolutionError {
    #[error("resolved range is inverted: from {from} > to {to}")]
    Inverted { from: Height, to: Height },
}

/// Upstream bounds used to compute the next range for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeInputs {
    /// Highest height durably stored for the domain (`MAX(height)`), if any.
    pub last_stored: Option<Height>,
    pub chain_tip: Height,
    /// Earliest height the upstream still retains.
    pub earliest_available: Height,
    pub lookback_blocks: i64,
    /// Additional tips the range must not exceed, e.g. another domain's ingested tip.
    pub upper_bounds: Vec<Height>,
}

/// Computes the next block range to process.
///
/// - Resume: `from = last_stored + 1`.
/// - Cold start: `from = max(tip - lookback, earliest, 1)`.
/// - `to` is the chain tip clamped to every entry of `upper_bounds`.
///
/// Returns `Ok(None)` when the domain is caught up (`from == to + 1`). Any other `from > to` is a
/// resolution failure; it is never flipped or clamped into a valid-looking range.
pub fn resolve_range(inputs: &RangeInputs) -> Result<Option<BlockRange>, RangeResolutionError> {
    let from = match inputs.last_stored {
        Some(last) => last.saturating_add(1),
        None => inputs
            .chain_tip
            .saturating_sub(inputs.lookback_blocks.max(0))
            .max(inputs.earliest_available)
            .max(1),
    };

    let to = inputs
        .upper_bounds
        .iter()
        .copied()
        .fold(inputs.chain_tip, Height::min);

    if let Some(range) = BlockRange::new(from, to) {
        return Ok(Some(range));
    }

    if from == to.saturating_add(1) {
        Ok(None)
    } else {
        Err(RangeResolutionError::Inverted { from, to })
    }
}
