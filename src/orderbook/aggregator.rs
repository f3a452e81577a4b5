//! Price-level aggregation: tick bucketing, merging, sorting and depth limits.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::{instrument, warn};

use super::types::{OrderBookSnapshot, PriceLevel, RawBook, Side};

/// Default number of levels kept per side.
pub const DEFAULT_DEPTH: usize = 20;

/// Bucket a price down to its tick: `floor(price / tick) * tick`.
///
/// The result carries the tick's scale so equal buckets always render the
/// same way. A non-positive tick leaves the price unbucketed. Returns None
/// when the division or multiplication would overflow.
pub fn bucket_price(price: Decimal, tick_size: Decimal) -> Option<Decimal> {
    if tick_size <= Decimal::ZERO {
        return Some(price.normalize());
    }

    let mut bucket = price.checked_div(tick_size)?.floor().checked_mul(tick_size)?;
    bucket.rescale(tick_size.scale());
    Some(bucket)
}

/// Aggregate raw levels into one sorted, depth-limited book side.
///
/// Levels falling into the same tick bucket are merged by summing their
/// sizes. Sorting and truncation happen after merging, so overlapping ticks
/// in a deep input are combined before anything is cut off. A level whose
/// price cannot be bucketed is skipped; a bucket whose size overflows
/// saturates at `Decimal::MAX`.
pub fn aggregate(
    levels: &[PriceLevel],
    tick_size: Decimal,
    side: Side,
    depth: usize,
) -> Vec<PriceLevel> {
    let mut buckets: HashMap<Decimal, Decimal> = HashMap::with_capacity(levels.len());

    for level in levels {
        if level.size <= Decimal::ZERO {
            continue;
        }
        let Some(price) = bucket_price(level.price, tick_size) else {
            warn!(price = %level.price, tick_size = %tick_size, "Price out of range, level skipped");
            continue;
        };

        let total = buckets.entry(price).or_insert(Decimal::ZERO);
        *total = total.checked_add(level.size).unwrap_or_else(|| {
            warn!(price = %price, "Bucket size overflowed, saturating");
            Decimal::MAX
        });
    }

    let mut merged: Vec<PriceLevel> = buckets
        .into_iter()
        .filter(|(_, size)| *size > Decimal::ZERO)
        .map(|(price, size)| PriceLevel::new(price, size.normalize()))
        .collect();

    side.sort(&mut merged);
    merged.truncate(depth);
    merged
}

/// Normalize a raw book into a snapshot: both sides aggregated to the tick
/// size and limited to `depth`. Crossed input is passed through.
#[instrument(skip(raw), fields(bids = raw.bids.len(), asks = raw.asks.len()))]
pub fn normalize(
    market_id: &str,
    raw: &RawBook,
    tick_size: Decimal,
    depth: usize,
) -> OrderBookSnapshot {
    OrderBookSnapshot {
        market_id: market_id.to_string(),
        bids: aggregate(&raw.bids, tick_size, Side::Bid, depth),
        asks: aggregate(&raw.asks, tick_size, Side::Ask, depth),
    }
}

/// Calculate the mid price from best bid and ask. None if the sum overflows.
pub fn mid_price(best_bid: Decimal, best_ask: Decimal) -> Option<Decimal> {
    Some(best_bid.checked_add(best_ask)? / Decimal::TWO)
}
