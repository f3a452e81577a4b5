//! Content fingerprint of a normalized book, used for change suppression.

use sha2::{Digest, Sha256};

use super::types::{OrderBookSnapshot, PriceLevel};

/// Compute a hex SHA-256 fingerprint over both sides of a snapshot.
///
/// Two snapshots with the same levels always fingerprint equal, regardless of
/// decimal scale (`20.40` and `20.4` hash the same).
pub fn fingerprint(snapshot: &OrderBookSnapshot) -> String {
    let mut hasher = Sha256::new();

    hasher.update(snapshot.market_id.as_bytes());
    hasher.update(b"#");
    hash_levels(&mut hasher, &snapshot.bids);
    hasher.update(b"---");
    hash_levels(&mut hasher, &snapshot.asks);

    hex::encode(hasher.finalize())
}

fn hash_levels(hasher: &mut Sha256, levels: &[PriceLevel]) {
    for level in levels {
        hasher.update(level.price.normalize().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(level.size.normalize().to_string().as_bytes());
        hasher.update(b"|");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::aggregator::normalize;
    use crate::orderbook::types::RawBook;
    use rust_decimal_macros::dec;

    fn raw() -> RawBook {
        RawBook::new(
            vec![
                PriceLevel::new(dec!(20.44), dec!(100.5)),
                PriceLevel::new(dec!(20.43), dec!(50.2)),
            ],
            vec![
                PriceLevel::new(dec!(20.46), dec!(80.3)),
                PriceLevel::new(dec!(20.47), dec!(45.6)),
            ],
        )
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let snapshot = normalize("M1", &raw(), dec!(0.01), 20);
        let fp = fingerprint(&snapshot);

        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn reordered_raw_input_fingerprints_equal() {
        let mut reordered = raw();
        reordered.bids.reverse();
        reordered.asks.reverse();

        let a = normalize("M1", &raw(), dec!(0.01), 20);
        let b = normalize("M1", &reordered, dec!(0.01), 20);

        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn size_change_changes_fingerprint() {
        let mut changed = raw();
        changed.bids[0].size = dec!(101);

        let a = normalize("M1", &raw(), dec!(0.01), 20);
        let b = normalize("M1", &changed, dec!(0.01), 20);

        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn sides_are_not_interchangeable() {
        let level = vec![PriceLevel::new(dec!(1), dec!(1))];
        let bid_only = OrderBookSnapshot {
            market_id: "M1".to_string(),
            bids: level.clone(),
            asks: vec![],
        };
        let ask_only = OrderBookSnapshot {
            market_id: "M1".to_string(),
            bids: vec![],
            asks: level,
        };

        assert_ne!(fingerprint(&bid_only), fingerprint(&ask_only));
    }
}
