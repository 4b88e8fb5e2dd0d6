//! Edge encoding: emit only the items whose field value changed from the
//! previous event of the same actor.

use crate::event::{item_field, GroupedRecord, Item};

/// Edge-encode one event's items into `encoded`, diffing against
/// `prev_items` (one slot per field, zeroed at actor boundaries).
///
/// Invalid records produce an empty set. The output buffer is cleared and
/// reused across events.
pub fn edge_encode_items(
    items: &[Item],
    prev_items: &mut [Item],
    encoded: &mut Vec<Item>,
    ev: &GroupedRecord,
) {
    encoded.clear();
    if !ev.is_valid() {
        return;
    }
    let start = ev.item_zero as usize;
    let end = start + ev.num_items as usize;
    for &it in &items[start..end] {
        let field = item_field(it) as usize;
        if prev_items[field] != it {
            prev_items[field] = it;
            encoded.push(it);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::make_item;

    fn rec(item_zero: u64, num_items: u32, timestamp: u32) -> GroupedRecord {
        GroupedRecord { cookie_id: 0, item_zero, num_items, timestamp }
    }

    #[test]
    fn first_event_emits_everything() {
        let items = vec![make_item(1, 7), make_item(2, 9)];
        let mut prev = vec![0u64; 3];
        let mut out = Vec::new();
        edge_encode_items(&items, &mut prev, &mut out, &rec(0, 2, 0));
        assert_eq!(out, items);
        assert_eq!(prev[1], items[0]);
        assert_eq!(prev[2], items[1]);
    }

    #[test]
    fn repeated_values_are_suppressed() {
        let items = vec![
            make_item(1, 7),
            make_item(2, 9),
            make_item(1, 7), // same value again
            make_item(2, 4), // changed
        ];
        let mut prev = vec![0u64; 3];
        let mut out = Vec::new();
        edge_encode_items(&items, &mut prev, &mut out, &rec(0, 2, 0));
        edge_encode_items(&items, &mut prev, &mut out, &rec(2, 2, 0));
        assert_eq!(out, vec![make_item(2, 4)]);
    }

    #[test]
    fn invalid_event_emits_nothing() {
        let items = vec![make_item(1, 7)];
        let mut prev = vec![0u64; 2];
        let mut out = vec![make_item(1, 1)]; // stale content must be cleared
        edge_encode_items(&items, &mut prev, &mut out, &rec(0, 1, 1));
        assert!(out.is_empty());
        assert_eq!(prev[1], 0);
    }

    #[test]
    fn empty_item_slice_is_fine() {
        let items: Vec<Item> = Vec::new();
        let mut prev = vec![0u64; 2];
        let mut out = Vec::new();
        edge_encode_items(&items, &mut prev, &mut out, &rec(0, 0, 0));
        assert!(out.is_empty());
    }
}
