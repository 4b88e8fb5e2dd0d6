//! Gram statistics over the grouped stream, and the per-event covering used
//! by the trail writer.
//!
//! A gram is one or two items treated as an atomic Huffman symbol. A unigram
//! is the item itself (high 32 bits zero). A bigram packs the pair in the
//! order it appears in the event's emitted sequence: `a | b << 32`. Bigrams
//! only pair items of distinct fields, and the timestamp item is always the
//! first of the pair, so the high half of a bigram is never zero and the two
//! encodings cannot collide.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read};

use crate::edge::edge_encode_items;
use crate::event::{item_field, GroupedRecord, Item};

pub type Gram = u64;

/// Only items ranked in this many top unigrams participate in bigram
/// discovery, bounding the candidate map.
pub const MAX_CANDIDATE_ITEMS: usize = 65536;

/// A candidate bigram survives when its co-occurrence count is at least this
/// fraction of its parts' combined unigram counts.
pub const BIGRAM_SCORE_CUTOFF: f64 = 0.25;

pub fn bigram(a: Item, b: Item) -> Gram {
    a | (b << 32)
}

pub fn is_bigram(gram: Gram) -> bool {
    gram >> 32 != 0
}

pub fn bigram_items(gram: Gram) -> (Item, Item) {
    (gram & 0xffff_ffff, gram >> 32)
}

/// Stream the grouped file once and tally every encoded delta and every
/// edge-emitted item.
pub fn collect_unigrams<R: Read>(
    grouped: &mut R,
    items: &[Item],
    num_fields: u32,
) -> io::Result<HashMap<Gram, u64>> {
    let mut freqs: HashMap<Gram, u64> = HashMap::new();
    let mut prev_items = vec![0u64; num_fields as usize];
    let mut encoded = Vec::new();
    let mut cur_cookie = None;

    while let Some(ev) = GroupedRecord::read(grouped)? {
        if cur_cookie != Some(ev.cookie_id) {
            prev_items.fill(0);
            cur_cookie = Some(ev.cookie_id);
        }
        edge_encode_items(items, &mut prev_items, &mut encoded, &ev);
        if ev.is_valid() {
            *freqs.entry(u64::from(ev.timestamp)).or_insert(0) += 1;
        }
        for &it in &encoded {
            *freqs.entry(it).or_insert(0) += 1;
        }
    }
    Ok(freqs)
}

/// Stream the grouped file a second time to discover high-value bigrams.
///
/// Returns the union of all unigrams (with their first-pass counts) and the
/// retained bigrams (with their co-occurrence counts). The trail writer's
/// covering and the Huffman codebook both run off this mapping.
pub fn make_grams<R: Read>(
    grouped: &mut R,
    items: &[Item],
    num_fields: u32,
    unigram_freqs: &HashMap<Gram, u64>,
) -> io::Result<HashMap<Gram, u64>> {
    let mut ranked: Vec<(Item, u64)> = unigram_freqs.iter().map(|(&g, &f)| (g, f)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(MAX_CANDIDATE_ITEMS);
    let candidates: HashSet<Item> = ranked.into_iter().map(|(g, _)| g).collect();

    let mut pair_counts: HashMap<Gram, u64> = HashMap::new();
    let mut prev_items = vec![0u64; num_fields as usize];
    let mut encoded = Vec::new();
    let mut full: Vec<Item> = Vec::new();
    let mut cur_cookie = None;

    while let Some(ev) = GroupedRecord::read(grouped)? {
        if cur_cookie != Some(ev.cookie_id) {
            prev_items.fill(0);
            cur_cookie = Some(ev.cookie_id);
        }
        edge_encode_items(items, &mut prev_items, &mut encoded, &ev);
        if !ev.is_valid() {
            continue;
        }
        full.clear();
        full.push(u64::from(ev.timestamp));
        full.extend_from_slice(&encoded);

        for i in 0..full.len() {
            if !candidates.contains(&full[i]) {
                continue;
            }
            for j in i + 1..full.len() {
                if item_field(full[j]) == item_field(full[i])
                    || !candidates.contains(&full[j])
                {
                    continue;
                }
                *pair_counts.entry(bigram(full[i], full[j])).or_insert(0) += 1;
            }
        }
    }

    let mut gram_freqs = unigram_freqs.clone();
    for (g, count) in pair_counts {
        let (a, b) = bigram_items(g);
        let fa = unigram_freqs.get(&a).copied().unwrap_or(0);
        let fb = unigram_freqs.get(&b).copied().unwrap_or(0);
        if count as f64 / (fa + fb) as f64 >= BIGRAM_SCORE_CUTOFF {
            gram_freqs.insert(g, count);
        }
    }
    Ok(gram_freqs)
}

/// Reusable scratch for [`choose_grams`].
#[derive(Default)]
pub struct GramBufs {
    emitted: Vec<Item>,
    covered: Vec<bool>,
}

impl GramBufs {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Cover one event's emitted items with bigrams and unigrams.
///
/// The first gram always carries the timestamp delta; remaining items are
/// greedily paired left-to-right with their highest-frequency retained
/// partner, and leftovers become unigrams. Every emitted item ends up in
/// exactly one gram.
pub fn choose_grams(
    encoded: &[Item],
    gram_freqs: &HashMap<Gram, u64>,
    bufs: &mut GramBufs,
    out: &mut Vec<Gram>,
    ev: &GroupedRecord,
) {
    out.clear();
    if !ev.is_valid() {
        return;
    }

    bufs.emitted.clear();
    bufs.emitted.push(u64::from(ev.timestamp));
    bufs.emitted.extend_from_slice(encoded);
    let n = bufs.emitted.len();
    bufs.covered.clear();
    bufs.covered.resize(n, false);

    for i in 0..n {
        if bufs.covered[i] {
            continue;
        }
        let a = bufs.emitted[i];
        let mut best: Option<(u64, usize)> = None;
        for j in i + 1..n {
            if bufs.covered[j] || item_field(bufs.emitted[j]) == item_field(a) {
                continue;
            }
            let g = bigram(a, bufs.emitted[j]);
            if let Some(&freq) = gram_freqs.get(&g) {
                if best.map_or(true, |(bf, _)| freq > bf) {
                    best = Some((freq, j));
                }
            }
        }
        bufs.covered[i] = true;
        match best {
            Some((_, j)) => {
                bufs.covered[j] = true;
                out.push(bigram(a, bufs.emitted[j]));
            }
            None => out.push(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{make_item, TIMESTAMP_FIELD};

    fn rec(cookie_id: u32, item_zero: u64, num_items: u32, timestamp: u32) -> GroupedRecord {
        GroupedRecord { cookie_id, item_zero, num_items, timestamp }
    }

    fn spill(records: &[GroupedRecord]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for r in records {
            let mut buf = [0u8; GroupedRecord::SIZE];
            r.write_to(&mut buf);
            bytes.extend_from_slice(&buf);
        }
        bytes
    }

    #[test]
    fn unigram_counts_cover_deltas_and_items() {
        let items = vec![make_item(1, 7), make_item(1, 7), make_item(2, 3)];
        // two events, same actor, second repeats field 1 and adds field 2
        let stream = spill(&[rec(0, 0, 1, 50 << 8), rec(0, 1, 2, 0)]);
        let freqs = collect_unigrams(&mut &stream[..], &items, 3).unwrap();

        assert_eq!(freqs[&((50u64) << 8)], 1);
        assert_eq!(freqs[&0u64], 1); // zero delta of the second event
        assert_eq!(freqs[&make_item(1, 7)], 1); // emitted once, suppressed once
        assert_eq!(freqs[&make_item(2, 3)], 1);

        // frequency conservation: every tally is one emitted item or one
        // valid event's delta
        let total: u64 = freqs.values().sum();
        assert_eq!(total, 2 + 2);
    }

    #[test]
    fn unigram_pass_resets_state_per_actor() {
        let items = vec![make_item(1, 7), make_item(1, 7)];
        let stream = spill(&[rec(0, 0, 1, 0), rec(1, 1, 1, 0)]);
        let freqs = collect_unigrams(&mut &stream[..], &items, 2).unwrap();
        // both actors emit the item: the second actor starts from a zeroed
        // previous vector
        assert_eq!(freqs[&make_item(1, 7)], 2);
    }

    #[test]
    fn invalid_records_contribute_nothing() {
        let items = vec![make_item(1, 7)];
        let stream = spill(&[rec(0, 0, 1, 1)]);
        let freqs = collect_unigrams(&mut &stream[..], &items, 2).unwrap();
        assert!(freqs.is_empty());
    }

    #[test]
    fn make_grams_retains_co_occurring_pairs() {
        // fields 1 and 2 always change together
        let items: Vec<Item> = (0..8)
            .flat_map(|i| [make_item(1, 100 + i), make_item(2, 200 + i)])
            .collect();
        let records: Vec<GroupedRecord> =
            (0..8).map(|i| rec(0, i * 2, 2, 0)).collect();
        let stream = spill(&records);

        let unigrams = collect_unigrams(&mut &stream[..], &items, 3).unwrap();
        let grams = make_grams(&mut &stream[..], &items, 3, &unigrams).unwrap();

        let g = bigram(make_item(1, 100), make_item(2, 200));
        assert_eq!(grams[&g], 1);
        // unigrams survive alongside
        assert!(grams.contains_key(&make_item(1, 100)));
    }

    #[test]
    fn covering_is_exact_and_leads_with_the_delta() {
        let a = make_item(1, 7);
        let b = make_item(2, 9);
        let c = make_item(3, 4);
        let ts_item = (50u64) << 8;

        let mut gram_freqs = HashMap::new();
        for it in [a, b, c, ts_item] {
            gram_freqs.insert(it, 10);
        }
        gram_freqs.insert(bigram(a, b), 8);

        let ev = rec(0, 0, 0, 50 << 8);
        let mut bufs = GramBufs::new();
        let mut out = Vec::new();
        choose_grams(&[a, b, c], &gram_freqs, &mut bufs, &mut out, &ev);

        assert_eq!(out.len(), 3);
        // first gram carries the delta
        assert_eq!(item_field(out[0] & 0xffff_ffff), TIMESTAMP_FIELD);
        assert_eq!(out[0], ts_item);
        assert_eq!(out[1], bigram(a, b));
        assert_eq!(out[2], c);

        // exactness: unpacking the grams reproduces the emitted sequence as
        // a set
        let mut covered = Vec::new();
        for &g in &out {
            if is_bigram(g) {
                let (x, y) = bigram_items(g);
                covered.push(x);
                covered.push(y);
            } else {
                covered.push(g);
            }
        }
        covered.sort_unstable();
        let mut expected = vec![ts_item, a, b, c];
        expected.sort_unstable();
        assert_eq!(covered, expected);
    }

    #[test]
    fn delta_pairs_into_the_first_bigram_when_retained() {
        let a = make_item(1, 7);
        let ts_item = (50u64) << 8;
        let mut gram_freqs = HashMap::new();
        gram_freqs.insert(ts_item, 5);
        gram_freqs.insert(a, 5);
        gram_freqs.insert(bigram(ts_item, a), 4);

        let ev = rec(0, 0, 0, 50 << 8);
        let mut bufs = GramBufs::new();
        let mut out = Vec::new();
        choose_grams(&[a], &gram_freqs, &mut bufs, &mut out, &ev);

        assert_eq!(out, vec![bigram(ts_item, a)]);
    }

    #[test]
    fn invalid_event_yields_no_grams() {
        let ev = rec(0, 0, 0, 1);
        let mut bufs = GramBufs::new();
        let mut out = vec![1, 2, 3];
        choose_grams(&[], &HashMap::new(), &mut bufs, &mut out, &ev);
        assert!(out.is_empty());
    }
}
