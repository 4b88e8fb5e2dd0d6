//! Event grouping: per-actor collection, time sort, delta encoding.
//!
//! The input represents each actor's trail as a reverse-linked list anchored
//! at the last event. Grouping materializes the forward order once and
//! spills it to the grouped temp file, so later passes never revisit the
//! back-links.

use std::io::Write;
use std::path::Path;

use crate::error::EncodeError;
use crate::event::{Event, GroupedRecord};

/// Upper bound on the invalid-to-total record ratio before the encode is
/// rejected outright.
pub const MAX_INVALID_RATIO: f64 = 0.005;

/// Exclusive bound on a timestamp delta (24 bits, about 194 days). Data is
/// expected to be partitioned by time; a larger delta marks the record
/// invalid rather than failing the whole encode.
pub const MAX_TIMESTAMP_DELTA: u32 = 1 << 24;

/// Scan the flat event array for the timestamp range. Empty input yields
/// `(u32::MAX, 0)`; callers pass non-empty input.
pub fn timestamp_range(events: &[Event]) -> (u32, u32) {
    let mut min = u32::MAX;
    let mut max = 0;
    for ev in events {
        if ev.timestamp < min {
            min = ev.timestamp;
        }
        if ev.timestamp > max {
            max = ev.timestamp;
        }
    }
    (min, max)
}

pub struct GroupStats {
    pub max_timestamp_delta: u32,
    pub num_invalid: u64,
    pub num_records: u64,
}

/// Group events by actor, sort each actor's events by time, delta-encode
/// timestamps against `base_timestamp`, and spill the records to `sink` in
/// actor order.
///
/// Fails with `TooManyInvalid` when the invalid ratio over all written
/// records exceeds [`MAX_INVALID_RATIO`].
pub fn group_events<W: Write>(
    sink: &mut W,
    path: &Path,
    events: &[Event],
    cookie_pointers: &[u64],
    base_timestamp: u32,
) -> Result<GroupStats, EncodeError> {
    let mut buf: Vec<GroupedRecord> = Vec::new();
    let mut rec = [0u8; GroupedRecord::SIZE];
    let mut max_timestamp_delta = 0u32;
    let mut num_invalid = 0u64;
    let mut num_records = 0u64;

    for (cookie_id, &last) in cookie_pointers.iter().enumerate() {
        // walk the back-link chain; prev_event_idx is biased by one so that
        // zero terminates
        buf.clear();
        let mut idx = last as usize;
        loop {
            let ev = &events[idx];
            buf.push(GroupedRecord {
                cookie_id: cookie_id as u32,
                item_zero: ev.item_zero,
                num_items: ev.num_items,
                timestamp: ev.timestamp,
            });
            if ev.prev_event_idx == 0 {
                break;
            }
            idx = (ev.prev_event_idx - 1) as usize;
        }

        // stable: equal timestamps keep walk order
        buf.sort_by_key(|r| r.timestamp);

        let mut prev_timestamp = base_timestamp;
        for r in buf.iter_mut() {
            let ts = r.timestamp;
            let delta = ts - prev_timestamp;
            if delta < MAX_TIMESTAMP_DELTA {
                if delta > max_timestamp_delta {
                    max_timestamp_delta = delta;
                }
                r.timestamp = delta << 8;
                prev_timestamp = ts;
            } else {
                r.timestamp = 1;
                num_invalid += 1;
            }
        }

        for r in &buf {
            r.write_to(&mut rec);
            sink.write_all(&rec).map_err(|e| EncodeError::io(path, e))?;
        }
        num_records += buf.len() as u64;
    }

    if num_records > 0 && num_invalid as f64 / num_records as f64 > MAX_INVALID_RATIO {
        return Err(EncodeError::TooManyInvalid { invalid: num_invalid, total: num_records });
    }

    Ok(GroupStats { max_timestamp_delta, num_invalid, num_records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncodeError;

    fn ev(timestamp: u32, prev_event_idx: u64) -> Event {
        Event { timestamp, item_zero: 0, num_items: 0, prev_event_idx }
    }

    fn records(bytes: &[u8]) -> Vec<GroupedRecord> {
        let mut out = Vec::new();
        let mut cursor = bytes;
        while let Some(r) = GroupedRecord::read(&mut cursor).unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn range_over_events() {
        let events = vec![ev(30, 0), ev(10, 0), ev(20, 0)];
        assert_eq!(timestamp_range(&events), (10, 30));
    }

    #[test]
    fn range_of_empty_input() {
        assert_eq!(timestamp_range(&[]), (u32::MAX, 0));
    }

    #[test]
    fn sorts_and_delta_encodes_one_actor() {
        // insertion order 200, 150, 150; chain anchored at the last event
        let events = vec![ev(200, 0), ev(150, 1), ev(150, 2)];
        let mut sink = Vec::new();
        let stats =
            group_events(&mut sink, Path::new("test"), &events, &[2], 150).unwrap();

        let recs = records(&sink);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].timestamp, 0);
        assert_eq!(recs[1].timestamp, 0);
        assert_eq!(recs[2].timestamp, 50 << 8);
        assert!(recs.iter().all(|r| r.is_valid()));
        assert_eq!(stats.max_timestamp_delta, 50);
        assert_eq!(stats.num_invalid, 0);
        assert_eq!(stats.num_records, 3);
    }

    #[test]
    fn equal_timestamps_keep_walk_order() {
        // both events at t=5; the walk visits index 1 then index 0
        let mut events = vec![ev(5, 0), ev(5, 1)];
        events[0].item_zero = 10;
        events[1].item_zero = 20;
        let mut sink = Vec::new();
        group_events(&mut sink, Path::new("test"), &events, &[1], 5).unwrap();

        let recs = records(&sink);
        assert_eq!(recs[0].item_zero, 20);
        assert_eq!(recs[1].item_zero, 10);
    }

    #[test]
    fn interleaved_actors_group_contiguously() {
        // actor 0: indices 0, 2; actor 1: indices 1, 3
        let events = vec![ev(10, 0), ev(11, 0), ev(12, 1), ev(13, 2)];
        let mut sink = Vec::new();
        group_events(&mut sink, Path::new("test"), &events, &[2, 3], 10).unwrap();

        let recs = records(&sink);
        assert_eq!(
            recs.iter().map(|r| r.cookie_id).collect::<Vec<_>>(),
            vec![0, 0, 1, 1]
        );
    }

    #[test]
    fn oversized_delta_marks_invalid_and_keeps_prev() {
        let events = vec![ev(0, 0), ev(1 << 25, 1), ev(100, 2)];
        let mut sink = Vec::new();
        // 1 invalid of 3 exceeds the ratio, so expect the gate to fire; the
        // spilled records are still inspectable through the sink
        let err = group_events(&mut sink, Path::new("test"), &events, &[2], 0);
        assert!(matches!(
            err,
            Err(EncodeError::TooManyInvalid { invalid: 1, total: 3 })
        ));

        let recs = records(&sink);
        // sorted: 0, 100, 1<<25; the oversized delta does not advance the
        // running timestamp
        assert_eq!(recs[0].timestamp, 0);
        assert_eq!(recs[1].timestamp, 100 << 8);
        assert_eq!(recs[2].timestamp, 1);
        assert!(!recs[2].is_valid());
    }

    #[test]
    fn gate_tolerates_rare_invalids() {
        // 1 invalid out of 300 records stays under the 0.005 ratio
        let mut events = Vec::new();
        for i in 0..299u32 {
            events.push(ev(i, i as u64));
        }
        events.push(ev(1 << 25, 299));
        let mut sink = Vec::new();
        let stats =
            group_events(&mut sink, Path::new("test"), &events, &[299], 0).unwrap();
        assert_eq!(stats.num_invalid, 1);
        assert_eq!(stats.num_records, 300);
    }
}
