//! The encoder pipeline: grouping, statistics, trail emission, metadata.
//!
//! Output layout under the root directory:
//!
//! ```text
//! info             one ASCII line: cookies events min_ts max_ts max_delta
//! trails.data      TOC of (num_cookies + 1) little-endian u32 byte
//!                  offsets, then concatenated bit-packed trails
//! trails.codebook  serialized Huffman codebook
//! ```
//!
//! Each trail is an LSB-first bit stream. The leading 3 bits hold the
//! length residual: how many bits of the last byte are padding. After that
//! come the Huffman-coded grams, one group per event, the first gram of
//! each group carrying the timestamp delta.
//!
//! The grouped temp file is streamed three times (unigrams, bigrams,
//! trails). That keeps peak memory proportional to the frequency maps
//! rather than to the event count.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::bits::write_bits;
use crate::edge::edge_encode_items;
use crate::error::EncodeError;
use crate::event::{EventGraph, GroupedRecord, Item};
use crate::gram::{choose_grams, collect_unigrams, make_grams, Gram, GramBufs};
use crate::group::{group_events, timestamp_range};
use crate::huffman::{
    build_codemap, field_stats, huff_encode_grams, serialize_codebook, CodeMap, FieldStats,
};

/// Read-ahead on the grouped temp file, sized in whole records.
pub const READ_BUFFER_SIZE: usize = 1_000_000 * GroupedRecord::SIZE;

/// One trail's worth of Huffman output. `huff_encode_grams` keeps bit
/// offsets below 2^32, so this bound holds for any single actor. The buffer
/// is allocated once per encode and reused across actors.
const TRAIL_BUF_SIZE: usize = (u32::MAX as usize) / 8 + 8;

/// Removes the grouped temp file when the encode ends, on failure paths
/// included.
struct TempFile {
    path: PathBuf,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Encode an event graph into `info`, `trails.data`, and `trails.codebook`
/// under `root`. Consumes the graph; the event array is released as soon as
/// grouping has spilled to disk.
pub fn encode(graph: EventGraph, root: &Path) -> Result<(), EncodeError> {
    let EventGraph {
        events,
        items,
        cookie_pointers,
        num_fields,
        field_cardinalities,
    } = graph;
    let num_events = events.len() as u64;
    let num_cookies = cookie_pointers.len() as u64;

    let started = Instant::now();
    let (min_timestamp, max_timestamp) = timestamp_range(&events);
    debug!(elapsed = ?started.elapsed(), min_timestamp, max_timestamp, "timestamp range");

    let grouped_path = root.join(format!("tmp.grouped.{}", std::process::id()));
    let _cleanup = TempFile { path: grouped_path.clone() };

    let phase = Instant::now();
    let grouped_w =
        File::create(&grouped_path).map_err(|e| EncodeError::io(&grouped_path, e))?;
    let mut sink = BufWriter::new(grouped_w);
    let stats = group_events(&mut sink, &grouped_path, &events, &cookie_pointers, min_timestamp)?;
    sink.flush().map_err(|e| EncodeError::io(&grouped_path, e))?;
    drop(sink);
    debug!(elapsed = ?phase.elapsed(), invalid = stats.num_invalid, "grouped events");

    // the event array dominates memory and is fully spilled now
    drop(events);
    drop(cookie_pointers);

    store_info(
        root,
        num_cookies,
        num_events,
        min_timestamp,
        max_timestamp,
        stats.max_timestamp_delta,
    )?;

    let grouped_r =
        File::open(&grouped_path).map_err(|e| EncodeError::io(&grouped_path, e))?;
    let mut grouped = BufReader::with_capacity(READ_BUFFER_SIZE, grouped_r);

    let phase = Instant::now();
    let unigram_freqs = collect_unigrams(&mut grouped, &items, num_fields)
        .map_err(|e| EncodeError::io(&grouped_path, e))?;
    debug!(elapsed = ?phase.elapsed(), unigrams = unigram_freqs.len(), "collected unigrams");

    grouped.rewind().map_err(|e| EncodeError::io(&grouped_path, e))?;
    let phase = Instant::now();
    let gram_freqs = make_grams(&mut grouped, &items, num_fields, &unigram_freqs)
        .map_err(|e| EncodeError::io(&grouped_path, e))?;
    debug!(elapsed = ?phase.elapsed(), grams = gram_freqs.len(), "built grams");

    let phase = Instant::now();
    let codemap = build_codemap(&gram_freqs)?;
    let fstats = field_stats(&field_cardinalities, num_fields, stats.max_timestamp_delta);
    debug!(elapsed = ?phase.elapsed(), codes = codemap.len(), "built codebook");

    grouped.rewind().map_err(|e| EncodeError::io(&grouped_path, e))?;
    let phase = Instant::now();
    let trails_path = root.join("trails.data");
    encode_trails(
        &mut grouped,
        &items,
        num_cookies,
        num_fields,
        &codemap,
        &gram_freqs,
        &fstats,
        &trails_path,
    )?;
    debug!(elapsed = ?phase.elapsed(), "wrote trails");

    store_codebook(root, &codemap)?;

    info!(
        num_cookies,
        num_events,
        elapsed = ?started.elapsed(),
        "encode complete"
    );
    Ok(())
}

/// Write the metadata line.
fn store_info(
    root: &Path,
    num_cookies: u64,
    num_events: u64,
    min_timestamp: u32,
    max_timestamp: u32,
    max_timestamp_delta: u32,
) -> Result<(), EncodeError> {
    let path = root.join("info");
    let mut out = File::create(&path).map_err(|e| EncodeError::io(&path, e))?;
    writeln!(
        out,
        "{} {} {} {} {}",
        num_cookies, num_events, min_timestamp, max_timestamp, max_timestamp_delta
    )
    .map_err(|e| EncodeError::io(&path, e))?;
    Ok(())
}

fn store_codebook(root: &Path, codemap: &CodeMap) -> Result<(), EncodeError> {
    let path = root.join("trails.codebook");
    let book = serialize_codebook(codemap);
    std::fs::write(&path, &book).map_err(|e| EncodeError::io(&path, e))
}

/// Stream the grouped file and emit one bit-packed trail per actor, with a
/// TOC of byte offsets at the head of the file.
#[allow(clippy::too_many_arguments)]
fn encode_trails<R: Read>(
    grouped: &mut R,
    items: &[Item],
    num_cookies: u64,
    num_fields: u32,
    codemap: &CodeMap,
    gram_freqs: &HashMap<Gram, u64>,
    fstats: &FieldStats,
    path: &Path,
) -> Result<(), EncodeError> {
    let mut file_offs: u64 = (num_cookies + 1) * 4;
    if file_offs >= u64::from(u32::MAX) {
        return Err(EncodeError::TrailsTooLarge { offset: file_offs });
    }

    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| EncodeError::io(path, e))?;

    let mut buf = vec![0u8; TRAIL_BUF_SIZE];
    let mut prev_items = vec![0u64; num_fields as usize];
    let mut encoded: Vec<Item> = Vec::new();
    let mut grams: Vec<Gram> = Vec::new();
    let mut gbufs = GramBufs::new();

    let mut pending = GroupedRecord::read(grouped).map_err(|e| EncodeError::io(path, e))?;
    while let Some(first) = pending {
        let cookie_id = first.cookie_id;

        // the leading 3 bits are reserved for the length residual
        let mut offs: u64 = 3;

        out.seek(SeekFrom::Start(u64::from(cookie_id) * 4))
            .map_err(|e| EncodeError::io(path, e))?;
        out.write_all(&(file_offs as u32).to_le_bytes())
            .map_err(|e| EncodeError::io(path, e))?;

        prev_items.fill(0);

        let mut ev = first;
        loop {
            edge_encode_items(items, &mut prev_items, &mut encoded, &ev);
            choose_grams(&encoded, gram_freqs, &mut gbufs, &mut grams, &ev);
            huff_encode_grams(codemap, &grams, &mut buf, &mut offs, fstats);

            pending = GroupedRecord::read(grouped).map_err(|e| EncodeError::io(path, e))?;
            match pending {
                Some(next) if next.cookie_id == cookie_id => ev = next,
                _ => break,
            }
        }

        // the last byte may be short; record how many of its bits to ignore
        let trail_size = if offs % 8 != 0 {
            write_bits(&mut buf, 0, 8 - offs % 8, 3);
            offs / 8 + 1
        } else {
            offs / 8
        };

        out.seek(SeekFrom::Start(file_offs))
            .map_err(|e| EncodeError::io(path, e))?;
        out.write_all(&buf[..trail_size as usize])
            .map_err(|e| EncodeError::io(path, e))?;
        buf[..trail_size as usize].fill(0);

        file_offs += trail_size;
        if file_offs >= u64::from(u32::MAX) {
            return Err(EncodeError::TrailsTooLarge { offset: file_offs });
        }
    }

    // the redundant last slot makes toc[i + 1] - toc[i] a trail length
    out.seek(SeekFrom::Start(num_cookies * 4))
        .map_err(|e| EncodeError::io(path, e))?;
    out.write_all(&(file_offs as u32).to_le_bytes())
        .map_err(|e| EncodeError::io(path, e))?;

    Ok(())
}
