//! Canonical Huffman coding over grams, with escape-coded literals for
//! symbols outside the codebook.
//!
//! Codebook file format (little-endian):
//!
//! ```text
//! num_entries: u32
//! entries, sorted by gram:
//!   gram:        u64
//!   code:        u32    // transmit order: first bit written is bit 0
//!   code_length: u8
//! ```
//!
//! The escape symbol is an ordinary entry keyed by the reserved gram
//! `u64::MAX`. In the trail stream it announces one literal item: 8 field
//! bits, then as many value bits as the field-stats table says that field
//! needs.

use std::collections::HashMap;

use bytes::Bytes;

use crate::bits::write_bits;
use crate::error::EncodeError;
use crate::event::{item_field, item_val, Item};
use crate::gram::{bigram_items, is_bigram, Gram};

/// Reserved gram marking "literal follows" in the encoded stream.
pub const ESCAPE_GRAM: Gram = u64::MAX;

/// At most this many grams receive Huffman codes; the tail rides the escape.
pub const CODEBOOK_MAX_SYMBOLS: usize = 65536;

/// Hard cap on code length. The codebook stores lengths in one byte and
/// decoders accumulate codes in a `u32`.
pub const MAX_CODE_LENGTH: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HuffCode {
    pub code: u32,
    pub length: u8,
}

/// Prefix code over grams, escape symbol included.
pub struct CodeMap {
    codes: HashMap<Gram, HuffCode>,
}

impl CodeMap {
    pub fn get(&self, gram: Gram) -> Option<HuffCode> {
        self.codes.get(&gram).copied()
    }

    pub fn escape(&self) -> HuffCode {
        self.codes[&ESCAPE_GRAM]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gram, HuffCode)> + '_ {
        self.codes.iter().map(|(&g, &c)| (g, c))
    }
}

/// Per-field bit widths for literal values.
pub struct FieldStats {
    bits: Vec<u8>,
}

impl FieldStats {
    pub fn bits(&self, field: u8) -> u32 {
        u32::from(self.bits[field as usize])
    }
}

/// Width of the timestamp field comes from the largest delta seen while
/// grouping; every other field is bounded by its cardinality.
pub fn field_stats(
    field_cardinalities: &[u64],
    num_fields: u32,
    max_timestamp_delta: u32,
) -> FieldStats {
    let mut bits = Vec::with_capacity(num_fields as usize);
    for field in 0..num_fields as usize {
        let max_val = if field == 0 {
            u64::from(max_timestamp_delta)
        } else {
            field_cardinalities[field]
        };
        bits.push(width(max_val));
    }
    FieldStats { bits }
}

fn width(max_val: u64) -> u8 {
    if max_val == 0 {
        1
    } else {
        (64 - max_val.leading_zeros()) as u8
    }
}

/// Build a canonical prefix code over `gram_freqs`.
///
/// The top [`CODEBOOK_MAX_SYMBOLS`] grams by frequency get codes; the
/// excluded mass is folded into the escape symbol. Ties break on the gram
/// value everywhere, so identical inputs always produce identical codes.
pub fn build_codemap(gram_freqs: &HashMap<Gram, u64>) -> Result<CodeMap, EncodeError> {
    if gram_freqs.is_empty() {
        return Err(EncodeError::Codebook("no grams to encode".into()));
    }

    let mut symbols: Vec<(Gram, u64)> = gram_freqs.iter().map(|(&g, &f)| (g, f)).collect();
    symbols.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let excluded: u64 = symbols
        .iter()
        .skip(CODEBOOK_MAX_SYMBOLS)
        .map(|&(_, f)| f)
        .sum();
    symbols.truncate(CODEBOOK_MAX_SYMBOLS);
    symbols.push((ESCAPE_GRAM, excluded + 1));

    // ascending frequency order for the two-queue length pass
    symbols.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut weights: Vec<u64> = symbols.iter().map(|&(_, f)| f).collect();
    let lengths = loop {
        let lengths = code_lengths(&weights);
        if lengths.iter().all(|&l| l <= MAX_CODE_LENGTH) {
            break lengths;
        }
        // flatten the distribution until the longest code fits; with all
        // weights equal the tree is balanced, so this terminates
        for w in weights.iter_mut() {
            *w = *w / 2 + 1;
        }
    };

    // canonical assignment in (length, gram) order
    let mut ordered: Vec<(u8, Gram)> = symbols
        .iter()
        .zip(lengths.iter())
        .map(|(&(g, _), &l)| (l, g))
        .collect();
    ordered.sort_unstable();

    let mut codes = HashMap::with_capacity(ordered.len());
    let mut next_code = 0u32;
    let mut prev_len = 0u8;
    for (length, gram) in ordered {
        next_code <<= length - prev_len;
        codes.insert(gram, HuffCode { code: transmit_order(next_code, length), length });
        next_code += 1;
        prev_len = length;
    }
    Ok(CodeMap { codes })
}

/// Huffman code lengths for `weights`, which must be sorted ascending.
fn code_lengths(weights: &[u64]) -> Vec<u8> {
    let n = weights.len();
    if n == 1 {
        return vec![1];
    }

    // two-queue merge: leaves are pre-sorted, internal nodes are created in
    // nondecreasing weight order, so two cursors replace a heap
    let total = 2 * n - 1;
    let mut weight: Vec<u64> = Vec::with_capacity(total);
    weight.extend_from_slice(weights);
    let mut parent: Vec<usize> = vec![usize::MAX; n];
    let mut next_leaf = 0usize;
    let mut next_node = n;

    while weight.len() < total {
        let mut take = |weight: &[u64]| {
            // on ties prefer the leaf, keeping the choice deterministic
            if next_leaf < n
                && (next_node >= weight.len() || weight[next_leaf] <= weight[next_node])
            {
                let i = next_leaf;
                next_leaf += 1;
                i
            } else {
                let i = next_node;
                next_node += 1;
                i
            }
        };
        let a = take(&weight);
        let b = take(&weight);
        let merged = weight[a] + weight[b];
        weight.push(merged);
        parent.push(usize::MAX);
        let top = weight.len() - 1;
        parent[a] = top;
        parent[b] = top;
    }

    let mut lengths = vec![0u8; n];
    for i in 0..n {
        let mut depth = 0u32;
        let mut p = parent[i];
        while p != usize::MAX {
            depth += 1;
            p = parent[p];
        }
        lengths[i] = depth.min(255) as u8;
    }
    lengths
}

/// Reverse the low `length` bits so the canonical code's most significant
/// bit is the first bit written to the LSB-first stream.
fn transmit_order(code: u32, length: u8) -> u32 {
    code.reverse_bits() >> (32 - u32::from(length))
}

/// Huffman-encode one event's grams into `buf` at bit offset `offs`.
///
/// Grams outside the codebook are written as escaped literals, one per
/// item; a bigram that missed the codebook degrades to two literals. Bit
/// offsets stay below 2^32 for any single trail, which is what sizes the
/// caller's buffer.
pub fn huff_encode_grams(
    codemap: &CodeMap,
    grams: &[Gram],
    buf: &mut [u8],
    offs: &mut u64,
    fstats: &FieldStats,
) {
    for &gram in grams {
        match codemap.get(gram) {
            Some(code) => {
                write_bits(buf, *offs, u64::from(code.code), u32::from(code.length));
                *offs += u64::from(code.length);
            }
            None if is_bigram(gram) => {
                let (a, b) = bigram_items(gram);
                encode_literal(codemap, buf, offs, fstats, a);
                encode_literal(codemap, buf, offs, fstats, b);
            }
            None => encode_literal(codemap, buf, offs, fstats, gram),
        }
    }
    debug_assert!(*offs < u64::from(u32::MAX));
}

fn encode_literal(
    codemap: &CodeMap,
    buf: &mut [u8],
    offs: &mut u64,
    fstats: &FieldStats,
    item: Item,
) {
    let escape = codemap.escape();
    write_bits(buf, *offs, u64::from(escape.code), u32::from(escape.length));
    *offs += u64::from(escape.length);

    let field = item_field(item);
    write_bits(buf, *offs, u64::from(field), 8);
    *offs += 8;

    let value_bits = fstats.bits(field);
    debug_assert!(value_bits == 64 || u64::from(item_val(item)) >> value_bits == 0);
    write_bits(buf, *offs, u64::from(item_val(item)), value_bits);
    *offs += u64::from(value_bits);
}

/// Serialize the codebook to its on-disk form.
pub fn serialize_codebook(codemap: &CodeMap) -> Bytes {
    let mut entries: Vec<(Gram, HuffCode)> = codemap.iter().collect();
    entries.sort_by_key(|&(g, _)| g);

    let mut buf = Vec::with_capacity(4 + entries.len() * 13);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (gram, code) in entries {
        buf.extend_from_slice(&gram.to_le_bytes());
        buf.extend_from_slice(&code.code.to_le_bytes());
        buf.push(code.length);
    }
    Bytes::from(buf)
}
