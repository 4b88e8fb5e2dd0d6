//! Compact, immutable on-disk encoding of per-actor event trails.
//!
//! The encoder takes a packed event graph (per-actor back-linked chains of
//! timestamped `(field, value)` events) and produces three artifacts under
//! a root directory: a bit-packed trails file with a per-actor TOC, a
//! corpus-wide Huffman codebook, and a one-line metadata file.
//!
//! Compression comes from three layers: timestamps are delta-encoded per
//! actor, items are edge-encoded (only fields whose value changed are
//! stored), and the residual stream of unigrams and co-occurrence bigrams
//! is entropy-coded against a shared codebook.

pub mod bits;
pub mod edge;
pub mod encode;
pub mod error;
pub mod event;
pub mod gram;
pub mod group;
pub mod huffman;

pub use encode::encode;
pub use error::EncodeError;
pub use event::{Event, EventGraph};
