//! vup-chunks: fixed-size block layout, oracle-checked reads, and content hashing
//!
//! # Overview
//! - `layout`: the block chunker; the size sequence every block is checked against
//! - `reader`: windowed file reader enforcing that sequence byte-for-byte
//! - `digest`: whole-file SHA-1 folded block by block in index order
//! - `blake3`: ciphertext content hashes

pub mod blake3;
pub mod digest;
pub mod error;
pub mod layout;
pub mod reader;

pub use blake3::{hash_bytes, hash_from_hex, hash_to_hex, Hash};
pub use digest::DigestAccumulator;
pub use error::{ChunkError, IntegrityError};
pub use layout::{block_sizes, check_layout};
pub use reader::{BlockReader, RawBlock};
