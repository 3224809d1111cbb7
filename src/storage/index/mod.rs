//! Extendible hash index (L5).

pub mod hash;

pub use hash::{HashIndex, HASH_BUCKET_SIZE, MAIN_BUCKET_SIZE};
