//! PocketLang Core: buffers and low-level utilities
//!
//! This crate is the bottom layer of PocketLang: it knows nothing about
//! `Value`, heap objects, or bytecode, only the growable containers and
//! bit tricks that the layers above build on:
//!
//! - `buffer`: generic growable arrays with power-of-two capacity growth
//! - `hash`: FNV-1a byte hashing, used for string hashes and map slots
//! - `pow2`: power-of-two ceiling, used to size stacks and buffers
//! - `utf8`: UTF-8 encode/decode helpers for source text and string literals

pub mod buffer;
pub mod hash;
pub mod pow2;
pub mod utf8;

pub use buffer::Buffer;
pub use hash::fnv1a;
pub use pow2::ceil_pow2;
