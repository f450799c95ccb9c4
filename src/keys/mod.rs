//! Key Model
//!
//! Ordered byte-string keys and half-open key ranges, the foundation every
//! other subsystem routes by.
//!
//! ## Core Concepts
//! - **Key**: an immutable byte sequence ordered byte-lexicographically.
//!   [`Key::ZERO`] (the empty key) is the minimum of the order.
//! - **KeyRange**: a `[begin, end)` slice of the key space with independently
//!   open/closed bounds on each side; [`KeyRange::EMPTY`] is a sentinel
//!   distinct from every real range.

pub mod types;

pub use types::{Bound, Key, KeyRange};
