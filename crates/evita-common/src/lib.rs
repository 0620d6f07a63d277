//! Shared building blocks for the evita query engine.
//!
//! This crate holds the pieces that have no dependency on bitmaps, caches or
//! sorting but that several engine layers agree on:
//!
//! - `hash`: seeded, process-stable 64-bit hashing used for formula content
//!   hashes, transactional identity hashes and cache record keys.
//! - `fixed_point`: conversion of decimal literals into the fixed-point
//!   integer form the price and attribute indexes store.
//! - `page_expr`: the boolean `$pageNumber` expressions attached to
//!   conditional pagination gaps.

pub mod fixed_point;
pub mod hash;
pub mod page_expr;

pub use fixed_point::{from_fixed_point, to_fixed_point, FixedPointError};
pub use hash::{hash_longs, hash_str, hash_unordered_longs, ContentHasher};
pub use page_expr::{ExprError, PageExpression};
