//! Key to shard mapping.

pub mod hashing;
pub mod ring;
pub mod tag;

pub use hashing::{murmur64a, Hashing};
pub use ring::{RingSnapshot, ShardNode, ShardRing, POINTS_PER_WEIGHT};
pub use tag::TagPattern;
