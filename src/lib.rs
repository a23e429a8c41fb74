// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A proxy-side tree cache for Path ORAM.
//!
//! A Path ORAM proxy serves every logical access by reading and writing one root-to-leaf
//! path of a remote binary tree of buckets. This crate implements the part of the proxy
//! that keeps a partially materialized mirror of that tree in memory (the [`Subtree`]),
//! together with the auxiliary [`Stash`] and the block, bucket and path primitives they
//! are built from.
//!
//! The subtree is a shared, internally synchronized object: request workers merge fetched
//! paths into it with [`Subtree::add_path`] and look blocks up with
//! [`Subtree::get_bucket_with_block`], while a write-back task reads paths back with
//! [`Subtree::get_path`] and prunes stale nodes with [`Subtree::delete_nodes`].

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::num::TryFromIntError;
use thiserror::Error;

pub mod bucket;
pub mod database;
pub mod path;
pub mod profiler;
pub mod stash;
pub mod subtree;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use crate::bucket::{Block, Bucket};
pub use crate::path::{CachedPath, Path};
pub use crate::profiler::{LatencyProfiler, Profiler};
pub use crate::stash::Stash;
pub use crate::subtree::{BucketHandle, Subtree, SubtreeConfig, SubtreeNode};

/// The numeric type used to specify the size of a block payload in bytes.
pub type BlockSize = usize;

/// The numeric type used to specify the number of blocks per bucket.
pub type BucketSize = usize;

/// The identifier of a block. Negative values never name a real block.
pub type BlockId = i64;

/// Identifies a root-to-leaf path; valid identifiers lie in `[0, 2^height)`.
pub type PathId = u64;

/// A logical (not wall-clock) update time, supplied by the caller.
pub type Timestamp = u64;

/// The height of the ORAM tree, i.e. the depth of its leaves.
pub type TreeHeight = u32;

/// The identifier carried by empty bucket slots.
pub const EMPTY_BLOCK_ID: BlockId = -1;

/// The number of bytes preceding the payload in a serialized block.
pub const BLOCK_META_DATA_SIZE: usize = 8;

/// The payload size used by the proxy unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: BlockSize = 4096;

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket; typical values are 3 or 4.
/// Here we adopt the more conservative setting of 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

/// Path identifiers are `u64`s and the cache records the direction bits of a path in them,
/// so heights are bounded well below 64.
pub const MAXIMUM_TREE_HEIGHT: TreeHeight = 62;

/// Errors that can be returned by the cache and its collaborators.
#[derive(Error, Debug)]
pub enum OramError {
    /// Tried to build a cache or store with an unusable shape.
    #[error("Invalid configuration")]
    InvalidConfigurationError,

    /// A path handed to the cache does not contain one bucket per tree level.
    #[error("Incomplete path: expected {expected} buckets, found {actual}")]
    IncompletePath {
        /// The number of buckets a full path has.
        expected: usize,
        /// The number of buckets the path actually has.
        actual: usize,
    },

    /// A path identifier does not address a leaf of the tree.
    #[error("Path identifier {path_id} is out of range for a tree of height {height}")]
    PathIdOutOfRange {
        /// The offending identifier.
        path_id: PathId,
        /// The height of the tree.
        height: TreeHeight,
    },

    /// Tried to access a store address that does not exist.
    #[error("Attempted to access an out-of-bounds address")]
    AddressOutOfBoundsError,

    /// Errors arising from conversions between integer types.
    #[error("Arithmetic error encountered")]
    IntegerConversionError(#[from] TryFromIntError),

    /// The latency histogram could not be set up.
    #[error("Could not create a latency histogram: {0:?}")]
    HistogramCreationError(hdrhistogram::CreationError),

    /// Errors arising from writing reports.
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}
