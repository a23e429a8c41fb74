// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block and bucket structures for the ORAM tree.

use crate::{BlockId, BlockSize, BucketSize, Timestamp, BLOCK_META_DATA_SIZE, EMPTY_BLOCK_ID};
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};

#[derive(Clone, Copy, PartialEq, Eq)]
/// A block of `B` opaque payload bytes tagged with its identifier.
pub struct Block<const B: BlockSize> {
    id: BlockId,
    data: [u8; B],
}

impl<const B: BlockSize> Block<B> {
    /// The length of a serialized block.
    pub const SERIALIZED_SIZE: usize = BLOCK_META_DATA_SIZE + B;

    /// An empty slot: identifier `EMPTY_BLOCK_ID` and a zeroed payload.
    pub fn empty() -> Self {
        Self::new(EMPTY_BLOCK_ID)
    }

    /// A block with identifier `id` and a zeroed payload.
    pub fn new(id: BlockId) -> Self {
        Self { id, data: [0u8; B] }
    }

    /// A block with identifier `id` holding `data`.
    pub fn with_data(id: BlockId, data: [u8; B]) -> Self {
        Self { id, data }
    }

    /// Parses `bytes` as an identifier followed by a payload.
    ///
    /// Buffers too short to hold a whole block decode to [`Block::empty`]; bytes past the
    /// payload are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let Some(id_bytes) = bytes
            .get(..BLOCK_META_DATA_SIZE)
            .and_then(|b| <[u8; BLOCK_META_DATA_SIZE]>::try_from(b).ok())
        else {
            log::trace!("Block::from_bytes -- short metadata ({} bytes)", bytes.len());
            return Self::empty();
        };
        let Some(data) = bytes
            .get(BLOCK_META_DATA_SIZE..Self::SERIALIZED_SIZE)
            .and_then(|b| <[u8; B]>::try_from(b).ok())
        else {
            log::trace!("Block::from_bytes -- short payload ({} bytes)", bytes.len());
            return Self::empty();
        };
        Self {
            id: BlockId::from_be_bytes(id_bytes),
            data,
        }
    }

    /// Serializes the block as its big-endian identifier followed by its payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(Self::SERIALIZED_SIZE);
        result.extend_from_slice(&self.id.to_be_bytes());
        result.extend_from_slice(&self.data);
        result
    }

    /// The identifier of this block.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Changes the identifier of this block.
    pub fn set_id(&mut self, id: BlockId) {
        self.id = id;
    }

    /// A copy of the payload.
    pub fn data(&self) -> [u8; B] {
        self.data
    }

    /// Overwrites the whole payload.
    pub fn set_data(&mut self, data: &[u8; B]) {
        self.data = *data;
    }

    /// Whether this block is an empty slot.
    pub fn is_empty(&self) -> bool {
        self.id == EMPTY_BLOCK_ID
    }
}

impl<const B: BlockSize> Default for Block<B> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const B: BlockSize> std::fmt::Debug for Block<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Block::Empty")
        } else {
            f.debug_struct("Block")
                .field("id", &self.id)
                .field("data", &&self.data[..B.min(8)])
                .finish()
        }
    }
}

impl<const B: BlockSize> Distribution<Block<B>> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Block<B> {
        let mut result = Block::new(rng.gen_range(0..BlockId::MAX));
        for byte in result.data.iter_mut() {
            *byte = rng.gen();
        }
        result
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
/// A bucket of the ORAM tree: `Z` block slots and the logical time of its last update.
pub struct Bucket<const B: BlockSize, const Z: BucketSize> {
    blocks: [Block<B>; Z],
    update_time: Timestamp,
}

impl<const B: BlockSize, const Z: BucketSize> Bucket<B, Z> {
    /// Builds a bucket from up to `Z` blocks; returns `None` if there are more.
    pub fn from_blocks<I: IntoIterator<Item = Block<B>>>(blocks: I) -> Option<Self> {
        let mut result = Self::default();
        for block in blocks {
            if !result.add_block(block) {
                return None;
            }
        }
        Some(result)
    }

    /// The non-empty blocks of this bucket, in slot order.
    pub fn filled_blocks(&self) -> Vec<Block<B>> {
        self.blocks.iter().filter(|b| !b.is_empty()).copied().collect()
    }

    /// The identifiers of the non-empty blocks of this bucket.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().filter(|b| !b.is_empty()).map(Block::id)
    }

    /// Stores `block`, replacing a block with the same identifier or taking the first free slot.
    /// Returns `false` if the bucket is full.
    pub fn add_block(&mut self, block: Block<B>) -> bool {
        if block.is_empty() {
            return true;
        }
        if let Some(slot) = self.blocks.iter_mut().find(|b| b.id() == block.id()) {
            *slot = block;
            return true;
        }
        match self.blocks.iter_mut().find(|b| b.is_empty()) {
            Some(slot) => {
                *slot = block;
                true
            }
            None => false,
        }
    }

    /// Removes and returns the block with identifier `id`.
    pub fn remove_block(&mut self, id: BlockId) -> Option<Block<B>> {
        if id == EMPTY_BLOCK_ID {
            return None;
        }
        let slot = self.blocks.iter_mut().find(|b| b.id() == id)?;
        Some(std::mem::take(slot))
    }

    /// The block with identifier `id`, if this bucket holds it.
    pub fn get_block(&self, id: BlockId) -> Option<&Block<B>> {
        if id == EMPTY_BLOCK_ID {
            return None;
        }
        self.blocks.iter().find(|b| b.id() == id)
    }

    /// Whether this bucket holds a block with identifier `id`.
    pub fn contains(&self, id: BlockId) -> bool {
        self.get_block(id).is_some()
    }

    /// Whether every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.blocks.iter().all(|b| !b.is_empty())
    }

    /// Empties every slot. The update time is kept.
    pub fn clear(&mut self) {
        self.blocks = [Block::empty(); Z];
    }

    /// The logical time of the last update.
    pub fn update_time(&self) -> Timestamp {
        self.update_time
    }

    /// Records a new update time.
    pub fn set_update_time(&mut self, timestamp: Timestamp) {
        self.update_time = timestamp;
    }
}

impl<const B: BlockSize, const Z: BucketSize> Default for Bucket<B, Z> {
    fn default() -> Self {
        Self {
            blocks: [Block::empty(); Z],
            update_time: 0,
        }
    }
}

impl<const B: BlockSize, const Z: BucketSize> std::fmt::Debug for Bucket<B, Z> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.blocks.iter().all(Block::is_empty) {
            write!(f, "Bucket::Empty(t = {})", self.update_time)
        } else {
            f.debug_struct("Bucket")
                .field("blocks", &self.filled_blocks())
                .field("update_time", &self.update_time)
                .finish()
        }
    }
}
