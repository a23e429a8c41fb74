// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The proxy stash: blocks that are not currently placed in any cached path.

use crate::{bucket::Block, BlockId, BlockSize};
use dashmap::DashMap;

/// A concurrent table of stashed blocks, keyed by block identifier.
///
/// The stash enforces no capacity; when stashed blocks go back into the tree is up to the caller.
#[derive(Debug, Default)]
pub struct Stash<const B: BlockSize> {
    blocks: DashMap<BlockId, Block<B>>,
}

impl<const B: BlockSize> Stash<B> {
    /// An empty stash.
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
        }
    }

    /// Stashes `block`, replacing any stashed block with the same identifier.
    pub fn add_block(&self, block: Block<B>) {
        if block.is_empty() {
            return;
        }
        log::trace!("Stash::add_block -- {}", block.id());
        self.blocks.insert(block.id(), block);
    }

    /// A copy of the stashed block with identifier `id`.
    pub fn get_block(&self, id: BlockId) -> Option<Block<B>> {
        self.blocks.get(&id).map(|entry| *entry.value())
    }

    /// Removes the stashed block with identifier `id`.
    pub fn remove_block(&self, id: BlockId) -> Option<Block<B>> {
        self.blocks.remove(&id).map(|(_, block)| block)
    }

    /// A snapshot of every stashed block, in no particular order.
    pub fn all_blocks(&self) -> Vec<Block<B>> {
        self.blocks.iter().map(|entry| *entry.value()).collect()
    }

    /// The number of stashed blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the stash holds no block.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
