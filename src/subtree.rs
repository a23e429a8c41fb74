// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The proxy's partial mirror of the ORAM tree.
//!
//! The subtree holds whichever buckets of the remote tree the proxy currently caches, linked
//! as a binary tree, plus an index from block identifier to the bucket caching that block.
//!
//! ## Concurrency
//!
//! A single [`Subtree`] is shared by all request workers and the write-back task.
//!
//! - The root is read without locking. It is installed (and discarded) only while holding the
//!   root lock, and installation re-checks for an existing root inside the lock, so at most one
//!   caller ever installs it.
//! - Every child slot has its own lock. Attaching a bucket and indexing its blocks happen under
//!   that lock, as do un-indexing a bucket and severing its link, so the index never names a
//!   bucket whose attachment or removal is half done.
//! - Pruning a node severs its whole cached subtree. Every node in it is flagged as detached
//!   and refuses further attachments; a merge that raced with the removal of a node on its
//!   route starts over from the root.
//! - Pruning passes are serialized among themselves.
//!
//! Buckets are handed out as reference-counted [`BucketHandle`]s, which stay valid after the
//! node they belong to has been pruned.

use crate::{
    bucket::{Block, Bucket},
    path::{CachedPath, Path},
    utils::{check_path_id, greatest_common_level, last_level_to_save, path_directions},
    BlockId, BlockSize, BucketSize, OramError, PathId, Timestamp, TreeHeight,
    MAXIMUM_TREE_HEIGHT,
};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// A shared reference to a node of the subtree.
pub type BucketHandle<const B: BlockSize, const Z: BucketSize> = Arc<SubtreeNode<B, Z>>;

const LEFT: usize = 0;
const RIGHT: usize = 1;

fn slot(right: bool) -> usize {
    if right {
        RIGHT
    } else {
        LEFT
    }
}

/// The shape of the tree mirrored by a [`Subtree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubtreeConfig {
    tree_height: TreeHeight,
    num_partition_servers: usize,
}

impl SubtreeConfig {
    /// A tree of height `tree_height` whose buckets are spread over `num_partition_servers`
    /// servers.
    pub fn new(tree_height: TreeHeight, num_partition_servers: usize) -> Result<Self, OramError> {
        if tree_height > MAXIMUM_TREE_HEIGHT || num_partition_servers == 0 {
            return Err(OramError::InvalidConfigurationError);
        }
        Ok(Self {
            tree_height,
            num_partition_servers,
        })
    }

    /// The depth of the leaves.
    pub fn tree_height(&self) -> TreeHeight {
        self.tree_height
    }

    /// The number of servers the remote tree is split over.
    pub fn num_partition_servers(&self) -> usize {
        self.num_partition_servers
    }
}

enum Attach<const B: BlockSize, const Z: BucketSize> {
    Installed(BucketHandle<B, Z>),
    Existing(BucketHandle<B, Z>),
    Detached,
}

/// A cached bucket together with its links to its cached children.
pub struct SubtreeNode<const B: BlockSize, const Z: BucketSize> {
    bucket: RwLock<Bucket<B, Z>>,
    children: [Mutex<Option<BucketHandle<B, Z>>>; 2],
    detached: AtomicBool,
}

impl<const B: BlockSize, const Z: BucketSize> SubtreeNode<B, Z> {
    fn new_handle(mut bucket: Bucket<B, Z>, timestamp: Timestamp) -> BucketHandle<B, Z> {
        bucket.set_update_time(timestamp);
        Arc::new(Self {
            bucket: RwLock::new(bucket),
            children: [Mutex::new(None), Mutex::new(None)],
            detached: AtomicBool::new(false),
        })
    }

    /// A copy of the bucket's current contents.
    pub fn bucket(&self) -> Bucket<B, Z> {
        *self.bucket.read()
    }

    /// The non-empty blocks currently in the bucket.
    pub fn filled_blocks(&self) -> Vec<Block<B>> {
        self.bucket.read().filled_blocks()
    }

    /// A copy of the block with identifier `id`, if the bucket holds it.
    pub fn get_block(&self, id: BlockId) -> Option<Block<B>> {
        self.bucket.read().get_block(id).copied()
    }

    /// Whether the bucket holds a block with identifier `id`.
    pub fn contains(&self, id: BlockId) -> bool {
        self.bucket.read().contains(id)
    }

    /// Replaces the block with the same identifier as `block`. Returns `false`, changing nothing,
    /// if the bucket does not hold such a block or has been pruned.
    pub fn update_block(&self, block: Block<B>) -> bool {
        let mut bucket = self.bucket.write();
        if self.is_detached() || !bucket.contains(block.id()) {
            return false;
        }
        bucket.add_block(block)
    }

    /// The logical time at which this bucket was last updated.
    pub fn update_time(&self) -> Timestamp {
        self.bucket.read().update_time()
    }

    /// Records a new update time.
    pub fn set_update_time(&self, timestamp: Timestamp) {
        self.bucket.write().set_update_time(timestamp);
    }

    /// The cached left child.
    pub fn left(&self) -> Option<BucketHandle<B, Z>> {
        self.child(false)
    }

    /// The cached right child.
    pub fn right(&self) -> Option<BucketHandle<B, Z>> {
        self.child(true)
    }

    /// The cached child in direction `right`.
    pub fn child(&self, right: bool) -> Option<BucketHandle<B, Z>> {
        self.children[slot(right)].lock().clone()
    }

    /// Whether this node has been pruned from the subtree.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Installs `bucket` as the left child if there is none. Returns whether it was installed.
    pub(crate) fn set_left(&self, bucket: Bucket<B, Z>, timestamp: Timestamp) -> bool {
        matches!(
            self.attach_child(false, bucket, timestamp, |_| {}),
            Attach::Installed(_)
        )
    }

    /// Installs `bucket` as the right child if there is none. Returns whether it was installed.
    pub(crate) fn set_right(&self, bucket: Bucket<B, Z>, timestamp: Timestamp) -> bool {
        matches!(
            self.attach_child(true, bucket, timestamp, |_| {}),
            Attach::Installed(_)
        )
    }

    // `on_install` runs while the slot is still locked.
    fn attach_child<F: FnOnce(&BucketHandle<B, Z>)>(
        &self,
        right: bool,
        bucket: Bucket<B, Z>,
        timestamp: Timestamp,
        on_install: F,
    ) -> Attach<B, Z> {
        let mut child_slot = self.children[slot(right)].lock();
        if self.is_detached() {
            return Attach::Detached;
        }
        if let Some(existing) = child_slot.as_ref() {
            return Attach::Existing(existing.clone());
        }
        let child = Self::new_handle(bucket, timestamp);
        on_install(&child);
        *child_slot = Some(child.clone());
        Attach::Installed(child)
    }

    // Severs the link to `expected` if it is still the child in direction `right`.
    // `on_detach` runs while the link is still locked.
    fn detach_child<F: FnOnce(&BucketHandle<B, Z>)>(
        &self,
        right: bool,
        expected: &BucketHandle<B, Z>,
        on_detach: F,
    ) -> bool {
        let mut child_slot = self.children[slot(right)].lock();
        match child_slot.as_ref() {
            Some(child) if Arc::ptr_eq(child, expected) => {}
            _ => return false,
        }
        on_detach(expected);
        *child_slot = None;
        true
    }

    // Flags the node while both of its slots are locked, so no child can be attached after the
    // returned children were read.
    fn mark_detached(&self) -> Vec<BucketHandle<B, Z>> {
        let left = self.children[LEFT].lock();
        let right = self.children[RIGHT].lock();
        self.detached.store(true, Ordering::SeqCst);
        left.iter().chain(right.iter()).cloned().collect()
    }
}

impl<const B: BlockSize, const Z: BucketSize> std::fmt::Debug for SubtreeNode<B, Z> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtreeNode")
            .field("bucket", &self.bucket())
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

/// The proxy's partially materialized copy of the ORAM tree, with a block index.
pub struct Subtree<const B: BlockSize, const Z: BucketSize> {
    config: SubtreeConfig,
    /// Nodes at this depth or above are never pruned; `-1` when nothing is pinned.
    last_level_to_save: i64,
    root: ArcSwapOption<SubtreeNode<B, Z>>,
    root_lock: Mutex<()>,
    prune_lock: Mutex<()>,
    block_index: DashMap<BlockId, BucketHandle<B, Z>>,
}

impl<const B: BlockSize, const Z: BucketSize> Subtree<B, Z> {
    /// An empty subtree mirroring a tree of the given shape.
    pub fn new(config: SubtreeConfig) -> Self {
        log::debug!(
            "Subtree::new -- (B = {}, Z = {}, H = {}, servers = {})",
            B,
            Z,
            config.tree_height,
            config.num_partition_servers
        );
        Self {
            config,
            last_level_to_save: last_level_to_save(config.num_partition_servers),
            root: ArcSwapOption::empty(),
            root_lock: Mutex::new(()),
            prune_lock: Mutex::new(()),
            block_index: DashMap::new(),
        }
    }

    /// The shape of the mirrored tree.
    pub fn config(&self) -> &SubtreeConfig {
        &self.config
    }

    /// The deepest pinned level, or `-1` when no level is pinned.
    pub fn last_level_to_save(&self) -> i64 {
        self.last_level_to_save
    }

    /// The current root, if any.
    pub fn root(&self) -> Option<BucketHandle<B, Z>> {
        self.root.load_full()
    }

    /// Whether no bucket is cached.
    pub fn is_empty(&self) -> bool {
        self.root.load().is_none()
    }

    /// Materializes the pinned top of the tree.
    ///
    /// When the remote tree is split over several servers, every node down to
    /// `last_level_to_save` is created (empty, with update time 0) so that the top of the tree
    /// exists before any path is merged. Does nothing otherwise, or if a root already exists.
    pub fn init_root(&self) {
        if self.last_level_to_save < 0 {
            return;
        }
        log::info!("The last level to save is {}", self.last_level_to_save);

        let _guard = self.root_lock.lock();
        if self.root.load().is_some() {
            return;
        }
        let root = SubtreeNode::new_handle(Bucket::default(), 0);
        if self.last_level_to_save >= 1 {
            self.preorder_init(&root, 1);
        }
        self.root.store(Some(root));
    }

    fn preorder_init(&self, node: &BucketHandle<B, Z>, level: i64) {
        node.set_right(Bucket::default(), 0);
        node.set_left(Bucket::default(), 0);
        if level + 1 > self.last_level_to_save {
            return;
        }
        for child in [node.left(), node.right()].into_iter().flatten() {
            self.preorder_init(&child, level + 1);
        }
    }

    /// The bucket currently caching block `block_id`.
    pub fn get_bucket_with_block(&self, block_id: BlockId) -> Option<BucketHandle<B, Z>> {
        self.block_index.get(&block_id).map(|entry| entry.value().clone())
    }

    /// Points the index entry of `block_id` at `bucket`.
    pub fn map_block_to_bucket(&self, block_id: BlockId, bucket: &BucketHandle<B, Z>) {
        self.block_index.insert(block_id, bucket.clone());
    }

    /// Merges a full path fetched from the remote tree.
    ///
    /// Buckets of `path` are attached wherever the subtree has no bucket yet; those buckets get
    /// update time `timestamp` and their blocks are indexed. Positions that are already cached
    /// keep their bucket, contents and update time.
    pub fn add_path(&self, path: &Path<B, Z>, timestamp: Timestamp) -> Result<(), OramError> {
        let height = self.config.tree_height;
        check_path_id(path.path_id(), height)?;
        path.check_complete(height)?;
        log::debug!(
            "Subtree::add_path -- path {} at t = {}",
            path.path_id(),
            timestamp
        );

        let directions = path_directions(path.path_id(), height);
        while !self.try_add_path(path, &directions, timestamp) {
            log::debug!(
                "Subtree::add_path -- route of path {} was pruned, retrying",
                path.path_id()
            );
        }
        Ok(())
    }

    fn try_add_path(&self, path: &Path<B, Z>, directions: &[bool], timestamp: Timestamp) -> bool {
        let buckets = path.buckets();
        let mut current = self.root_or_install(&buckets[0], timestamp);
        if current.is_detached() {
            return false;
        }

        for (&right, bucket) in directions.iter().zip(&buckets[1..]) {
            current = match current.attach_child(right, *bucket, timestamp, |child| {
                self.index_node(child)
            }) {
                Attach::Installed(child) | Attach::Existing(child) => child,
                Attach::Detached => return false,
            };
        }
        true
    }

    fn root_or_install(&self, bucket: &Bucket<B, Z>, timestamp: Timestamp) -> BucketHandle<B, Z> {
        if let Some(root) = self.root.load_full() {
            return root;
        }

        let _guard = self.root_lock.lock();
        // Another caller may have installed the root while we waited for the lock.
        if let Some(root) = self.root.load_full() {
            return root;
        }
        let root = SubtreeNode::new_handle(*bucket, timestamp);
        self.index_node(&root);
        self.root.store(Some(root.clone()));
        log::debug!("Subtree -- installed root at t = {}", timestamp);
        root
    }

    fn index_node(&self, node: &BucketHandle<B, Z>) {
        for id in node.bucket.read().block_ids() {
            log::trace!("Subtree -- indexing block {}", id);
            self.block_index.insert(id, node.clone());
        }
    }

    // Only entries still pointing at `node` are removed, so a block remapped elsewhere keeps its
    // entry.
    fn unindex_bucket(&self, node: &BucketHandle<B, Z>, bucket: &Bucket<B, Z>) {
        for id in bucket.block_ids() {
            log::trace!("Subtree -- unindexing block {}", id);
            self.block_index
                .remove_if(&id, |_, holder| Arc::ptr_eq(holder, node));
        }
    }

    fn unindex_node(&self, node: &BucketHandle<B, Z>) {
        let bucket = node.bucket.read();
        self.unindex_bucket(node, &bucket);
    }

    // Flags every node below and including `top` as detached and drops their blocks from the
    // index. Returns the number of nodes dropped.
    fn drop_subtree(&self, top: &BucketHandle<B, Z>) -> usize {
        let mut dropped = 0;
        let mut pending = vec![top.clone()];
        while let Some(node) = pending.pop() {
            pending.extend(node.mark_detached());
            self.unindex_node(&node);
            dropped += 1;
        }
        dropped
    }

    /// The cached buckets along `path_id`, or `None` if any of them is not cached.
    pub fn get_path(&self, path_id: PathId) -> Option<CachedPath<B, Z>> {
        let height = self.config.tree_height;
        if check_path_id(path_id, height).is_err() {
            log::debug!("Subtree::get_path -- path {} is out of range", path_id);
            return None;
        }
        let Some(root) = self.root.load_full() else {
            log::debug!("Subtree::get_path -- path {} missed: no root", path_id);
            return None;
        };

        let mut nodes = Vec::with_capacity(usize::try_from(height).ok()? + 1);
        let mut current = root;
        for (level, right) in path_directions(path_id, height).into_iter().enumerate() {
            let Some(child) = current.child(right) else {
                log::debug!(
                    "Subtree::get_path -- path {} missed at level {}",
                    path_id,
                    level + 1
                );
                return None;
            };
            nodes.push(std::mem::replace(&mut current, child));
        }
        nodes.push(current);
        Some(CachedPath::new(path_id, nodes))
    }

    /// A copy of the cached buckets along `path_id`, or `None` if any of them is not cached.
    pub fn get_copy_of_path(&self, path_id: PathId) -> Option<Path<B, Z>> {
        self.get_path(path_id).map(|path| path.snapshot())
    }

    /// Stores `block` in the cached bucket `bucket` and indexes it there.
    ///
    /// Returns `false`, changing nothing, if the bucket is full or no longer part of the subtree.
    pub fn place_block(&self, bucket: &BucketHandle<B, Z>, block: Block<B>) -> bool {
        if block.is_empty() {
            return false;
        }
        let mut contents = bucket.bucket.write();
        if bucket.is_detached() || !contents.add_block(block) {
            return false;
        }
        self.block_index.insert(block.id(), bucket.clone());
        true
    }

    /// Removes block `block_id` from the bucket caching it and from the index.
    pub fn take_block(&self, block_id: BlockId) -> Option<Block<B>> {
        let holder = self.get_bucket_with_block(block_id)?;
        let mut contents = holder.bucket.write();
        self.block_index
            .remove_if(&block_id, |_, h| Arc::ptr_eq(h, &holder))?;
        contents.remove_block(block_id)
    }

    fn is_protected(&self, path_id: PathId, depth: usize, pending: &HashSet<PathId>) -> bool {
        pending.iter().any(|&pending_id| {
            greatest_common_level(path_id, pending_id, self.config.tree_height) as usize >= depth
        })
    }

    fn is_prunable(
        &self,
        timestamp: Timestamp,
        depth: usize,
        path_id: PathId,
        min_time: Timestamp,
        pending: &HashSet<PathId>,
    ) -> bool {
        let below_pinned_levels =
            i64::try_from(depth).map_or(true, |d| d > self.last_level_to_save);
        timestamp < min_time && below_pinned_levels && !self.is_protected(path_id, depth, pending)
    }

    /// Prunes stale nodes along `path_id`.
    ///
    /// Walking bottom-up, a node at depth `d` is removed when its update time is older than
    /// `min_time`, `d` is below the pinned levels, and no path in `pending_path_ids` passes
    /// through it. A removed node takes its whole cached subtree with it, off-path branches
    /// included; their buckets leave the index before the link is severed. The root is dropped,
    /// emptying the subtree, under the same rule at depth 0 when no level is pinned.
    pub fn delete_nodes(
        &self,
        path_id: PathId,
        min_time: Timestamp,
        pending_path_ids: &HashSet<PathId>,
    ) {
        let _guard = self.prune_lock.lock();
        log::info!(
            "Subtree::delete_nodes -- path {} with min time {}",
            path_id,
            min_time
        );
        let height = self.config.tree_height;
        if check_path_id(path_id, height).is_err() {
            log::debug!("Subtree::delete_nodes -- path {} is out of range", path_id);
            return;
        }
        let Some(root) = self.root.load_full() else {
            return;
        };

        let directions = path_directions(path_id, height);
        let root_time =
            self.delete_child(&root, path_id, &directions, 0, min_time, pending_path_ids);

        if self.last_level_to_save < 0
            && self.is_prunable(root_time, 0, path_id, min_time, pending_path_ids)
        {
            self.discard_root(&root);
        } else {
            log::debug!("Subtree::delete_nodes -- keeping the root");
        }
    }

    // Returns the update time of `node`, which survives this call.
    fn delete_child(
        &self,
        node: &BucketHandle<B, Z>,
        path_id: PathId,
        directions: &[bool],
        depth: usize,
        min_time: Timestamp,
        pending: &HashSet<PathId>,
    ) -> Timestamp {
        let Some(&right) = directions.get(depth) else {
            return node.update_time();
        };
        let Some(child) = node.child(right) else {
            return node.update_time();
        };

        let child_depth = depth + 1;
        let child_time =
            self.delete_child(&child, path_id, directions, child_depth, min_time, pending);

        if self.is_prunable(child_time, child_depth, path_id, min_time, pending) {
            let mut dropped = 0;
            if node.detach_child(right, &child, |c| dropped = self.drop_subtree(c)) {
                log::debug!(
                    "Subtree::delete_nodes -- pruned level {} of path {} ({} nodes)",
                    child_depth,
                    path_id,
                    dropped
                );
            }
        } else {
            log::trace!(
                "Subtree::delete_nodes -- keeping level {} of path {} (t = {})",
                child_depth,
                path_id,
                child_time
            );
        }

        node.update_time()
    }

    fn discard_root(&self, root: &BucketHandle<B, Z>) {
        let _guard = self.root_lock.lock();
        match self.root.load_full() {
            Some(current) if Arc::ptr_eq(&current, root) => {}
            _ => return,
        }
        let dropped = self.drop_subtree(root);
        self.root.store(None);
        log::debug!("Subtree::delete_nodes -- discarded the root ({} nodes)", dropped);
    }

    /// Empties every cached bucket along `path_id` and drops their blocks from the index.
    /// Links are kept. Stops at the first level that is not cached.
    pub fn clear_path(&self, path_id: PathId) {
        log::debug!("Subtree::clear_path -- path {}", path_id);
        let height = self.config.tree_height;
        if check_path_id(path_id, height).is_err() {
            return;
        }
        let mut next = self.root.load_full();
        let mut directions = path_directions(path_id, height).into_iter();
        while let Some(node) = next {
            {
                let mut contents = node.bucket.write();
                self.unindex_bucket(&node, &contents);
                contents.clear();
            }
            next = directions.next().and_then(|right| node.child(right));
        }
    }

    /// Every node reachable from the root, in level order.
    pub fn nodes(&self) -> Vec<BucketHandle<B, Z>> {
        let mut result = Vec::new();
        let mut queue: VecDeque<BucketHandle<B, Z>> = self.root.load_full().into_iter().collect();
        while let Some(node) = queue.pop_front() {
            queue.extend(node.left());
            queue.extend(node.right());
            result.push(node);
        }
        result
    }

    /// The number of cached buckets.
    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// The number of indexed blocks.
    pub fn indexed_block_count(&self) -> usize {
        self.block_index.len()
    }

    #[cfg(test)]
    pub(crate) fn indexed_blocks(&self) -> Vec<(BlockId, BucketHandle<B, Z>)> {
        self.block_index
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Logs every cached bucket at `debug` level, in level order.
    pub fn log_subtree(&self) {
        for node in self.nodes() {
            log::debug!("{:?}", node.bucket());
        }
    }
}

impl<const B: BlockSize, const Z: BucketSize> std::fmt::Debug for Subtree<B, Z> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subtree")
            .field("config", &self.config)
            .field("last_level_to_save", &self.last_level_to_save)
            .field("indexed_blocks", &self.block_index.len())
            .finish_non_exhaustive()
    }
}
