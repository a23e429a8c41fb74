// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Root-to-leaf paths of buckets.

use crate::{
    bucket::Bucket, subtree::BucketHandle, BlockSize, BucketSize, OramError, PathId, TreeHeight,
};

#[derive(Clone, Debug, PartialEq, Eq)]
/// An owned path: the buckets met on the way from the root to the leaf `path_id`, root first.
///
/// A path is only usable once it holds one bucket per tree level; partially built paths are
/// rejected by [`Path::check_complete`].
pub struct Path<const B: BlockSize, const Z: BucketSize> {
    path_id: PathId,
    buckets: Vec<Bucket<B, Z>>,
}

impl<const B: BlockSize, const Z: BucketSize> Path<B, Z> {
    /// An empty path for `path_id`.
    pub fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            buckets: Vec::new(),
        }
    }

    /// A path for `path_id` holding `buckets`, root first.
    pub fn with_buckets(path_id: PathId, buckets: Vec<Bucket<B, Z>>) -> Self {
        Self { path_id, buckets }
    }

    /// The leaf this path leads to.
    pub fn path_id(&self) -> PathId {
        self.path_id
    }

    /// Appends the bucket of the next level.
    pub fn push_bucket(&mut self, bucket: Bucket<B, Z>) {
        self.buckets.push(bucket);
    }

    /// The bucket at depth `level`.
    pub fn bucket(&self, level: usize) -> Option<&Bucket<B, Z>> {
        self.buckets.get(level)
    }

    /// A mutable reference to the bucket at depth `level`.
    pub fn bucket_mut(&mut self, level: usize) -> Option<&mut Bucket<B, Z>> {
        self.buckets.get_mut(level)
    }

    /// The buckets of this path, root first.
    pub fn buckets(&self) -> &[Bucket<B, Z>] {
        &self.buckets
    }

    /// Consumes the path, returning its buckets.
    pub fn into_buckets(self) -> Vec<Bucket<B, Z>> {
        self.buckets
    }

    /// Whether the path holds exactly one bucket per level of a tree of height `height`.
    pub fn is_complete(&self, height: TreeHeight) -> bool {
        self.check_complete(height).is_ok()
    }

    /// Fails unless the path holds exactly one bucket per level of a tree of height `height`.
    pub fn check_complete(&self, height: TreeHeight) -> Result<(), OramError> {
        let expected = usize::try_from(height)? + 1;
        if self.buckets.len() != expected {
            return Err(OramError::IncompletePath {
                expected,
                actual: self.buckets.len(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
/// A path read out of the subtree: live handles to the cached buckets, root first.
///
/// Changes made through the handles are visible to the subtree.
pub struct CachedPath<const B: BlockSize, const Z: BucketSize> {
    path_id: PathId,
    nodes: Vec<BucketHandle<B, Z>>,
}

impl<const B: BlockSize, const Z: BucketSize> CachedPath<B, Z> {
    pub(crate) fn new(path_id: PathId, nodes: Vec<BucketHandle<B, Z>>) -> Self {
        Self { path_id, nodes }
    }

    /// The leaf this path leads to.
    pub fn path_id(&self) -> PathId {
        self.path_id
    }

    /// The handles along the path, root first.
    pub fn nodes(&self) -> &[BucketHandle<B, Z>] {
        &self.nodes
    }

    /// The handle at depth `level`.
    pub fn node(&self, level: usize) -> Option<&BucketHandle<B, Z>> {
        self.nodes.get(level)
    }

    /// The number of buckets on the path.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the path holds no bucket.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Copies the current contents of every bucket into an owned [`Path`].
    pub fn snapshot(&self) -> Path<B, Z> {
        Path::with_buckets(
            self.path_id,
            self.nodes.iter().map(|node| node.bucket()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Block;

    #[test]
    fn completeness_depends_on_height() {
        let mut path = Path::<4, 2>::new(3);
        assert!(!path.is_complete(2));
        for id in 0..3 {
            path.push_bucket(Bucket::from_blocks([Block::new(id)]).unwrap());
        }
        assert!(path.is_complete(2));
        assert!(matches!(
            path.check_complete(3),
            Err(OramError::IncompletePath {
                expected: 4,
                actual: 3
            })
        ));
        assert_eq!(
            path.bucket(1).map(|b| b.block_ids().collect::<Vec<_>>()),
            Some(vec![1])
        );
        assert!(path.bucket(3).is_none());
    }
}
