// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities for the subtree and its collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once};
static INIT: Once = Once::new();
use crate::bucket::{Block, Bucket};
use crate::database::{
    new_tree_database, read_path, write_path, CountAccessesDatabase, Database,
};
use crate::path::Path;
use crate::stash::Stash;
use crate::subtree::{Subtree, SubtreeConfig};
use crate::utils::{node_on_path, number_of_nodes, random_path_id};
use crate::{BlockId, BlockSize, BucketSize, PathId, TreeHeight};
use rand::{rngs::StdRng, Rng, SeedableRng};
use simplelog::{Config, WriteLogger};

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// Hands out block identifiers that are never reused.
#[derive(Debug, Default)]
pub(crate) struct BlockIdSource(BlockId);

impl BlockIdSource {
    pub(crate) fn starting_at(first: BlockId) -> Self {
        Self(first)
    }

    pub(crate) fn next_id(&mut self) -> BlockId {
        let id = self.0;
        self.0 += 1;
        id
    }
}

/// A complete path whose buckets hold between 0 and `Z` fresh blocks with random payloads.
pub(crate) fn random_full_path<const B: BlockSize, const Z: BucketSize, R: Rng>(
    path_id: PathId,
    height: TreeHeight,
    ids: &mut BlockIdSource,
    rng: &mut R,
) -> Path<B, Z> {
    let mut path = Path::new(path_id);
    for _ in 0..=height {
        let mut bucket = Bucket::default();
        for _ in 0..rng.gen_range(0..=Z) {
            let mut data = [0u8; B];
            rng.fill(&mut data[..]);
            assert!(bucket.add_block(Block::with_data(ids.next_id(), data)));
        }
        path.push_bucket(bucket);
    }
    path
}

/// Checks that every index entry names a reachable bucket holding the block, and that every
/// block held by a reachable bucket is indexed under that bucket.
pub(crate) fn assert_index_consistent<const B: BlockSize, const Z: BucketSize>(
    subtree: &Subtree<B, Z>,
) {
    let reachable = subtree.nodes();
    for (id, holder) in subtree.indexed_blocks() {
        assert!(
            reachable.iter().any(|n| Arc::ptr_eq(n, &holder)),
            "block {id} is indexed under an unreachable bucket"
        );
        assert!(holder.contains(id), "block {id} is not in its indexed bucket");
    }
    for node in &reachable {
        for block in node.filled_blocks() {
            let holder = subtree
                .get_bucket_with_block(block.id())
                .unwrap_or_else(|| panic!("block {} is cached but not indexed", block.id()));
            assert!(Arc::ptr_eq(&holder, node));
        }
    }
}

/// Drives the subtree the way a proxy does: fetch on miss, stash a fresh block, evict the stash
/// into the path, write the path back and prune it. Every block written must stay readable.
pub(crate) fn test_subtree_random_workload<const B: BlockSize, const Z: BucketSize>(
    height: TreeHeight,
    num_partition_servers: usize,
    num_operations: u64,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let subtree = Subtree::<B, Z>::new(SubtreeConfig::new(height, num_partition_servers).unwrap());
    subtree.init_root();
    let stash = Stash::<B>::new();
    let mut database =
        new_tree_database::<B, Z, CountAccessesDatabase<Bucket<B, Z>>>(height).unwrap();
    let mut mirror: HashMap<BlockId, [u8; B]> = HashMap::new();
    let mut ids = BlockIdSource::default();

    for time in 1..=num_operations {
        let path_id = random_path_id(height, &mut rng).unwrap();
        if subtree.get_path(path_id).is_none() {
            let path = read_path(&mut database, path_id, height).unwrap();
            subtree.add_path(&path, time).unwrap();
        }
        let cached = subtree.get_path(path_id).unwrap();
        assert_eq!(cached.len(), height as usize + 1);

        let mut data = [0u8; B];
        rng.fill(&mut data[..]);
        let id = ids.next_id();
        mirror.insert(id, data);
        stash.add_block(Block::with_data(id, data));

        for block in stash.all_blocks() {
            for node in cached.nodes().iter().rev() {
                if subtree.place_block(node, block) {
                    stash.remove_block(block.id());
                    break;
                }
            }
        }

        write_path(&mut database, &cached.snapshot(), height).unwrap();
        subtree.delete_nodes(path_id, time + 1, &HashSet::new());
        assert_index_consistent(&subtree);

        let stored = stored_blocks(&mut database, height);
        for (id, data) in &mirror {
            let found = stash
                .get_block(*id)
                .or_else(|| subtree.get_bucket_with_block(*id)?.get_block(*id))
                .or_else(|| stored.get(id).copied());
            assert_eq!(found.map(|b| b.data()), Some(*data), "block {id} was lost");
        }
    }

    // Nothing above the pinned levels outlives its own write-back.
    let pinned_nodes = match subtree.last_level_to_save() {
        level if level < 0 => 0,
        level => number_of_nodes(u32::try_from(level).unwrap()).unwrap(),
    };
    assert_eq!(subtree.node_count() as u64, pinned_nodes);
}

fn stored_blocks<const B: BlockSize, const Z: BucketSize>(
    database: &mut CountAccessesDatabase<Bucket<B, Z>>,
    height: TreeHeight,
) -> HashMap<BlockId, Block<B>> {
    let mut result = HashMap::new();
    let first = node_on_path(0, 0, height);
    let last = number_of_nodes(height).unwrap();
    for index in first..=last {
        for block in database.read_db(index).unwrap().filled_blocks() {
            result.insert(block.id(), block);
        }
    }
    result
}

macro_rules! create_subtree_workload_test {
    ($function_name:ident, $block_size:expr, $bucket_size:expr, $height:expr, $servers:expr, $operations:expr) => {
        paste::paste! {
            #[test]
            fn [<$function_name _ $block_size _ $bucket_size _ $height _ $servers _ $operations>]() {
                $function_name::<$block_size, $bucket_size>($height, $servers, $operations);
            }
        }
    };
}

macro_rules! create_subtree_workload_tests {
    ($function_name: ident) => {
        create_subtree_workload_test!($function_name, 8, 1, 2, 1, 10);
        create_subtree_workload_test!($function_name, 8, 2, 3, 1, 50);
        create_subtree_workload_test!($function_name, 16, 4, 4, 1, 100);
        create_subtree_workload_test!($function_name, 8, 1, 4, 4, 100);
        create_subtree_workload_test!($function_name, 8, 4, 2, 2, 30);
        // Block size 32 bytes, 3 blocks per bucket, height 5, 8 partition servers, 200 operations
        create_subtree_workload_test!($function_name, 32, 3, 5, 8, 200);
    };
}

pub(crate) use create_subtree_workload_test;
pub(crate) use create_subtree_workload_tests;
