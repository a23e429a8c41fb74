// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Utilities for addressing paths and nodes of the ORAM tree.
//!
//! A path identifier `p` of a tree of height `h` is read as `h` direction bits, most significant
//! first: bit `h - 1 - i` of `p` chooses the child taken when leaving depth `i`, with `1`
//! meaning right and `0` meaning left. Two paths therefore share the node at depth `d` exactly
//! when their first `d` direction bits agree.

use crate::{OramError, PathId, TreeHeight, MAXIMUM_TREE_HEIGHT};
use rand::{CryptoRng, Rng, RngCore};

/// A node index in a heap-ordered complete binary tree (root = 1, children of `i` are `2i` and
/// `2i + 1`).
pub type TreeIndex = u64;

/// Returns the direction bits of `path_id` in root-to-leaf order; `true` means "turn right".
pub fn path_directions(path_id: PathId, height: TreeHeight) -> Vec<bool> {
    (0..height)
        .map(|depth| direction_at(path_id, depth, height))
        .collect()
}

/// Returns the direction taken by `path_id` when leaving depth `depth`.
pub fn direction_at(path_id: PathId, depth: TreeHeight, height: TreeHeight) -> bool {
    debug_assert!(depth < height);
    (path_id >> (height - 1 - depth)) & 1 == 1
}

/// The deepest level at which the paths `a` and `b` still pass through the same node,
/// i.e. the number of leading direction bits they agree on.
pub fn greatest_common_level(a: PathId, b: PathId, height: TreeHeight) -> TreeHeight {
    if height == 0 {
        return 0;
    }
    let mask = (1u64 << height) - 1;
    let differing = (a ^ b) & mask;
    if differing == 0 {
        height
    } else {
        // The highest differing bit within the low `height` bits marks the first diverging turn.
        let highest_differing_bit = 63 - differing.leading_zeros();
        height - 1 - highest_differing_bit
    }
}

/// Checks that `path_id` names one of the `2^height` leaves.
pub fn check_path_id(path_id: PathId, height: TreeHeight) -> Result<(), OramError> {
    if height > MAXIMUM_TREE_HEIGHT || path_id >> height != 0 {
        return Err(OramError::PathIdOutOfRange { path_id, height });
    }
    Ok(())
}

/// The heap index of the node at depth `depth` on path `path_id`.
pub fn node_on_path(path_id: PathId, depth: TreeHeight, height: TreeHeight) -> TreeIndex {
    debug_assert!(depth <= height);
    let leaf: TreeIndex = (1 << height) | path_id;
    leaf >> (height - depth)
}

/// The number of nodes in a complete tree of height `height`.
pub fn number_of_nodes(height: TreeHeight) -> Result<u64, OramError> {
    if height > MAXIMUM_TREE_HEIGHT {
        return Err(OramError::InvalidConfigurationError);
    }
    Ok((1u64 << (height + 1)) - 1)
}

/// The deepest level kept resident when the remote tree is split over `num_servers` servers,
/// or `-1` when nothing needs to be kept.
pub fn last_level_to_save(num_servers: usize) -> i64 {
    if num_servers > 1 {
        i64::from(num_servers.ilog2()) - 1
    } else {
        -1
    }
}

/// Samples a uniformly random path identifier.
pub fn random_path_id<R: RngCore + CryptoRng>(
    height: TreeHeight,
    rng: &mut R,
) -> Result<PathId, OramError> {
    if height > MAXIMUM_TREE_HEIGHT {
        return Err(OramError::InvalidConfigurationError);
    }
    Ok(rng.gen_range(0..(1u64 << height)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn directions_are_most_significant_first() {
        assert_eq!(path_directions(0b011, 3), vec![false, true, true]);
        assert_eq!(path_directions(0b100, 3), vec![true, false, false]);
        assert!(path_directions(5, 0).is_empty());
    }

    #[test]
    fn common_level_counts_agreeing_prefix() {
        let height = 4;
        assert_eq!(greatest_common_level(0b1010, 0b1010, height), 4);
        assert_eq!(greatest_common_level(0b1010, 0b1011, height), 3);
        assert_eq!(greatest_common_level(0b1010, 0b1000, height), 2);
        assert_eq!(greatest_common_level(0b1010, 0b0010, height), 0);
        assert_eq!(greatest_common_level(0b0000, 0b0111, height), 1);
    }

    #[test]
    fn common_level_matches_direction_bits() {
        let height = 6;
        for a in 0..(1u64 << height) {
            for b in 0..(1u64 << height) {
                let da = path_directions(a, height);
                let db = path_directions(b, height);
                let expected = da.iter().zip(&db).take_while(|(x, y)| x == y).count();
                assert_eq!(greatest_common_level(a, b, height) as usize, expected);
            }
        }
    }

    #[test]
    fn node_on_path_follows_heap_order() {
        let height = 3;
        assert_eq!(node_on_path(0b101, 0, height), 1);
        assert_eq!(node_on_path(0b101, 1, height), 3);
        assert_eq!(node_on_path(0b101, 2, height), 6);
        assert_eq!(node_on_path(0b101, 3, height), 13);
        assert_eq!(number_of_nodes(height).unwrap(), 15);
    }

    #[test]
    fn path_id_range_is_checked() {
        assert!(check_path_id(7, 3).is_ok());
        assert!(matches!(
            check_path_id(8, 3),
            Err(OramError::PathIdOutOfRange { path_id: 8, height: 3 })
        ));
    }

    #[test]
    fn last_level_to_save_for_partitions() {
        assert_eq!(last_level_to_save(0), -1);
        assert_eq!(last_level_to_save(1), -1);
        assert_eq!(last_level_to_save(2), 0);
        assert_eq!(last_level_to_save(3), 0);
        assert_eq!(last_level_to_save(4), 1);
        assert_eq!(last_level_to_save(8), 2);
    }

    #[test]
    fn random_path_ids_are_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let path_id = random_path_id(5, &mut rng).unwrap();
            assert!(check_path_id(path_id, 5).is_ok());
        }
    }
}
