// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An in-memory stand-in for the remote ORAM tree.
//!
//! Buckets are stored in heap order: the root lives at index 1 and the children of the node at
//! index `i` live at `2i` and `2i + 1`. Index 0 is unused.

use crate::{
    bucket::Bucket,
    path::Path,
    utils::{check_path_id, node_on_path, number_of_nodes, TreeIndex},
    BlockSize, BucketSize, OramError, PathId, TreeHeight,
};

/// A simple memory trait modelling the storage backend the proxy fetches paths from.
pub trait Database<V: Copy + Default>
where
    Self: Sized,
{
    /// Returns a new `Database` filled with default values.
    fn new(number_of_addresses: TreeIndex) -> Result<Self, OramError>;
    /// Returns the number of values stored by `self`.
    fn capacity(&self) -> Result<TreeIndex, OramError>;
    /// Reads the value stored at `index`.
    fn read_db(&mut self, index: TreeIndex) -> Result<V, OramError>;
    /// Writes `value` at `index`, returning the value it replaces.
    fn write_db(&mut self, index: TreeIndex, value: V) -> Result<V, OramError>;
}

/// A simple Database that stores its data as a Vec.
#[derive(Debug)]
pub struct SimpleDatabase<V>(Vec<V>);

impl<V: Copy + Default> Database<V> for SimpleDatabase<V> {
    fn new(number_of_addresses: TreeIndex) -> Result<Self, OramError> {
        Ok(Self(vec![V::default(); number_of_addresses.try_into()?]))
    }

    fn capacity(&self) -> Result<TreeIndex, OramError> {
        Ok(self.0.len().try_into()?)
    }

    fn read_db(&mut self, index: TreeIndex) -> Result<V, OramError> {
        let index: usize = index.try_into()?;
        self.0
            .get(index)
            .copied()
            .ok_or(OramError::AddressOutOfBoundsError)
    }

    fn write_db(&mut self, index: TreeIndex, value: V) -> Result<V, OramError> {
        let index: usize = index.try_into()?;
        let slot = self
            .0
            .get_mut(index)
            .ok_or(OramError::AddressOutOfBoundsError)?;
        Ok(std::mem::replace(slot, value))
    }
}

/// A `Database` that counts reads and writes.
#[derive(Debug)]
pub struct CountAccessesDatabase<V> {
    data: SimpleDatabase<V>,
    /// `reads[i]` tracks the total number of reads made to index `i`.
    pub reads: Vec<u64>,
    /// `writes[i]` tracks the total number of writes made to index `i`.
    pub writes: Vec<u64>,
}

impl<V> CountAccessesDatabase<V> {
    /// Returns the total number of reads to the database.
    pub fn get_read_count(&self) -> u64 {
        self.reads.iter().sum()
    }

    /// Returns the total number of writes to the database.
    pub fn get_write_count(&self) -> u64 {
        self.writes.iter().sum()
    }
}

impl<V: Copy + Default> Database<V> for CountAccessesDatabase<V> {
    fn new(number_of_addresses: TreeIndex) -> Result<Self, OramError> {
        Ok(Self {
            data: Database::new(number_of_addresses)?,
            reads: vec![0u64; number_of_addresses.try_into()?],
            writes: vec![0u64; number_of_addresses.try_into()?],
        })
    }

    fn capacity(&self) -> Result<TreeIndex, OramError> {
        self.data.capacity()
    }

    fn read_db(&mut self, index: TreeIndex) -> Result<V, OramError> {
        log::debug!("Physical read -- {}", index);

        let value = self.data.read_db(index)?;
        self.reads[usize::try_from(index)?] += 1;
        Ok(value)
    }

    fn write_db(&mut self, index: TreeIndex, value: V) -> Result<V, OramError> {
        log::debug!("Physical write -- {}", index);

        let previous = self.data.write_db(index, value)?;
        self.writes[usize::try_from(index)?] += 1;
        Ok(previous)
    }
}

/// Creates a database large enough to hold every bucket of a tree of height `height`.
pub fn new_tree_database<const B: BlockSize, const Z: BucketSize, D: Database<Bucket<B, Z>>>(
    height: TreeHeight,
) -> Result<D, OramError> {
    D::new(number_of_nodes(height)? + 1)
}

/// Reads the buckets along `path_id`, root first.
pub fn read_path<const B: BlockSize, const Z: BucketSize, D: Database<Bucket<B, Z>>>(
    database: &mut D,
    path_id: PathId,
    height: TreeHeight,
) -> Result<Path<B, Z>, OramError> {
    check_path_id(path_id, height)?;
    let mut path = Path::new(path_id);
    for depth in 0..=height {
        path.push_bucket(database.read_db(node_on_path(path_id, depth, height))?);
    }
    Ok(path)
}

/// Writes the buckets of a complete path back to their places in the tree.
pub fn write_path<const B: BlockSize, const Z: BucketSize, D: Database<Bucket<B, Z>>>(
    database: &mut D,
    path: &Path<B, Z>,
    height: TreeHeight,
) -> Result<(), OramError> {
    check_path_id(path.path_id(), height)?;
    path.check_complete(height)?;
    for (depth, bucket) in (0..=height).zip(path.buckets()) {
        database.write_db(node_on_path(path.path_id(), depth, height), *bucket)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bucket::Block, test_utils::init_logger};

    type TestBucket = Bucket<8, 2>;

    #[test]
    fn out_of_bounds_accesses_fail() {
        let mut database = <SimpleDatabase<TestBucket> as Database<TestBucket>>::new(4).unwrap();
        assert!(matches!(
            database.read_db(4),
            Err(OramError::AddressOutOfBoundsError)
        ));
        assert!(matches!(
            database.write_db(9, TestBucket::default()),
            Err(OramError::AddressOutOfBoundsError)
        ));
    }

    #[test]
    fn paths_share_their_prefix() {
        init_logger();
        let height = 3;
        let mut database =
            new_tree_database::<8, 2, CountAccessesDatabase<TestBucket>>(height).unwrap();
        assert_eq!(database.capacity().unwrap(), 16);

        let mut path: Path<8, 2> = read_path(&mut database, 0b010, height).unwrap();
        assert_eq!(database.get_read_count(), 4);
        for depth in 0..=3 {
            path.bucket_mut(depth)
                .unwrap()
                .add_block(Block::new(depth as i64));
        }
        write_path(&mut database, &path, height).unwrap();
        assert_eq!(database.get_write_count(), 4);

        let sibling: Path<8, 2> = read_path(&mut database, 0b011, height).unwrap();
        let ids: Vec<Vec<i64>> = sibling
            .buckets()
            .iter()
            .map(|b| b.block_ids().collect())
            .collect();
        assert_eq!(ids, vec![vec![0], vec![1], vec![2], vec![]]);
        assert_eq!(database.reads[1], 2);
    }

    #[test]
    fn incomplete_paths_are_not_written() {
        let height = 2;
        let mut database = new_tree_database::<8, 2, SimpleDatabase<TestBucket>>(height).unwrap();
        let path = Path::with_buckets(1, vec![TestBucket::default()]);
        assert!(matches!(
            write_path(&mut database, &path, height),
            Err(OramError::IncompletePath { .. })
        ));
        assert!(matches!(
            read_path::<8, 2, _>(&mut database, 4, height),
            Err(OramError::PathIdOutOfRange { .. })
        ));
    }
}
