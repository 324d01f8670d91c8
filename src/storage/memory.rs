use super::{Engine, Status};
use crate::error::Result;

use std::collections::btree_map::Range;
use std::collections::BTreeMap;

/// An in-memory key/value storage engine using the Rust standard library
/// B-tree implementation. Data is not persisted. Used for development mode
/// and tests.
#[derive(Default)]
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory key/value storage engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator { inner: self.data.range(range) }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum(),
            disk_size: 0,
            garbage_size: 0,
        })
    }
}

pub struct ScanIterator<'a> {
    inner: Range<'a, Vec<u8>, Vec<u8>>,
}

impl ScanIterator<'_> {
    fn map(item: (&Vec<u8>, &Vec<u8>)) -> <Self as Iterator>::Item {
        let (key, value) = item;
        Ok((key.clone(), value.clone()))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Self::map)
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(Self::map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() -> Result<()> {
        let mut engine = Memory::new();
        assert_eq!(engine.get(b"a")?, None);

        engine.set(b"a", vec![1])?;
        engine.set(b"b", vec![2])?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));
        assert_eq!(engine.get(b"b")?, Some(vec![2]));

        engine.set(b"a", vec![9])?;
        assert_eq!(engine.get(b"a")?, Some(vec![9]));

        engine.delete(b"a")?;
        assert_eq!(engine.get(b"a")?, None);
        assert_eq!(engine.get(b"b")?, Some(vec![2]));
        Ok(())
    }

    #[test]
    fn scan_range() -> Result<()> {
        let mut engine = Memory::new();
        for key in [b"a", b"b", b"c", b"d"] {
            engine.set(key, key.to_vec())?;
        }
        let items: Vec<_> = engine.scan(b"b".to_vec()..=b"c".to_vec()).collect::<Result<_>>()?;
        assert_eq!(items, vec![(b"b".to_vec(), b"b".to_vec()), (b"c".to_vec(), b"c".to_vec())]);

        let reverse: Vec<_> = engine.scan(..).rev().collect::<Result<_>>()?;
        assert_eq!(reverse.first().map(|(k, _)| k.clone()), Some(b"d".to_vec()));
        Ok(())
    }
}
