use super::{NodeID, Term};
use crate::encoding::{self, bincode, Key as _, Value as _};
use crate::error::Result;
use crate::storage;

use serde_derive::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The consensus operation. None (noop) commands are appended when a
    /// leader is elected, to commit entries from previous terms.
    pub command: Option<Vec<u8>>,
}

impl encoding::Value for Entry {}

/// A log storage key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Key {
    /// A log entry, storing the term and command.
    Entry(Index),
    /// Stores the current term and vote (if any).
    TermVote,
    /// Stores the current commit index (if any).
    CommitIndex,
    /// Stores the index and term of the last compacted entry (if any), i.e.
    /// the point covered by the latest snapshot.
    Prefix,
}

impl encoding::Key<'_> for Key {}

/// The replicated log: a sequence of consensus operations appended by the
/// leader and replicated to followers. Entries up to the commit index are
/// immutable; uncommitted entries may be replaced when leadership changes.
/// Once a snapshot has been persisted, the covered prefix of the log is
/// compacted away; followers too far behind receive the snapshot instead of
/// entries.
///
/// A key/value storage engine stores the entries keyed by index, along with
/// a few metadata keys (term/vote, commit index, compaction prefix).
pub struct Log {
    /// The underlying storage engine. A trait object allows runtime engine
    /// selection without propagating generics through the consensus code.
    engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index of the last compacted entry (0 if none).
    prefix_index: Index,
    /// The term of the last compacted entry.
    prefix_term: Term,
}

impl Log {
    /// Initializes a log using the given storage engine.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (prefix_index, prefix_term) = engine
            .get(&Key::Prefix.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        let (last_index, last_term) = {
            use std::ops::Bound::Included;
            engine
                .scan_dyn((Included(Key::Entry(0).encode()), Included(Key::Entry(u64::MAX).encode())))
                .last()
                .transpose()?
                .map(|(_, v)| Entry::decode(&v))
                .transpose()?
                .map(|e| (e.index, e.term))
                .unwrap_or((prefix_index, prefix_term))
        };
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((prefix_index, prefix_term));
        Ok(Self {
            engine,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            prefix_index,
            prefix_term,
        })
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the compaction prefix index and term.
    pub fn get_prefix(&self) -> (Index, Term) {
        (self.prefix_index, self.prefix_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote.clone())
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, &vote)))?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command to the log at the current term, and flushes it to
    /// disk, returning its index. None implies a noop command, typically
    /// after leader changes.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        let term = match self.get(index)? {
            Some(e) if e.index < self.commit_index => {
                panic!("commit index regression {} → {}", self.commit_index, e.index);
            }
            Some(e) if e.index == self.commit_index => return Ok(index),
            Some(e) => e.term,
            None => panic!("commit index {index} does not exist"),
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        // NB: the commit index doesn't need to be fsynced, since the entries
        // are fsynced and the commit index can be recovered from a log quorum.
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Compacted entries are committed and identical on all nodes, so they
    /// match any probe at or below the prefix by construction.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if index == self.prefix_index {
            return Ok(term == self.prefix_term);
        }
        if index < self.prefix_index {
            return Ok(true);
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan_dyn((from, to)))
    }

    /// Returns an iterator over entries that are ready to apply, starting
    /// after the given applied index up to the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator {
        // NB: the local commit index is not flushed to durable storage -- if
        // lost on restart, it is recovered from a quorum of logs.
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        assert!(applied_index >= self.prefix_index, "applied index below compacted prefix");
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes it to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and
    /// the first entry must connect to the existing log (or prefix), with a
    /// term at or above the base entry's and at or below the current term.
    /// Overlapping indexes with the same term must be equal and are ignored;
    /// overlapping indexes with different terms truncate the existing log at
    /// the first conflict and splice the new entries.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        // Entries at or below the commit index are immutable and already
        // present locally (possibly compacted away), so skip them. This
        // happens when a leader probes below our snapshot point.
        let entries: Vec<Entry> =
            entries.into_iter().skip_while(|e| e.index <= self.commit_index).collect();

        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }

        // Check that the entries connect to the existing log (if any), and
        // that the term doesn't regress.
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        if first.index == self.prefix_index + 1 {
            if first.term < self.prefix_term {
                panic!("splice term regression {} → {}", self.prefix_term, first.term);
            }
        } else {
            match self.get(first.index - 1)? {
                Some(base) if first.term < base.term => {
                    panic!("splice term regression {} → {}", base.term, first.term)
                }
                Some(_) => {}
                None => panic!("first index {} must touch existing log", first.index),
            }
        }

        // Skip entries that are already in the log.
        let mut entries = entries.as_slice();
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            // [0] is ok, because the scan has at most the same size as entries.
            assert!(entry.index == entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert!(entry.command == entries[0].command, "command mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the entries that weren't already in the log, and remove the
        // tail of the old log if any. We can't write below the commit index,
        // since these entries must be immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Compacts the log up to and including the given index, after a snapshot
    /// covering it has been persisted. The index must be committed.
    pub fn compact(&mut self, index: Index) -> Result<()> {
        assert!(index <= self.commit_index, "can't compact uncommitted index {index}");
        if index <= self.prefix_index {
            return Ok(());
        }
        let term = self.get(index)?.expect("missing compact entry").term;
        for i in self.prefix_index + 1..=index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.set(&Key::Prefix.encode(), bincode::serialize(&(index, term)))?;
        self.engine.flush()?;
        self.prefix_index = index;
        self.prefix_term = term;
        Ok(())
    }

    /// Replaces the entire log with an installed snapshot at the given index
    /// and term: all entries are discarded and the prefix, commit, and last
    /// positions move to the snapshot point.
    pub fn install(&mut self, index: Index, term: Term) -> Result<()> {
        assert!(index > self.commit_index, "snapshot index {index} below commit index");
        for i in self.prefix_index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.set(&Key::Prefix.encode(), bincode::serialize(&(index, term)))?;
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        self.engine.flush()?;
        (self.prefix_index, self.prefix_term) = (index, term);
        (self.commit_index, self.commit_term) = (index, term);
        (self.last_index, self.last_term) = (index, term);
        Ok(())
    }

    /// Returns log engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    fn setup() -> Log {
        Log::new(Box::new(Memory::new())).expect("log init failed")
    }

    #[test]
    fn append_get_scan() -> Result<()> {
        let mut log = setup();
        log.set_term(1, Some("a".to_string()))?;
        assert_eq!(log.append(Some(vec![1]))?, 1);
        assert_eq!(log.append(None)?, 2);
        assert_eq!(log.append(Some(vec![3]))?, 3);

        assert_eq!(log.get(2)?, Some(Entry { index: 2, term: 1, command: None }));
        assert_eq!(log.get(4)?, None);
        assert_eq!(log.get_last_index(), (3, 1));

        let entries: Vec<_> = log.scan(2..).collect::<Result<_>>()?;
        assert_eq!(entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        Ok(())
    }

    #[test]
    fn commit_and_apply() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(Some(vec![1]))?;
        log.append(Some(vec![2]))?;
        log.commit(2)?;
        assert_eq!(log.get_commit_index(), (2, 1));

        let ready: Vec<_> = log.scan_apply(0).collect::<Result<_>>()?;
        assert_eq!(ready.len(), 2);
        let ready: Vec<_> = log.scan_apply(2).collect::<Result<_>>()?;
        assert!(ready.is_empty());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "commit index 9 does not exist")]
    fn commit_missing_panics() {
        let mut log = setup();
        log.set_term(1, None).unwrap();
        log.commit(9).unwrap();
    }

    #[test]
    fn splice_truncates_conflicts() -> Result<()> {
        let mut log = setup();
        log.set_term(2, None)?;
        log.splice(vec![
            Entry { index: 1, term: 1, command: Some(vec![1]) },
            Entry { index: 2, term: 1, command: Some(vec![2]) },
            Entry { index: 3, term: 1, command: Some(vec![3]) },
        ])?;

        // A new leader in term 2 overwrites the uncommitted tail.
        log.splice(vec![Entry { index: 2, term: 2, command: Some(vec![9]) }])?;
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get(2)?.unwrap().command, Some(vec![9]));
        assert_eq!(log.get(3)?, None);
        Ok(())
    }

    #[test]
    fn compact_retains_tail() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        for i in 1..=5u8 {
            log.append(Some(vec![i]))?;
        }
        log.commit(4)?;
        log.compact(3)?;

        assert_eq!(log.get_prefix(), (3, 1));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.get(4)?.unwrap().command, Some(vec![4]));

        // Compacted entries match probes by construction.
        assert!(log.has(2, 1)?);
        assert!(log.has(3, 1)?);
        assert!(!log.has(3, 2)?);

        // Appends continue after the tail.
        assert_eq!(log.append(Some(vec![6]))?, 6);
        Ok(())
    }

    #[test]
    fn install_resets_log() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.append(Some(vec![1]))?;
        log.append(Some(vec![2]))?;
        log.install(8, 3)?;

        assert_eq!(log.get_prefix(), (8, 3));
        assert_eq!(log.get_commit_index(), (8, 3));
        assert_eq!(log.get_last_index(), (8, 3));
        assert_eq!(log.get(1)?, None);
        Ok(())
    }

    #[test]
    fn term_vote_persistence() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ballast")?;
        let path = dir.path().join("raft.db");

        let mut log = Log::new(Box::new(crate::storage::File::new(path.clone())?))?;
        log.set_term(3, Some("b".to_string()))?;
        log.append(Some(vec![1]))?;
        drop(log);

        let log = Log::new(Box::new(crate::storage::File::new(path)?))?;
        assert_eq!(log.get_term(), (3, Some("b".to_string())));
        assert_eq!(log.get_last_index(), (1, 3));
        Ok(())
    }
}
