use super::{Engine, Status};
use crate::error::Result;

use fs4::FileExt as _;
use log::{error, info};
use std::collections::btree_map::Range;
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::PathBuf;

/// Maps keys to a value position and length in the log file.
type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

/// A very simple variant of Bitcask, an append-only log-structured key/value
/// store. Each write appends a record to the log file, with an in-memory
/// index (keydir) pointing at the latest value of each key. Deletes append a
/// tombstone. The log is compacted on startup when the garbage fraction
/// exceeds a threshold, by writing out the live records to a new file and
/// replacing the old one.
///
/// This stores the consensus log and stable state (term, vote, commit index)
/// as a single `raft.db` file, held under an exclusive lock while open.
///
/// Record format, all integers big-endian:
///
/// - key length: u32
/// - value length: u32 (u32::MAX if tombstone)
/// - key: raw bytes
/// - value: raw bytes
pub struct File {
    log: std::fs::File,
    path: PathBuf,
    keydir: KeyDir,
    garbage_size: u64,
}

/// Tombstone marker in the value length field.
const TOMBSTONE: u32 = u32::MAX;

impl File {
    /// Opens or creates a log file at the given path.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        log.try_lock_exclusive()?;

        let mut file = Self { log, path, keydir: KeyDir::new(), garbage_size: 0 };
        file.build_keydir()?;
        Ok(file)
    }

    /// Opens a log file, and compacts it if the fraction of garbage records
    /// exceeds the given threshold and there is a meaningful amount of it.
    pub fn new_compact(path: PathBuf, garbage_fraction: f64, garbage_min_bytes: u64) -> Result<Self> {
        let mut file = Self::new(path)?;

        let status = file.status()?;
        if status.disk_size > 0
            && status.garbage_size >= garbage_min_bytes
            && status.garbage_size as f64 / status.disk_size as f64 >= garbage_fraction
        {
            info!(
                "Compacting {} to remove {:.0}% garbage ({} MB out of {} MB)",
                file.path.display(),
                status.garbage_size as f64 / status.disk_size as f64 * 100.0,
                status.garbage_size / 1024 / 1024,
                status.disk_size / 1024 / 1024,
            );
            file.compact()?;
        }
        Ok(file)
    }

    /// Builds the keydir by scanning the log file. Incomplete trailing records
    /// (e.g. from a crash mid-write) are discarded by truncating the file.
    fn build_keydir(&mut self) -> Result<()> {
        let file_len = self.log.metadata()?.len();
        let mut keydir = KeyDir::new();
        let mut live_size: u64 = 0;
        let mut truncate_to = None;

        let mut reader = BufReader::new(&mut self.log);
        let mut pos = reader.seek(SeekFrom::Start(0))?;
        while pos < file_len {
            let result = || -> std::result::Result<(), std::io::Error> {
                let mut header = [0u8; 8];
                reader.read_exact(&mut header)?;
                let key_len = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes"));
                let value_len = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));

                let mut key = vec![0u8; key_len as usize];
                reader.read_exact(&mut key)?;

                if value_len == TOMBSTONE {
                    if let Some((_, len)) = keydir.remove(&key) {
                        live_size -= 8 + key.len() as u64 + len as u64;
                    }
                    pos += 8 + key_len as u64;
                } else {
                    let value_pos = pos + 8 + key_len as u64;
                    reader.seek(SeekFrom::Start(value_pos + value_len as u64))?;
                    if let Some((_, len)) = keydir.insert(key, (value_pos, value_len)) {
                        live_size -= 8 + key_len as u64 + len as u64;
                    }
                    live_size += 8 + key_len as u64 + value_len as u64;
                    pos = value_pos + value_len as u64;
                }
                Ok(())
            }();
            if let Err(err) = result {
                error!("Found incomplete record at offset {pos}, truncating file: {err}");
                truncate_to = Some(pos);
                break;
            }
        }
        drop(reader);

        if let Some(len) = truncate_to {
            self.log.set_len(len)?;
        }
        self.garbage_size = self.log.metadata()?.len() - live_size;
        self.keydir = keydir;
        Ok(())
    }

    /// Appends a record to the log, returning the position and length of the
    /// value. A None value appends a tombstone.
    fn write_record(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map(|v| v.len() as u32).unwrap_or(0);
        let record_len = 8 + key_len as u64 + value_len as u64;

        let pos = self.log.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::with_capacity(record_len as usize, &mut self.log);
        writer.write_all(&key_len.to_be_bytes())?;
        writer.write_all(&value.map(|_| value_len).unwrap_or(TOMBSTONE).to_be_bytes())?;
        writer.write_all(key)?;
        if let Some(value) = value {
            writer.write_all(value)?;
        }
        writer.flush()?;

        Ok((pos + 8 + key_len as u64, value_len))
    }

    /// Reads a value from the log at the given position and length.
    fn read_value(log: &mut std::fs::File, value_pos: u64, value_len: u32) -> Result<Vec<u8>> {
        let mut value = vec![0u8; value_len as usize];
        log.seek(SeekFrom::Start(value_pos))?;
        log.read_exact(&mut value)?;
        Ok(value)
    }

    /// Compacts the log by writing out a new file with only live records,
    /// then atomically replacing the old one.
    fn compact(&mut self) -> Result<()> {
        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("new");

        let mut new_log =
            std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&tmp_path)?;
        new_log.try_lock_exclusive()?;

        let mut new_keydir = KeyDir::new();
        let mut pos: u64 = 0;
        let mut writer = BufWriter::new(&mut new_log);
        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = Self::read_value(&mut self.log, *value_pos, *value_len)?;
            writer.write_all(&(key.len() as u32).to_be_bytes())?;
            writer.write_all(&(*value_len).to_be_bytes())?;
            writer.write_all(key)?;
            writer.write_all(&value)?;
            new_keydir.insert(key.clone(), (pos + 8 + key.len() as u64, *value_len));
            pos += 8 + key.len() as u64 + *value_len as u64;
        }
        writer.flush()?;
        drop(writer);
        new_log.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;
        self.log = new_log;
        self.keydir = new_keydir;
        self.garbage_size = 0;
        Ok(())
    }
}

impl Engine for File {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let Some((_, value_len)) = self.keydir.remove(key) else {
            return Ok(());
        };
        self.write_record(key, None)?;
        // Both the old record and the tombstone are now garbage.
        self.garbage_size += 2 * (8 + key.len() as u64) + value_len as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.log.sync_all()?;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some((value_pos, value_len)) = self.keydir.get(key).copied() else {
            return Ok(None);
        };
        Ok(Some(Self::read_value(&mut self.log, value_pos, value_len)?))
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        let Self { log, keydir, .. } = self;
        ScanIterator { inner: keydir.range(range), log }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let (value_pos, value_len) = self.write_record(key, Some(&value))?;
        if let Some((_, old_len)) = self.keydir.insert(key.to_vec(), (value_pos, value_len)) {
            self.garbage_size += 8 + key.len() as u64 + old_len as u64;
        }
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "file".to_string(),
            keys: self.keydir.len() as u64,
            size: self.keydir.iter().map(|(k, (_, len))| k.len() as u64 + *len as u64).sum(),
            disk_size: self.log.metadata()?.len(),
            garbage_size: self.garbage_size,
        })
    }
}

pub struct ScanIterator<'a> {
    inner: Range<'a, Vec<u8>, (u64, u32)>,
    log: &'a mut std::fs::File,
}

impl ScanIterator<'_> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len)) = item;
        Ok((key.clone(), File::read_value(self.log, *value_pos, *value_len)?))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}
