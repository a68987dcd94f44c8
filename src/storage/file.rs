use super::{ConfigStore, LogStore, MemoryLog, TermStore};
use crate::encoding::{bincode, Value as _};
use crate::error::{Error, Result};
use crate::raft::{Entry, Index, Membership, RaftId, Term, NO_INDEX};

use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

/// Atomically replaces the file at path with the given contents: the data is
/// written and fsynced to a temporary sibling file, which is then renamed over
/// the target. A crash leaves either the old or the new contents, never a mix.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, path)?;

    // Sync the directory, so the rename itself is durable.
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Reads a file, or returns None if it does not exist.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// A term store backed by a single file, holding the Bincode-encoded term and
/// vote. The file is replaced atomically on every write.
pub struct FileTermStore {
    path: PathBuf,
    cache: (Term, Option<RaftId>),
}

impl FileTermStore {
    /// Opens a term store at the given path, creating parent directories as
    /// needed. A missing file yields term 0 without a vote.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let cache = match read_optional(&path)? {
            Some(data) => bincode::deserialize(&data)?,
            None => (0, None),
        };
        Ok(Self { path, cache })
    }
}

impl TermStore for FileTermStore {
    fn load(&self) -> Result<(Term, Option<RaftId>)> {
        Ok(self.cache)
    }

    fn persist(&mut self, term: Term, voted_for: Option<RaftId>) -> Result<()> {
        write_atomic(&self.path, &bincode::serialize(&(term, voted_for))?)?;
        self.cache = (term, voted_for);
        Ok(())
    }
}

/// A membership config store backed by a single file. If the file does not
/// exist, the initial members are used until a config change is persisted.
pub struct FileConfigStore {
    path: PathBuf,
    current: Membership,
}

impl FileConfigStore {
    /// Opens a config store at the given path.
    pub fn open(path: impl AsRef<Path>, initial: impl IntoIterator<Item = RaftId>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let current = match read_optional(&path)? {
            Some(data) => Membership::decode(&data)?,
            None => Membership::new(initial, NO_INDEX),
        };
        Ok(Self { path, current })
    }
}

impl ConfigStore for FileConfigStore {
    fn current(&self) -> Result<Membership> {
        Ok(self.current.clone())
    }

    fn persist(&mut self, membership: &Membership) -> Result<()> {
        write_atomic(&self.path, &membership.encode()?)?;
        self.current = membership.clone();
        Ok(())
    }
}

/// A log file record. The log is the replay of all records in order.
#[derive(Debug, Serialize, Deserialize)]
enum Record {
    Append(Entry),
    TruncateFrom(Index),
    Base(Index, Term),
}

/// A log store backed by an append-only file of length-prefixed Bincode
/// records, with a copy of the log kept in memory for reads. The file is
/// replayed on open. Compaction and resets rewrite the file atomically with
/// only the retained entries.
///
/// Appends are buffered until flush(), which fsyncs the file. A torn record
/// at the end of the file, from a crash during a write, is discarded on open.
pub struct FileLog {
    path: PathBuf,
    file: BufWriter<File>,
    log: MemoryLog,
}

impl FileLog {
    /// Opens a log file at the given path, creating it and its parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = read_optional(&path)?.unwrap_or_default();

        let mut log = MemoryLog::new();
        let mut pos = 0;
        while let Some((record, len)) = Self::decode_record(&data[pos..])? {
            match record {
                Record::Append(entry) => log.append(entry)?,
                Record::TruncateFrom(index) => log.truncate_from(index)?,
                Record::Base(index, term) => log.reset(index, term)?,
            }
            pos += len;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if pos < data.len() {
            let torn = data.len() - pos;
            warn!("Discarding {torn} bytes of torn log records in {}", path.display());
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }
        Ok(Self { path, file: BufWriter::new(file), log })
    }

    /// Decodes a record from the start of the buffer, returning it along with
    /// its encoded length. Returns None if the buffer holds no complete
    /// record.
    fn decode_record(buf: &[u8]) -> Result<Option<(Record, usize)>> {
        let Some(header) = buf.get(..4) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let Some(body) = buf.get(4..4 + len) else {
            return Ok(None);
        };
        Ok(Some((bincode::deserialize(body)?, 4 + len)))
    }

    /// Encodes a length-prefixed record into the buffer.
    fn encode_record(buf: &mut Vec<u8>, record: &Record) -> Result<()> {
        let body = bincode::serialize(record)?;
        let len = u32::try_from(body.len())
            .map_err(|_| Error::InvalidInput(format!("log record of {} bytes", body.len())))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Appends a record to the file buffer.
    fn write(&mut self, record: &Record) -> Result<()> {
        let mut buf = Vec::new();
        Self::encode_record(&mut buf, record)?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Atomically replaces the file with the base and retained entries.
    fn rewrite(&mut self) -> Result<()> {
        self.file.flush()?;
        let (base_index, base_term) = self.log.base();
        let mut data = Vec::new();
        Self::encode_record(&mut data, &Record::Base(base_index, base_term))?;
        for index in base_index + 1..=self.log.last_index() {
            if let Some(entry) = self.log.get(index)? {
                Self::encode_record(&mut data, &Record::Append(entry))?;
            }
        }
        write_atomic(&self.path, &data)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.file = BufWriter::new(file);
        Ok(())
    }
}

impl LogStore for FileLog {
    fn append(&mut self, entry: Entry) -> Result<()> {
        let record = Record::Append(entry.clone());
        self.log.append(entry)?;
        self.write(&record)
    }

    fn get(&self, index: Index) -> Result<Option<Entry>> {
        self.log.get(index)
    }

    fn truncate_from(&mut self, index: Index) -> Result<()> {
        self.log.truncate_from(index)?;
        self.write(&Record::TruncateFrom(index))
    }

    fn last_index(&self) -> Index {
        self.log.last_index()
    }

    fn base(&self) -> (Index, Term) {
        self.log.base()
    }

    fn compact(&mut self, index: Index, term: Term) -> Result<()> {
        self.log.compact(index, term)?;
        self.rewrite()
    }

    fn reset(&mut self, index: Index, term: Term) -> Result<()> {
        self.log.reset(index, term)?;
        self.rewrite()
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}
