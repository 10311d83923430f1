use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_RECORD_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Largest payload a record may carry. Anything longer is a corrupt length prefix.
const MAX_RECORD_LEN: u32 = 1 << 20;

/// Read one `[len][bincode][crc32]` record. `Ok(None)` means the log ends here,
/// either cleanly or at a torn/corrupt record.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of reading a WAL back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Bytes after the last valid record (torn write or corruption).
    pub discarded_bytes: u64,
}

/// Append-only write-ahead log of shop and reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little-endian.
/// A torn last entry (crash mid-append) is dropped on replay via the
/// length prefix and CRC.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    /// Appends buffered since then.
    pending: u64,
    appends_since_compact: u64,
    /// Set when a rollback failed; the file may hold unacknowledged records.
    poisoned: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            pending: 0,
            appends_since_compact: 0,
            poisoned: false,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. The group-commit writer calls
    /// `flush_sync()` once per batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        self.pending += 1;
        encode_event(&mut self.writer, event)
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Forget everything appended since the last successful `flush_sync`:
    /// drop the buffer and cut the file back, so a batch that was reported
    /// as failed can never be written out by a later flush.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending = 0;
        let result = self.reset_to_synced();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn reset_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // Swap in a fresh writer; the old buffer is dropped unwritten.
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (old_file, _unwritten) = old.into_parts();
        old_file.set_len(self.synced_len)?;
        old_file.sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.compact")
    }

    /// Rewrite the log as exactly `events`: write a sibling file, fsync it,
    /// rename it over the live log, then reopen for appending.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.compact_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending = 0;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Read every valid event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut consumed: u64 = 0;

        while let Some(event) = decode_event(&mut reader)? {
            consumed += record_len(&event)?;
            events.push(event);
        }

        Ok(Replay {
            events,
            discarded_bytes: total.saturating_sub(consumed),
        })
    }
}

/// Cut `bytes` off the end of the log so new appends follow the last valid entry.
pub fn truncate_tail(path: &Path, bytes: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(bytes))?;
    file.sync_all()
}

fn record_len(event: &Event) -> io::Result<u64> {
    let payload = bincode::serialized_size(event)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(payload + 8)
}
