//! Append-only command log with CRC-verified records.
//!
//! Every record on disk is framed as
//!
//! ```text
//! [id: i32 LE][size: u32 LE][payload: size bytes][crc32c: u32 LE]
//! ```
//!
//! with the CRC covering the first three fields, seed 0. The log is the
//! durability gate for the engine: a mutation reaches the in-memory store
//! only after the log has accepted it.
//!
//! Two operating modes, fixed when the engine is opened:
//!
//! - **sync-always** (flush interval zero): each append writes and fsyncs
//!   inline, so durability is established before `append` returns.
//! - **batched**: appends are copied into a bounded ring and a background
//!   writer drains the ring, amortizing one fsync over the whole batch
//!   (group commit). An append is durable within one flush interval.

mod ring;
#[cfg(test)]
mod recovery_tests;

use crate::crc32c::crc32c;
use crate::error::{Error, Result};
use crate::store::Store;

use self::ring::{Command, Ring};
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Bytes of framing around each payload: id + size + crc.
const RECORD_OVERHEAD: u64 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushMode {
    /// Write + fsync inline on every append.
    Always,
    /// Ring handoff to the background writer, which groups fsyncs and then
    /// sleeps for the given interval (or until signalled).
    Batched(Duration),
}

/// State shared between producers, the background writer, and rewrite.
///
/// The live append fd sits under the same mutex as the ring: rewrite pauses
/// the writer and swaps the fd by simply holding the lock.
struct State {
    ring: Ring,
    file: File,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    /// One condvar serves both waits: producers sleeping on a full ring and
    /// the writer sleeping on an empty one. Wakeups always use `notify_all`.
    cond: Condvar,
}

/// The append-only log engine.
///
/// Owned value; several engines (with distinct paths) coexist in one
/// process. Dropping the engine stops the writer thread, flushing whatever
/// is still in the ring.
pub struct AofEngine {
    path: PathBuf,
    mode: FlushMode,
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
}

impl AofEngine {
    /// Opens (creating if needed) the log at `path` in append mode.
    ///
    /// `flush_interval` zero selects sync-always mode; otherwise the batched
    /// writer thread is started with the given group-commit interval.
    /// `ring_capacity` is rounded up to a power of two and only matters in
    /// batched mode.
    pub fn open(
        path: impl Into<PathBuf>,
        ring_capacity: usize,
        flush_interval: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let mode = if flush_interval.is_zero() {
            FlushMode::Always
        } else {
            FlushMode::Batched(flush_interval)
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                ring: Ring::with_capacity(ring_capacity),
                file,
                running: true,
            }),
            cond: Condvar::new(),
        });

        let writer = match mode {
            FlushMode::Always => None,
            FlushMode::Batched(interval) => {
                let shared = Arc::clone(&shared);
                Some(
                    std::thread::Builder::new()
                        .name("perunkv-aof-writer".into())
                        .spawn(move || writer_loop(&shared, interval))?,
                )
            }
        };

        Ok(Self {
            path,
            mode,
            shared,
            writer,
        })
    }

    /// Path of the live log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record.
    ///
    /// In sync-always mode the record is on disk when this returns; any I/O
    /// failure surfaces here and the caller must not apply the mutation to
    /// the store. In batched mode the payload is copied into the ring
    /// (blocking while the ring is full) and becomes durable at the writer's
    /// next group commit.
    pub fn append(&self, id: i32, payload: &[u8]) -> Result<()> {
        if u32::try_from(payload.len()).is_err() {
            return Err(Error::PayloadTooLarge { len: payload.len() });
        }
        match self.mode {
            FlushMode::Always => {
                let mut state = self.shared.state.lock();
                write_record(&mut state.file, id, payload)?;
                state.file.sync_all()?;
                Ok(())
            }
            FlushMode::Batched(_) => {
                let command = Command {
                    id,
                    payload: payload.into(),
                };
                let mut state = self.shared.state.lock();
                while state.ring.is_full() && state.running {
                    self.shared.cond.wait(&mut state);
                }
                if !state.running {
                    return Err(Error::LogClosed);
                }
                state.ring.push(command);
                self.shared.cond.notify_all();
                Ok(())
            }
        }
    }

    /// Drains and fsyncs any pending appends inline.
    ///
    /// No-op in sync-always mode. Useful before handing the log file to an
    /// external reader.
    pub fn flush(&self) -> Result<()> {
        if self.mode == FlushMode::Always {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        drain_to_disk(&mut state)?;
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Replays the log into `store`, front to back, returning the number of
    /// records applied.
    ///
    /// A missing file is not an error (the log simply has nothing to say).
    /// A short read or CRC mismatch is corruption: the error carries the
    /// byte offset of the offending record and the host must treat it as
    /// fatal rather than serve partial state.
    pub fn load(&self, store: &mut Store) -> Result<usize> {
        replay_into(&self.path, store)
    }

    /// Rewrites the log so it holds exactly the current live records
    /// (compaction), atomically replacing the old file.
    ///
    /// In batched mode `store` is authoritative and is dumped as-is; the
    /// writer is then paused, the ring drained to the old file, and the new
    /// file renamed into place. In sync-always mode the log itself is
    /// authoritative: the existing file is replayed into a scratch store
    /// while the engine lock blocks concurrent appends, and the scratch
    /// contents become the new log.
    ///
    /// Crash safety hinges on the rename: before it the old log is intact,
    /// after it the new one is committed, and a leftover `.tmp` is garbage.
    /// Callers serialize appends against rewrite; [`crate::Engine`] does so
    /// with its store lock.
    pub fn rewrite(&self, store: &Store) -> Result<()> {
        let tmp = tmp_path(&self.path);
        match self.mode {
            FlushMode::Always => {
                // Hold the lock across replay + swap so no append lands
                // between deriving the state and committing the new file.
                let mut state = self.shared.state.lock();
                let mut replayed = Store::new();
                replay_into(&self.path, &mut replayed)?;
                dump_records(replayed.iter(), &tmp)?;
                std::fs::rename(&tmp, &self.path)?;
                state.file = open_append(&self.path)?;
            }
            FlushMode::Batched(_) => {
                dump_records(store.iter(), &tmp)?;
                let mut state = self.shared.state.lock();
                drain_to_disk(&mut state)?;
                std::fs::rename(&tmp, &self.path)?;
                state.file = open_append(&self.path)?;
                self.shared.cond.notify_all();
            }
        }
        tracing::info!(path = %self.path.display(), "log rewrite complete");
        Ok(())
    }
}

impl Drop for AofEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.writer.take() {
            {
                let mut state = self.shared.state.lock();
                state.running = false;
            }
            self.shared.cond.notify_all();
            // The writer drains residual ring entries before exiting.
            let _ = handle.join();
        }
    }
}

/// Background writer: wait for work, drain the whole ring, one fsync for
/// the batch, then sleep until the flush interval elapses or a producer
/// signals.
fn writer_loop(shared: &Shared, interval: Duration) {
    loop {
        let mut state = shared.state.lock();
        while state.ring.is_empty() && state.running {
            shared.cond.wait(&mut state);
        }
        if let Err(err) = drain_to_disk(&mut state) {
            tracing::error!("log writer: {err}");
        }
        let running = state.running;
        shared.cond.notify_all();
        drop(state);
        if !running {
            break;
        }

        let mut state = shared.state.lock();
        if state.running && state.ring.is_empty() {
            let _ = shared.cond.wait_for(&mut state, interval);
        }
    }
}

/// Writes every ring entry to the live fd and issues a single fsync.
/// Returns the number of records committed.
fn drain_to_disk(state: &mut State) -> Result<usize> {
    if state.ring.is_empty() {
        return Ok(0);
    }
    let mut committed = 0usize;
    while let Some(command) = state.ring.pop() {
        write_record(&mut state.file, command.id, &command.payload)?;
        committed += 1;
    }
    state.file.sync_all()?;
    tracing::trace!(records = committed, "group commit");
    Ok(committed)
}

/// Emits one framed record, folding the CRC over id, size, and payload.
fn write_record<W: Write>(out: &mut W, id: i32, payload: &[u8]) -> Result<()> {
    let size = u32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge {
        len: payload.len(),
    })?;
    let id_bytes = id.to_le_bytes();
    let size_bytes = size.to_le_bytes();
    let mut crc = crc32c(0, &id_bytes);
    crc = crc32c(crc, &size_bytes);
    crc = crc32c(crc, payload);
    out.write_all(&id_bytes)?;
    out.write_all(&size_bytes)?;
    out.write_all(payload)?;
    out.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Sequential replay of a log file. See [`AofEngine::load`].
fn replay_into(path: &Path, store: &mut Store) -> Result<usize> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;
    let mut applied = 0usize;

    loop {
        let mut id_bytes = [0u8; 4];
        match read_or_eof(&mut reader, &mut id_bytes)? {
            0 => break, // clean end of log
            4 => {}
            _ => return Err(Error::LogCorruption { offset }),
        }
        let id = i32::from_le_bytes(id_bytes);

        let mut size_bytes = [0u8; 4];
        read_field(&mut reader, &mut size_bytes, offset)?;
        let size = u32::from_le_bytes(size_bytes);
        let len = usize::try_from(size).map_err(|_| Error::LogCorruption { offset })?;

        let mut payload = vec![0u8; len];
        read_field(&mut reader, &mut payload, offset)?;

        let mut crc_bytes = [0u8; 4];
        read_field(&mut reader, &mut crc_bytes, offset)?;
        let stored = u32::from_le_bytes(crc_bytes);

        let mut crc = crc32c(0, &id_bytes);
        crc = crc32c(crc, &size_bytes);
        crc = crc32c(crc, &payload);
        if crc != stored {
            return Err(Error::LogCorruption { offset });
        }

        store.save(id, &payload);
        applied += 1;
        offset += RECORD_OVERHEAD + u64::from(size);
    }
    Ok(applied)
}

/// Dumps records through the framing writer into a fresh temp file, fsyncs,
/// and leaves it ready for rename.
fn dump_records<'a, I>(records: I, tmp: &Path) -> Result<()>
where
    I: IntoIterator<Item = (i32, &'a [u8])>,
{
    let mut out = BufWriter::new(open_truncate(tmp)?);
    for (id, payload) in records {
        write_record(&mut out, id, payload)?;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

/// Reads as many bytes as the file still has, up to `buf.len()`. A zero
/// return distinguishes clean EOF from a torn record.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// `read_exact` that reports a torn record as corruption at `record_start`.
fn read_field(reader: &mut impl Read, buf: &mut [u8], record_start: u64) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::LogCorruption {
                offset: record_start,
            }
        } else {
            Error::Io(err)
        }
    })
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn open_truncate(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
