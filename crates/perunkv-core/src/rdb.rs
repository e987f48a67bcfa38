//! Point-in-time snapshot dump and load.
//!
//! A snapshot is the stream of live records followed by a 4-byte footer:
//!
//! ```text
//! ([id: i32 LE][size: u64 LE][payload: size bytes])* [crc32c: u32 LE]
//! ```
//!
//! The footer is the rolling CRC32C of every byte before it, seed 0. The
//! size field is pinned to 64-bit little-endian so files are portable
//! across platforms.
//!
//! Dumps go through `<path>.tmp` and an atomic rename, so a crash mid-dump
//! leaves the previous snapshot untouched.

use crate::crc32c::crc32c;
use crate::error::{Error, Result};
use crate::store::Store;

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Width of the trailing checksum.
const FOOTER_LEN: u64 = 4;

/// Fixed bytes per record before the payload: id + 64-bit size.
const RECORD_HEADER_LEN: u64 = 12;

/// Streams `records` into a fresh snapshot at `path`.
///
/// Writes to `<path>.tmp`, fsyncs, then renames over the destination. The
/// iteration order does not matter; load rebuilds the store record by
/// record.
pub fn dump<'a, I>(records: I, path: &Path) -> Result<()>
where
    I: IntoIterator<Item = (i32, &'a [u8])>,
{
    let tmp = tmp_path(path);
    let mut out = BufWriter::new(open_truncate(&tmp)?);
    let mut crc = 0u32;
    let mut count = 0usize;

    for (id, payload) in records {
        let id_bytes = id.to_le_bytes();
        let size_bytes = (payload.len() as u64).to_le_bytes();
        out.write_all(&id_bytes)?;
        out.write_all(&size_bytes)?;
        out.write_all(payload)?;
        crc = crc32c(crc, &id_bytes);
        crc = crc32c(crc, &size_bytes);
        crc = crc32c(crc, payload);
        count += 1;
    }

    out.write_all(&crc.to_le_bytes())?;
    out.flush()?;
    out.get_ref().sync_all()?;
    drop(out);

    std::fs::rename(&tmp, path)?;
    tracing::debug!(records = count, path = %path.display(), "snapshot written");
    Ok(())
}

/// Loads a snapshot into `store`, verifying the footer, and returns the
/// number of records applied.
///
/// A missing file, or one too short to carry a footer, loads nothing and
/// returns cleanly. A footer mismatch or torn record is corruption; the
/// host must treat it as fatal rather than start from partial state.
pub fn load(store: &mut Store, path: &Path) -> Result<usize> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let file_len = file.metadata()?.len();
    if file_len < FOOTER_LEN {
        return Ok(0);
    }
    let body_len = file_len - FOOTER_LEN;

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::End(-4))?;
    let mut footer = [0u8; 4];
    reader.read_exact(&mut footer)?;
    let stored = u32::from_le_bytes(footer);
    reader.seek(SeekFrom::Start(0))?;

    let mut crc = 0u32;
    let mut pos = 0u64;
    let mut applied = 0usize;

    while pos < body_len {
        let mut id_bytes = [0u8; 4];
        let mut size_bytes = [0u8; 8];
        read_body(&mut reader, &mut id_bytes, stored, crc)?;
        read_body(&mut reader, &mut size_bytes, stored, crc)?;
        let size = u64::from_le_bytes(size_bytes);

        // A size pointing past the body means the length field itself is
        // garbage; fail before trying to allocate it.
        if pos + RECORD_HEADER_LEN + size > body_len {
            return Err(Error::SnapshotCorruption { computed: crc, stored });
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by body_len above
        let mut payload = vec![0u8; size as usize];
        read_body(&mut reader, &mut payload, stored, crc)?;

        crc = crc32c(crc, &id_bytes);
        crc = crc32c(crc, &size_bytes);
        crc = crc32c(crc, &payload);

        store.save(i32::from_le_bytes(id_bytes), &payload);
        applied += 1;
        pos += RECORD_HEADER_LEN + size;
    }

    if crc != stored {
        return Err(Error::SnapshotCorruption { computed: crc, stored });
    }
    Ok(applied)
}

/// `read_exact` that reports a torn snapshot body as corruption.
fn read_body(reader: &mut impl Read, buf: &mut [u8], stored: u32, computed: u32) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::SnapshotCorruption { computed, stored }
        } else {
            Error::Io(err)
        }
    })
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
