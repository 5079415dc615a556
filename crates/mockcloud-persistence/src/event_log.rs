//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Journal storage bindings for the resource store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::warn;

use crate::{PersistenceError, Result};

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Header stored as the first line of every journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl JournalHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        Self {
            version: JOURNAL_VERSION,
            hash: header_hash(&created_at),
            created_at,
        }
    }

    fn verify(&self) -> Result<()> {
        if self.version != JOURNAL_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: self.version,
                expected: JOURNAL_VERSION,
            });
        }
        if self.hash != header_hash(&self.created_at) {
            return Err(PersistenceError::HashMismatch);
        }
        Ok(())
    }
}

fn header_hash(created_at: &DateTime<Utc>) -> String {
    format!(
        "{:x}",
        sha2::Sha256::digest(created_at.to_rfc3339().as_bytes())
    )
}

/// Entry captured in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload describing the mutation.
    pub payload: serde_json::Value,
}

impl JournalEntry {
    /// Construct an entry with the provided payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Append-only writer for the journal.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl JournalWriter {
    /// Open a journal for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if fresh {
            let line = serde_json::to_string(&JournalHeader::new())?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            return Ok(Self {
                path: path.to_path_buf(),
                writer,
                next_sequence: 0,
            });
        }

        let next_sequence = last_sequence(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append a new entry and return the assigned sequence number and byte count.
    pub fn append(&mut self, mut entry: JournalEntry) -> Result<(u64, usize)> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        let bytes = line.len() + 1;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok((entry.sequence, bytes))
    }

    /// Flush buffered writes to the underlying file handle.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Path of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_header(reader: &mut BufReader<File>) -> Result<()> {
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    if first_line.trim().is_empty() {
        return Ok(());
    }
    let header: JournalHeader = serde_json::from_str(first_line.trim_end())?;
    header.verify()
}

fn last_sequence(path: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader)?;
    let mut last_seq = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => last_seq = entry.sequence,
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable journal line"),
        }
    }
    Ok(last_seq)
}

/// Replay the journal in order, invoking the callback for each entry.
///
/// A missing journal replays zero entries.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(JournalEntry) -> Result<()>,
{
    if !path.exists() {
        return Ok(0);
    }
    let mut count = 0usize;
    for entry in JournalReader::open(path)? {
        handler(entry?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over journal entries.
#[derive(Debug)]
pub struct JournalReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl JournalReader {
    /// Open the journal for sequential reading, verifying its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        read_header(&mut reader)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
