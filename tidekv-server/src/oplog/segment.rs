//! Segment files
//!
//! Every record is framed as:
//! - size (u64, big endian)
//! - checksum (crc32 of the data, u32)
//! - data (bincode-encoded `OplogEntry`)
//!
//! Segment names carry the log epoch and the first sequence number they hold,
//! e.g. `00000003-00000000000000000001.seg`.

use super::types::{OplogEntry, OplogError, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

const RECORD_HEADER_LEN: u64 = 12;
const SEGMENT_EXT: &str = ".seg";

pub fn segment_file_name(epoch: u64, first_seq: u64) -> String {
    format!("{:08}-{:020}{}", epoch, first_seq, SEGMENT_EXT)
}

/// Parse `(epoch, first_seq)` out of a segment file name
pub fn parse_segment_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(SEGMENT_EXT)?;
    let (epoch, first_seq) = stem.split_once('-')?;
    Some((epoch.parse().ok()?, first_seq.parse().ok()?))
}

/// Encode one framed record
pub fn encode_record(entry: &OplogEntry) -> Result<Vec<u8>> {
    let data = bincode::serialize(entry)?;
    let checksum = crc32fast::hash(&data);

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN as usize + data.len());
    record.extend_from_slice(&(data.len() as u64).to_be_bytes());
    record.extend_from_slice(&checksum.to_be_bytes());
    record.extend_from_slice(&data);
    Ok(record)
}

/// Result of scanning a segment file
#[derive(Debug)]
pub struct SegmentScan {
    pub entries: Vec<OplogEntry>,
    /// Length of the prefix made of complete, verified records
    pub valid_len: u64,
    /// Why the scan stopped before the end of the file, if it did
    pub torn: Option<String>,
}

/// Read every verified record of a segment
///
/// A short or bad record at the very end of the file is reported as `torn`.
/// A bad record followed by further data is `OplogError::Corrupted`.
pub async fn read_segment(path: &Path) -> Result<SegmentScan> {
    let file = File::open(path).await?;
    let total_len = file.metadata().await?.len();
    let mut reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    let mut torn = None;

    while valid_len < total_len {
        let remaining = total_len - valid_len;
        if remaining < RECORD_HEADER_LEN {
            torn = Some("incomplete record header".to_string());
            break;
        }

        let size = reader.read_u64().await?;
        let expected = reader.read_u32().await?;

        if size > remaining - RECORD_HEADER_LEN {
            torn = Some(format!("incomplete record body ({} bytes announced)", size));
            break;
        }

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data).await?;

        let record_end = valid_len + RECORD_HEADER_LEN + size;
        let actual = crc32fast::hash(&data);
        let bad = if actual != expected {
            Some(format!(
                "checksum mismatch at offset {}: expected {}, got {}",
                valid_len, expected, actual
            ))
        } else {
            match bincode::deserialize::<OplogEntry>(&data) {
                Ok(entry) => {
                    entries.push(entry);
                    None
                }
                Err(e) => Some(format!("undecodable record at offset {}: {}", valid_len, e)),
            }
        };

        if let Some(reason) = bad {
            // Only the final record of a file can be a torn write
            if record_end < total_len {
                return Err(OplogError::Corrupted {
                    path: path.to_path_buf(),
                    reason,
                });
            }
            torn = Some(reason);
            break;
        }

        valid_len = record_end;
    }

    debug!(
        "Scanned segment {:?}: {} records, {} valid bytes",
        path,
        entries.len(),
        valid_len
    );

    Ok(SegmentScan {
        entries,
        valid_len,
        torn,
    })
}

/// Append handle on the active segment
pub struct SegmentWriter {
    file: BufWriter<File>,
    path: PathBuf,
    first_seq: u64,
    entries: u64,
    /// Bytes covered by acknowledged records
    len: u64,
}

impl SegmentWriter {
    /// Create a new, empty segment
    pub async fn create(dir: &Path, epoch: u64, first_seq: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(epoch, first_seq));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.sync_all().await?;

        debug!("Created oplog segment {:?}", path);

        Ok(Self {
            file: BufWriter::new(file),
            path,
            first_seq,
            entries: 0,
            len: 0,
        })
    }

    /// Reopen an existing segment for appending, cutting anything past `valid_len`
    pub async fn open(path: PathBuf, first_seq: u64, entries: u64, valid_len: u64) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(&path).await?;
        if file.metadata().await?.len() != valid_len {
            file.set_len(valid_len).await?;
            file.sync_all().await?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path).await?;

        Ok(Self {
            file: BufWriter::new(file),
            path,
            first_seq,
            entries,
            len: valid_len,
        })
    }

    /// Write one record; `sync` forces it to stable storage
    pub async fn append(&mut self, record: &[u8], sync: bool) -> Result<()> {
        self.file.write_all(record).await?;
        self.file.flush().await?;
        if sync {
            self.file.get_ref().sync_data().await?;
        }

        self.len += record.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Drop whatever a failed append left behind
    pub async fn rollback(&mut self) -> Result<()> {
        warn!(
            "Rolling back oplog segment {:?} to {} bytes",
            self.path, self.len
        );

        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(self.len).await?;
        file.sync_all().await?;
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path).await?;
        self.file = BufWriter::new(file);
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }
}
