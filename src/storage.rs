//! Append-only, newline-delimited persistence for delivered messages.
//!
//! One file per node, flushed synchronously on every write so that a record
//! is never acknowledged as stored until it is actually on disk — refusing
//! to deliver what can't be durably recorded is what keeps the total-order
//! invariant intact across a restart (`ClusterError::StorageFatal`).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{PeerId, SeqNo, Term};
use crate::error::ClusterError;
use crate::wire::DeliveredChat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub seq_no: SeqNo,
    pub term: Term,
    pub sender_id: PeerId,
    pub msg_id: String,
    pub room_id: String,
    pub text: String,
    pub ts: DateTime<Utc>,
}

impl StorageRecord {
    pub fn from_delivered(chat: &DeliveredChat, ts: DateTime<Utc>) -> Self {
        StorageRecord {
            seq_no: chat.seq_no,
            term: chat.term,
            sender_id: chat.origin_sender_id,
            msg_id: chat.msg_id.clone(),
            room_id: chat.room_id.clone(),
            text: chat.payload.clone(),
            ts,
        }
    }

    pub fn to_delivered_chat(&self) -> DeliveredChat {
        DeliveredChat {
            seq_no: self.seq_no,
            term: self.term,
            origin_sender_id: self.sender_id,
            msg_id: self.msg_id.clone(),
            room_id: self.room_id.clone(),
            payload: self.text.clone(),
        }
    }
}

pub struct Storage {
    path: PathBuf,
    file: File,
}

impl Storage {
    /// Opens (creating if needed) `log_dir/node_<self_id>_messages.jsonl`.
    pub fn open(log_dir: &Path, self_id: PeerId) -> Result<Self, ClusterError> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("node_{self_id}_messages.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ClusterError::StorageFatal { path: path.display().to_string(), source: e })?;
        Ok(Storage { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, flushing before returning. The only caller of
    /// this is the delivery path — nothing else may append.
    pub fn append(&mut self, record: &StorageRecord) -> Result<(), ClusterError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| ClusterError::StorageFatal { path: self.path.display().to_string(), source: e })
    }

    /// Streams every record in file order. Used on startup to rehydrate
    /// ordering state and to seed `last_seq`.
    pub fn load_all(&self) -> Result<Vec<StorageRecord>, ClusterError> {
        let reader = BufReader::new(
            File::open(&self.path)
                .map_err(|e| ClusterError::StorageFatal { path: self.path.display().to_string(), source: e })?,
        );
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Records with `seq_no > since`, in ascending order — the catch-up suffix scan.
    pub fn records_after(&self, since: SeqNo) -> Result<Vec<StorageRecord>, ClusterError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.seq_no > since)
            .collect())
    }

    /// Highest `seq_no` observed in the log, or 0 if empty. Seeds ordering
    /// state on startup regardless of role.
    pub fn max_seq_no(&self) -> Result<SeqNo, ClusterError> {
        Ok(self.load_all()?.into_iter().map(|r| r.seq_no).max().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(seq_no: SeqNo) -> StorageRecord {
        StorageRecord {
            seq_no,
            term: 1,
            sender_id: 1,
            msg_id: format!("m{seq_no}"),
            room_id: "general".into(),
            text: format!("hello {seq_no}"),
            ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::open(dir.path(), 1).unwrap();
        storage.append(&sample(1)).unwrap();
        storage.append(&sample(2)).unwrap();
        let records = storage.load_all().unwrap();
        assert_eq!(records, vec![sample(1), sample(2)]);
    }

    #[test]
    fn records_after_is_a_suffix_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::open(dir.path(), 2).unwrap();
        for n in 1..=5 {
            storage.append(&sample(n)).unwrap();
        }
        let suffix = storage.records_after(3).unwrap();
        let seqs: Vec<_> = suffix.iter().map(|r| r.seq_no).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn max_seq_no_is_zero_for_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), 3).unwrap();
        assert_eq!(storage.max_seq_no().unwrap(), 0);
    }

    #[test]
    fn max_seq_no_reflects_highest_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::open(dir.path(), 4).unwrap();
        storage.append(&sample(7)).unwrap();
        storage.append(&sample(3)).unwrap();
        assert_eq!(storage.max_seq_no().unwrap(), 7);
    }

    #[test]
    fn reopening_seeds_from_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = Storage::open(dir.path(), 5).unwrap();
            storage.append(&sample(1)).unwrap();
        }
        let storage = Storage::open(dir.path(), 5).unwrap();
        assert_eq!(storage.max_seq_no().unwrap(), 1);
    }
}
