// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Binary stat reply.
//!
//! The helper first writes an 8-byte native-endian indicator. Zero means a
//! 32-byte record follows: `dev: i64, ino: i64, size: i64, type: i32,
//! blksize: i32`, all native-endian. Any other value means a NUL-terminated
//! error text follows instead.

use serde::{Deserialize, Serialize};

pub const STAT_INDICATOR_LEN: usize = 8;
pub const STAT_RECORD_LEN: usize = 32;

/// Coarse file type carried in the stat record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    pub fn ordinal(self) -> i32 {
        match self {
            FileType::Regular => 0,
            FileType::Directory => 1,
            FileType::Symlink => 2,
            FileType::Other => 3,
        }
    }

    /// Unknown ordinals decode as [`FileType::Other`].
    pub fn from_ordinal(ordinal: i32) -> Self {
        match ordinal {
            0 => FileType::Regular,
            1 => FileType::Directory,
            2 => FileType::Symlink,
            _ => FileType::Other,
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => FileType::Regular,
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            _ => FileType::Other,
        }
    }
}

/// Fixed subset of file metadata returned by the privileged `fstat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub dev: u64,
    pub ino: u64,
    pub size: i64,
    pub file_type: FileType,
    pub blksize: i32,
}

impl StatSnapshot {
    pub fn from_stat(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            size: st.st_size as i64,
            file_type: FileType::from_mode(st.st_mode as u32),
            blksize: st.st_blksize as i32,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn to_record(&self) -> [u8; STAT_RECORD_LEN] {
        let mut out = [0u8; STAT_RECORD_LEN];
        out[0..8].copy_from_slice(&(self.dev as i64).to_ne_bytes());
        out[8..16].copy_from_slice(&(self.ino as i64).to_ne_bytes());
        out[16..24].copy_from_slice(&self.size.to_ne_bytes());
        out[24..28].copy_from_slice(&self.file_type.ordinal().to_ne_bytes());
        out[28..32].copy_from_slice(&self.blksize.to_ne_bytes());
        out
    }

    pub fn from_record(record: &[u8; STAT_RECORD_LEN]) -> Self {
        let i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&record[at..at + 8]);
            i64::from_ne_bytes(b)
        };
        let i32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&record[at..at + 4]);
            i32::from_ne_bytes(b)
        };
        Self {
            dev: i64_at(0) as u64,
            ino: i64_at(8) as u64,
            size: i64_at(16),
            file_type: FileType::from_ordinal(i32_at(24)),
            blksize: i32_at(28),
        }
    }

    /// Indicator plus record, as the helper sends it on success.
    pub fn encode_reply(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STAT_INDICATOR_LEN + STAT_RECORD_LEN);
        out.extend_from_slice(&0i64.to_ne_bytes());
        out.extend_from_slice(&self.to_record());
        out
    }
}

/// Indicator plus error text, as the helper sends it on failure.
pub fn encode_stat_failure(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(STAT_INDICATOR_LEN + text.len() + 1);
    out.extend_from_slice(&1i64.to_ne_bytes());
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

/// Result of decoding the binary part of a stat reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatOutcome {
    Snapshot(StatSnapshot),
    /// A NUL-terminated error text follows on the stream.
    ErrorFollows,
}

/// Incremental decoder that accepts the reply in arbitrary chunks.
#[derive(Debug, Default)]
pub struct StatRecordDecoder {
    indicator: [u8; STAT_INDICATOR_LEN],
    record: [u8; STAT_RECORD_LEN],
    filled: usize,
    outcome: Option<StatOutcome>,
}

impl StatRecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes from `chunk`; returns how many were used and whether
    /// decoding is complete. Never consumes past the end of the reply.
    pub fn feed(&mut self, chunk: &[u8]) -> (usize, bool) {
        let mut used = 0;
        while self.outcome.is_none() && used < chunk.len() {
            if self.filled < STAT_INDICATOR_LEN {
                let take = (STAT_INDICATOR_LEN - self.filled).min(chunk.len() - used);
                self.indicator[self.filled..self.filled + take]
                    .copy_from_slice(&chunk[used..used + take]);
                self.filled += take;
                used += take;
                if self.filled == STAT_INDICATOR_LEN && i64::from_ne_bytes(self.indicator) != 0 {
                    self.outcome = Some(StatOutcome::ErrorFollows);
                }
            } else {
                let offset = self.filled - STAT_INDICATOR_LEN;
                let take = (STAT_RECORD_LEN - offset).min(chunk.len() - used);
                self.record[offset..offset + take].copy_from_slice(&chunk[used..used + take]);
                self.filled += take;
                used += take;
                if offset + take == STAT_RECORD_LEN {
                    self.outcome = Some(StatOutcome::Snapshot(StatSnapshot::from_record(&self.record)));
                }
            }
        }
        (used, self.outcome.is_some())
    }

    pub fn outcome(&self) -> Option<StatOutcome> {
        self.outcome
    }
}
