// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation tags and their per-operation wire shape.

use std::fmt;

/// Shape of the reply the helper sends back for an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyKind {
    /// One NUL-terminated status message.
    Status,
    /// Status message, with a descriptor attached on success.
    StatusWithFd,
    /// Status message followed by a NUL-terminated text payload on success.
    StatusWithText,
    /// Fixed-size stat indicator and record, or an error text.
    StatRecord,
    /// Decimal watch id, or an error text.
    WatchId,
}

/// Privileged operation identifier.
///
/// On the wire the tag is the uppercase keyword; the numeric ordinal is kept
/// for logging and for callers that index tables by operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpTag {
    Open = 1,
    Creat = 2,
    Mkdir = 3,
    Unlink = 4,
    Mknod = 5,
    Readlink = 6,
    Rename = 7,
    Link = 8,
    Faccess = 9,
    Fstat = 10,
    AddWatch = 11,
    Init = 12,
    Cleanup = 13,
}

impl OpTag {
    pub const ALL: [OpTag; 13] = [
        OpTag::Open,
        OpTag::Creat,
        OpTag::Mkdir,
        OpTag::Unlink,
        OpTag::Mknod,
        OpTag::Readlink,
        OpTag::Rename,
        OpTag::Link,
        OpTag::Faccess,
        OpTag::Fstat,
        OpTag::AddWatch,
        OpTag::Init,
        OpTag::Cleanup,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn keyword(self) -> &'static str {
        match self {
            OpTag::Open => "OPEN",
            OpTag::Creat => "CREAT",
            OpTag::Mkdir => "MKDIR",
            OpTag::Unlink => "UNLINK",
            OpTag::Mknod => "MKNOD",
            OpTag::Readlink => "READLINK",
            OpTag::Rename => "RENAME",
            OpTag::Link => "LINK",
            OpTag::Faccess => "FACCESS",
            OpTag::Fstat => "FSTAT",
            OpTag::AddWatch => "ADDWATCH",
            OpTag::Init => "INIT",
            OpTag::Cleanup => "CLEANUP",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.keyword() == keyword)
    }

    /// Number of descriptor slots the request may fill.
    pub fn descriptor_slots(self) -> usize {
        match self {
            OpTag::Creat | OpTag::Init | OpTag::Cleanup => 0,
            OpTag::Rename | OpTag::Link | OpTag::AddWatch => 2,
            _ => 1,
        }
    }

    /// Number of integer arguments following the descriptor count.
    pub fn arg_count(self) -> usize {
        match self {
            OpTag::Mknod => 2,
            OpTag::Readlink => 0,
            _ => 1,
        }
    }

    /// Number of path fields.
    pub fn path_count(self) -> usize {
        match self {
            OpTag::Init | OpTag::Cleanup => 0,
            OpTag::Rename | OpTag::Link => 2,
            _ => 1,
        }
    }

    pub fn reply_kind(self) -> ReplyKind {
        match self {
            OpTag::Open | OpTag::Creat | OpTag::Init => ReplyKind::StatusWithFd,
            OpTag::Readlink => ReplyKind::StatusWithText,
            OpTag::Fstat => ReplyKind::StatRecord,
            OpTag::AddWatch => ReplyKind::WatchId,
            _ => ReplyKind::Status,
        }
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}
