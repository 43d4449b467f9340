//! Status and policy types shared by the store and the engine.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Failed,
    Published,
    DeadLetter,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 4] = [
        Self::Pending,
        Self::Failed,
        Self::Published,
        Self::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
            Self::Published => "PUBLISHED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Parse a stored status. Unknown values yield `None` rather than a
    /// silent default, since a bad status would corrupt selection.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "FAILED" => Some(Self::Failed),
            "PUBLISHED" => Some(Self::Published),
            "DEAD_LETTER" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// PUBLISHED and DEAD_LETTER accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::DeadLetter)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for OutboxStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OutboxStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Self::from_str(raw).ok_or_else(|| {
            FromSqlError::Other(format!("unknown outbox status: {raw}").into())
        })
    }
}

/// Which predecessor states hold back a later version of the same aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Anything not yet PUBLISHED blocks, including DEAD_LETTER. A
    /// dead-lettered entry therefore stalls its aggregate until an operator
    /// intervenes.
    #[default]
    BlockOnDeadLetter,
    /// Only PENDING and FAILED predecessors block.
    SkipDeadLetter,
}

impl OrderingPolicy {
    pub fn from_skip_dead_letter(skip: bool) -> Self {
        if skip {
            Self::SkipDeadLetter
        } else {
            Self::BlockOnDeadLetter
        }
    }

    /// SQL list of statuses that do NOT block a successor.
    pub(crate) fn non_blocking_statuses(&self) -> &'static str {
        match self {
            Self::BlockOnDeadLetter => "('PUBLISHED')",
            Self::SkipDeadLetter => "('PUBLISHED', 'DEAD_LETTER')",
        }
    }
}
