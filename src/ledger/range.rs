use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ingest::IngestError;

/// Inclusive ledger range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerRange {
    start: u32,
    end: u32,
}

impl LedgerRange {
    /// Returns [`IngestError::InvalidRange`] when `start > end` or `start == 0`.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start == 0 || start > end {
            return Err(IngestError::InvalidRange { from: start, to: end }.into());
        }
        Ok(Self { start, end })
    }

    pub fn single(sequence: u32) -> Self {
        Self {
            start: sequence,
            end: sequence,
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.start <= sequence && sequence <= self.end
    }

    pub fn overlaps(&self, other: &LedgerRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    /// Splits the range into consecutive chunks of at most `size` ledgers.
    pub fn chunks(&self, size: u32) -> Vec<LedgerRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        loop {
            let end = start.saturating_add(size - 1).min(self.end);
            out.push(LedgerRange { start, end });
            if end == self.end {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl fmt::Display for LedgerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
